//! podbuild CLI
//!
//! Entry point for the `podbuild` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use podbuild::api::{self, BuildRequest, BuildService, BuildStatus, HttpBuildService, Phase};
use podbuild::cluster::{
    artifact_selector, find_ready_pod, ExecTarget, KubectlCluster, ARTIFACT_CONTAINER,
    ARTIFACT_ROOT,
};
use podbuild::config::{Overrides, Settings};
use podbuild::manifest;
use podbuild::retry::{retry, SystemClock, DOWNLOAD_SCHEDULE, POD_LOOKUP_SCHEDULE};
use podbuild::signal::{self, InterruptState, EXIT_CODE_INTERRUPTED};
use podbuild::transfer::{TransferError, TransferSession};
use podbuild::wait::{wait_for_build, WaitConfig, WaitError};

/// Exit code for fatal errors.
const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "podbuild")]
#[command(about = "Remote OS-image builds in a cluster", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a build, optionally wait for it and download its artifact
    Build(BuildArgs),

    /// Download the artifact of a completed build
    Download(DownloadArgs),

    /// List builds known to the service
    List(ListArgs),
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Build service URL (defaults to $PODBUILD_SERVER)
    #[arg(long)]
    server_url: Option<String>,

    /// Cluster namespace of the artifact pods
    #[arg(long)]
    namespace: Option<String>,

    /// Path to config file (default: ~/.config/podbuild/config.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct BuildArgs {
    /// Path to the build manifest
    #[arg(long, short = 'm')]
    manifest: PathBuf,

    /// Build name (default: the manifest file stem)
    #[arg(long)]
    name: Option<String>,

    /// Distribution to build
    #[arg(long, default_value = "base")]
    distro: String,

    /// Build target
    #[arg(long, default_value = "qemu")]
    target: String,

    /// Target architecture
    #[arg(long, default_value = std::env::consts::ARCH)]
    arch: String,

    /// Artifact export format
    #[arg(long, default_value = "image")]
    export_format: String,

    /// Build mode
    #[arg(long, default_value = "image")]
    mode: String,

    /// KEY=VALUE definition passed to the builder (repeatable)
    #[arg(long = "define", short = 'd')]
    defines: Vec<String>,

    /// Extra argument passed through to the builder (repeatable)
    #[arg(long = "builder-arg")]
    builder_args: Vec<String>,

    /// Serve the finished artifact from an artifact pod
    #[arg(long)]
    serve_artifact: bool,

    /// Expose a route to the artifact pod
    #[arg(long)]
    expose_route: bool,

    /// Wait for the build to reach a terminal phase
    #[arg(long)]
    wait: bool,

    /// Follow the build log while waiting (implies --wait)
    #[arg(long)]
    follow: bool,

    /// Download the artifact when the build completes (implies --wait)
    #[arg(long)]
    download: bool,

    /// Directory for downloaded artifacts
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,

    /// Overall wait deadline in minutes
    #[arg(long)]
    timeout_minutes: Option<u64>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct DownloadArgs {
    /// Name of the build whose artifact to download
    name: String,

    /// Directory for downloaded artifacts
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct ListArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Download(args) => run_download(args),
        Commands::List(args) => run_list(args),
    }
}

fn run_build(args: BuildArgs) {
    let overrides = Overrides {
        config_path: args.common.config.clone(),
        server_url: args.common.server_url.clone(),
        namespace: args.common.namespace.clone(),
        output_dir: args.output_dir.clone(),
        timeout_minutes: args.timeout_minutes,
        expose_route: args.expose_route.then_some(true),
    };
    let settings = resolve_settings(&overrides);

    let manifest_text = match std::fs::read_to_string(&args.manifest) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error reading manifest {}: {}", args.manifest.display(), e);
            process::exit(EXIT_FAILURE);
        }
    };

    let name = args.name.clone().unwrap_or_else(|| {
        args.manifest
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let references =
        match manifest::scan_file_references(&manifest_text, &settings.allowed_source_roots) {
            Ok(refs) => refs,
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(EXIT_FAILURE);
            }
        };

    let manifest_file_name = args
        .manifest
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let request = BuildRequest {
        name: name.clone(),
        manifest: manifest_text,
        manifest_file_name,
        distro: args.distro,
        target: args.target,
        architecture: args.arch,
        export_format: args.export_format,
        mode: args.mode,
        defines: args.defines,
        builder_args: args.builder_args,
        serve_artifact: args.serve_artifact || args.download,
        expose_route: settings.expose_route,
    };

    let service = connect_service(&settings);
    let status = match api::submit(&service, &request, &references) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    println!("build {} {}: {}", status.name, status.phase, status.message);
    if !references.is_empty() {
        println!("uploaded {} file(s)", references.len());
    }

    if !(args.wait || args.follow || args.download) {
        return;
    }

    let interrupt = Arc::new(InterruptState::new());
    if let Err(e) = signal::install(Arc::clone(&interrupt)) {
        eprintln!("warning: could not install signal handler: {e}");
    }

    let clock = SystemClock;
    let mut wait_config = WaitConfig::new(settings.wait_timeout);
    wait_config.follow_logs = args.follow;
    wait_config.report_artifact = request.serve_artifact;

    let mut stdout = std::io::stdout();
    let status = match wait_for_build(&service, &name, &wait_config, &clock, &interrupt, &mut stdout)
    {
        Ok(status) => status,
        Err(WaitError::Interrupted) => {
            eprintln!("wait cancelled");
            process::exit(EXIT_CODE_INTERRUPTED);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    println!("build {} completed", status.name);

    if args.download {
        download_artifact(&settings, &status);
    }
}

fn run_download(args: DownloadArgs) {
    let overrides = Overrides {
        config_path: args.common.config.clone(),
        server_url: args.common.server_url.clone(),
        namespace: args.common.namespace.clone(),
        output_dir: args.output_dir.clone(),
        ..Default::default()
    };
    let settings = resolve_settings(&overrides);
    let service = connect_service(&settings);

    let status = match service.get_build(&args.name) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    };
    if status.phase != Phase::Completed {
        eprintln!(
            "Error: build {} is not completed (phase {})",
            status.name, status.phase
        );
        process::exit(EXIT_FAILURE);
    }

    download_artifact(&settings, &status);
}

/// Fetch the artifact of a completed build from its artifact pod.
///
/// The outer retry re-creates the cluster client per attempt so stale
/// credentials from a long wait are re-resolved.
fn download_artifact(settings: &Settings, status: &BuildStatus) {
    let Some(file_name) = status.artifact_file_name.as_deref() else {
        eprintln!("Error: build {} reports no artifact file", status.name);
        process::exit(EXIT_FAILURE);
    };
    let remote_path = format!("{ARTIFACT_ROOT}/{file_name}");
    let selector = artifact_selector(&status.name);
    let clock = SystemClock;

    let result = retry(&DOWNLOAD_SCHEDULE, &clock, "artifact download", |_| {
        let cluster = KubectlCluster::new(&settings.namespace);
        let pod = find_ready_pod(
            &cluster,
            &selector,
            ARTIFACT_CONTAINER,
            &POD_LOOKUP_SCHEDULE,
            &clock,
        )
        .map_err(TransferError::from)?;
        let session = TransferSession::new(
            &cluster,
            ExecTarget {
                pod: pod.metadata.name,
                container: ARTIFACT_CONTAINER.to_string(),
            },
        );
        session.download(&remote_path, &settings.output_dir)
    });

    match result {
        Ok(path) => println!("downloaded artifact to {}", path.display()),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    }
}

fn run_list(args: ListArgs) {
    let overrides = Overrides {
        config_path: args.common.config.clone(),
        server_url: args.common.server_url.clone(),
        namespace: args.common.namespace.clone(),
        ..Default::default()
    };
    let settings = resolve_settings(&overrides);
    let service = connect_service(&settings);

    let builds = match service.list_builds() {
        Ok(builds) => builds,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&builds) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing output: {e}");
                process::exit(EXIT_FAILURE);
            }
        }
        return;
    }

    if builds.is_empty() {
        println!("No builds found.");
        return;
    }

    println!(
        "{:<24} {:<12} {:<20} MESSAGE",
        "NAME", "PHASE", "CREATED"
    );
    for build in builds {
        let created = build
            .created
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<12} {:<20} {}",
            build.name,
            build.phase.as_str(),
            created,
            build.message
        );
    }
}

fn resolve_settings(overrides: &Overrides) -> Settings {
    match Settings::resolve(overrides) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    }
}

fn connect_service(settings: &Settings) -> HttpBuildService {
    if let Err(e) = settings.validate() {
        eprintln!("Error: {e}");
        process::exit(EXIT_FAILURE);
    }
    match HttpBuildService::new(&settings.server_url) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(EXIT_FAILURE);
        }
    }
}
