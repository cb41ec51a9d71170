//! Cluster access: pod discovery and the remote-exec channel
//!
//! Everything the transfer engine needs from the cluster sits behind the
//! [`Cluster`] trait: listing pods by label selector and executing one-shot
//! or streaming commands inside a container. The production implementation
//! shells out to `kubectl` with piped stdio; tests use the in-process mock
//! in `crate::mock`.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::retry::{retry, BackoffSchedule, Clock};

/// Label selector matching the artifact-serving pod for a build.
pub fn artifact_selector(build_name: &str) -> String {
    format!("app=podbuild-artifact,build={build_name}")
}

/// Container inside the artifact pod that serves build output.
pub const ARTIFACT_CONTAINER: &str = "fileserver";

/// Directory inside the artifact container where build output is published.
pub const ARTIFACT_ROOT: &str = "/artifacts";

/// A pod as returned by the cluster API. Only the fields the locator needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    pub metadata: PodMetadata,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default, rename = "containerStatuses")]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

impl Pod {
    /// True when the pod is Running and `container` reports ready.
    pub fn is_ready(&self, container: &str) -> bool {
        self.status.phase == "Running"
            && self
                .status
                .container_statuses
                .iter()
                .any(|c| c.name == container && c.ready)
    }
}

/// Target of an exec operation.
#[derive(Debug, Clone)]
pub struct ExecTarget {
    pub pod: String,
    pub container: String,
}

/// Result of an exec operation that ran to process exit.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    /// Stdout as trimmed UTF-8 text.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Producer side of a streaming upload: called with the remote process's
/// stdin and expected to write the whole stream before returning.
pub type InputProducer = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>;

/// Cluster access errors.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse pod list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("upload producer thread panicked")]
    ProducerPanicked,

    #[error("no ready pod found for selector {0}")]
    NoReadyPod(String),
}

/// Abstract cluster client.
///
/// Exec methods return `Ok(ExecOutput)` whenever the remote process ran to
/// exit, even with a non-zero status; callers inspect `success` and
/// `stderr` to build their own errors. Errors are reserved for failures to
/// run the command at all.
pub trait Cluster: Send + Sync {
    /// List pods in the client's namespace matching a label selector.
    fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Run a command to completion, capturing stdout and stderr.
    fn run(&self, target: &ExecTarget, command: &[&str]) -> Result<ExecOutput, ClusterError>;

    /// Run a command with its stdin fed by `producer` from a separate
    /// thread. The pipe between producer and process bounds memory: the
    /// producer blocks whenever the remote side lags.
    fn run_with_input(
        &self,
        target: &ExecTarget,
        command: &[&str],
        producer: InputProducer,
    ) -> Result<ExecOutput, ClusterError>;

    /// Run a command with its stdout streamed into `sink`; stderr is
    /// captured.
    fn run_with_output(
        &self,
        target: &ExecTarget,
        command: &[&str],
        sink: &mut dyn Write,
    ) -> Result<ExecOutput, ClusterError>;
}

/// Locate a ready artifact pod, retrying under `schedule`.
///
/// Listing errors are logged and retried like an empty result; after the
/// schedule is exhausted the operation fails with
/// [`ClusterError::NoReadyPod`].
pub fn find_ready_pod(
    cluster: &dyn Cluster,
    selector: &str,
    container: &str,
    schedule: &BackoffSchedule,
    clock: &dyn Clock,
) -> Result<Pod, ClusterError> {
    retry(schedule, clock, "pod lookup", |_| {
        let pods = match cluster.list_pods(selector) {
            Ok(pods) => pods,
            Err(err) => {
                eprintln!("listing pods failed: {err}");
                return Err(ClusterError::NoReadyPod(selector.to_string()));
            }
        };
        pods.into_iter()
            .find(|pod| pod.is_ready(container))
            .ok_or_else(|| ClusterError::NoReadyPod(selector.to_string()))
    })
}

/// `kubectl`-backed cluster client.
///
/// Every invocation re-reads the kubeconfig, so constructing a fresh client
/// per download attempt also re-resolves credentials that may have expired.
pub struct KubectlCluster {
    namespace: String,
    kubeconfig: Option<PathBuf>,
}

impl KubectlCluster {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            kubeconfig: None,
        }
    }

    pub fn with_kubeconfig(mut self, path: PathBuf) -> Self {
        self.kubeconfig = Some(path);
        self
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(ref kubeconfig) = self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.arg("-n").arg(&self.namespace);
        cmd
    }

    fn exec_command(&self, target: &ExecTarget, command: &[&str], stdin: bool) -> Command {
        let mut cmd = self.kubectl();
        cmd.arg("exec");
        if stdin {
            cmd.arg("-i");
        }
        cmd.arg(&target.pod)
            .arg("-c")
            .arg(&target.container)
            .arg("--")
            .args(command);
        cmd
    }

    fn spawn(mut cmd: Command) -> Result<std::process::Child, ClusterError> {
        cmd.spawn().map_err(|source| ClusterError::Spawn {
            tool: "kubectl".to_string(),
            source,
        })
    }
}

impl Cluster for KubectlCluster {
    fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let output = self
            .kubectl()
            .args(["get", "pods", "-l", selector, "-o", "json"])
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| ClusterError::Spawn {
                tool: "kubectl".to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ClusterError::CommandFailed {
                command: "kubectl get pods".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let list: PodList = serde_json::from_slice(&output.stdout)?;
        Ok(list.items)
    }

    fn run(&self, target: &ExecTarget, command: &[&str]) -> Result<ExecOutput, ClusterError> {
        let output = self
            .exec_command(target, command, false)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| ClusterError::Spawn {
                tool: "kubectl".to_string(),
                source,
            })?;

        Ok(ExecOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn run_with_input(
        &self,
        target: &ExecTarget,
        command: &[&str],
        producer: InputProducer,
    ) -> Result<ExecOutput, ClusterError> {
        let mut cmd = self.exec_command(target, command, true);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = Self::spawn(cmd)?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            ClusterError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "stdin not piped"))
        })?;
        let handle = std::thread::spawn(move || {
            let result = producer(&mut stdin);
            drop(stdin);
            result
        });

        let output = child.wait_with_output()?;
        let produced = handle.join().map_err(|_| ClusterError::ProducerPanicked)?;

        // A remote failure usually surfaces on both sides; the remote
        // stderr is the more useful report, so it wins.
        if !output.status.success() {
            return Ok(ExecOutput {
                success: false,
                stdout: output.stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        produced?;

        Ok(ExecOutput {
            success: true,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn run_with_output(
        &self,
        target: &ExecTarget,
        command: &[&str],
        sink: &mut dyn Write,
    ) -> Result<ExecOutput, ClusterError> {
        let mut cmd = self.exec_command(target, command, false);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = Self::spawn(cmd)?;

        // Drain stderr on its own thread so a chatty remote process can't
        // deadlock against the stdout copy.
        let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
            ClusterError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stderr not piped",
            ))
        })?;
        let stderr_handle = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf);
            buf
        });

        let mut stdout = child.stdout.take().ok_or_else(|| {
            ClusterError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdout not piped",
            ))
        })?;
        let copy_result = io::copy(&mut stdout, sink);
        drop(stdout);

        let status = child.wait()?;
        let stderr = stderr_handle
            .join()
            .map_err(|_| ClusterError::ProducerPanicked)?;
        copy_result?;

        Ok(ExecOutput {
            success: status.success(),
            stdout: Vec::new(),
            stderr: stderr.trim().to_string(),
        })
    }
}
