//! In-process mocks for tests
//!
//! Mirrors the production seams without a network or a cluster:
//! [`MockBuildService`] is a scripted build service, [`MockCluster`] backs
//! the exec channel with a temporary directory that stands in for the
//! remote container filesystem, and [`FakeClock`] advances instantly on
//! `sleep` so wait and retry loops run deterministically.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::api::{ApiError, BuildRequest, BuildService, BuildStatus};
use crate::cluster::{Cluster, ClusterError, ExecOutput, ExecTarget, InputProducer, Pod};
use crate::manifest::FileReference;
use crate::retry::Clock;

/// Clock that advances its notion of "now" on `sleep` instead of blocking.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<Instant>,
    slept: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            slept: Mutex::new(Vec::new()),
        }
    }

    /// Durations passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
        self.slept.lock().unwrap().push(duration);
    }
}

/// One scripted response to a `stream_logs` call.
pub enum LogScript {
    /// Serve these bytes as the log stream.
    Stream(Vec<u8>),
    /// Respond as a 503 would: logs not available yet.
    Unavailable,
    /// Respond with a hard server error.
    Error,
}

/// Scripted build service.
///
/// `get_build` consumes its status script one entry per call and repeats
/// the final entry once the script is exhausted.
#[derive(Default)]
pub struct MockBuildService {
    statuses: Mutex<VecDeque<BuildStatus>>,
    log_scripts: Mutex<VecDeque<LogScript>>,
    created: Mutex<Vec<BuildRequest>>,
    uploads: Mutex<Vec<(String, Vec<FileReference>)>>,
    listed: Mutex<Vec<BuildStatus>>,
    get_calls: AtomicU32,
    log_calls: AtomicU32,
}

impl MockBuildService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: BuildStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn push_log_script(&self, script: LogScript) {
        self.log_scripts.lock().unwrap().push_back(script);
    }

    pub fn set_build_list(&self, builds: Vec<BuildStatus>) {
        *self.listed.lock().unwrap() = builds;
    }

    pub fn created_builds(&self) -> Vec<BuildRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<FileReference>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn get_build_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn log_stream_calls(&self) -> u32 {
        self.log_calls.load(Ordering::SeqCst)
    }
}

impl BuildService for MockBuildService {
    fn create_build(&self, request: &BuildRequest) -> Result<BuildStatus, ApiError> {
        self.created.lock().unwrap().push(request.clone());
        Ok(BuildStatus {
            name: request.name.clone(),
            phase: crate::api::Phase::Accepted,
            message: "build accepted".to_string(),
            ..Default::default()
        })
    }

    fn get_build(&self, name: &str) -> Result<BuildStatus, ApiError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        match statuses.len() {
            0 => Err(ApiError::Status {
                status: 404,
                body: format!("build {name} not found"),
            }),
            1 => Ok(statuses.front().cloned().unwrap_or_default()),
            _ => Ok(statuses.pop_front().unwrap_or_default()),
        }
    }

    fn list_builds(&self) -> Result<Vec<BuildStatus>, ApiError> {
        Ok(self.listed.lock().unwrap().clone())
    }

    fn upload_files(&self, name: &str, files: &[FileReference]) -> Result<(), ApiError> {
        for file in files {
            if !file.source_path.exists() {
                return Err(ApiError::MissingFile(file.source_path.clone()));
            }
        }
        self.uploads
            .lock()
            .unwrap()
            .push((name.to_string(), files.to_vec()));
        Ok(())
    }

    fn stream_logs(&self, _name: &str, _follow: bool) -> Result<Box<dyn Read + Send>, ApiError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        match self.log_scripts.lock().unwrap().pop_front() {
            Some(LogScript::Stream(bytes)) => Ok(Box::new(Cursor::new(bytes))),
            Some(LogScript::Error) => Err(ApiError::Status {
                status: 500,
                body: "log streamer crashed".to_string(),
            }),
            Some(LogScript::Unavailable) | None => Err(ApiError::LogsUnavailable),
        }
    }
}

/// Cluster mock backed by a temporary directory.
///
/// Remote absolute paths map under the temp root, and the handful of
/// command shapes the transfer engine issues are interpreted in-process;
/// the tar streams are real, so round-trip tests exercise the actual wire
/// format.
pub struct MockCluster {
    root: tempfile::TempDir,
    pod_lists: Mutex<VecDeque<Result<Vec<Pod>, String>>>,
    pod_list_calls: AtomicU32,
    truncate_downloads_to: Mutex<Option<u64>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            root: tempfile::TempDir::new().expect("create mock cluster root"),
            pod_lists: Mutex::new(VecDeque::new()),
            pod_list_calls: AtomicU32::new(0),
            truncate_downloads_to: Mutex::new(None),
        }
    }

    /// Map a remote absolute path under the mock root.
    pub fn resolve(&self, remote: &str) -> PathBuf {
        self.root.path().join(remote.trim_start_matches('/'))
    }

    /// Seed a file on the "remote" side.
    pub fn seed_file(&self, remote: &str, content: &[u8]) {
        let path = self.resolve(remote);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create remote parent");
        }
        std::fs::write(path, content).expect("seed remote file");
    }

    /// Queue one pod-list response.
    pub fn push_pod_list(&self, pods: Vec<Pod>) {
        self.pod_lists.lock().unwrap().push_back(Ok(pods));
    }

    /// Queue one pod-list failure.
    pub fn fail_next_pod_list(&self, stderr: &str) {
        self.pod_lists
            .lock()
            .unwrap()
            .push_back(Err(stderr.to_string()));
    }

    pub fn pod_list_calls(&self) -> u32 {
        self.pod_list_calls.load(Ordering::SeqCst)
    }

    /// Make `cat` serve only the first `n` bytes, simulating a transfer
    /// cut off mid-stream.
    pub fn truncate_downloads_to(&self, n: u64) {
        *self.truncate_downloads_to.lock().unwrap() = Some(n);
    }

    fn failure(stderr: &str) -> ExecOutput {
        ExecOutput {
            success: false,
            stdout: Vec::new(),
            stderr: stderr.to_string(),
        }
    }

    fn success_with(stdout: Vec<u8>) -> ExecOutput {
        ExecOutput {
            success: true,
            stdout,
            stderr: String::new(),
        }
    }

    /// Pull the single-quoted path out of a classification script.
    fn quoted_path(script: &str) -> Option<&str> {
        let start = script.find('\'')? + 1;
        let end = script[start..].find('\'')? + start;
        Some(&script[start..end])
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster for MockCluster {
    fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        self.pod_list_calls.fetch_add(1, Ordering::SeqCst);
        match self.pod_lists.lock().unwrap().pop_front() {
            Some(Ok(pods)) => Ok(pods),
            Some(Err(stderr)) => Err(ClusterError::CommandFailed {
                command: format!("list pods -l {selector}"),
                stderr,
            }),
            None => Ok(Vec::new()),
        }
    }

    fn run(&self, _target: &ExecTarget, command: &[&str]) -> Result<ExecOutput, ClusterError> {
        match command {
            ["mkdir", "-p", dir] => {
                std::fs::create_dir_all(self.resolve(dir))?;
                Ok(Self::success_with(Vec::new()))
            }
            ["sh", "-c", script] => {
                let Some(remote) = Self::quoted_path(script) else {
                    return Ok(Self::failure("sh: malformed script"));
                };
                let path = self.resolve(remote);
                let kind = if path.is_dir() {
                    "directory"
                } else if path.is_file() {
                    "file"
                } else {
                    "notfound"
                };
                Ok(Self::success_with(format!("{kind}\n").into_bytes()))
            }
            ["stat", "-c", "%s", remote] => match std::fs::metadata(self.resolve(remote)) {
                Ok(metadata) => Ok(Self::success_with(
                    format!("{}\n", metadata.len()).into_bytes(),
                )),
                Err(_) => Ok(Self::failure(&format!(
                    "stat: cannot statx '{remote}': No such file or directory"
                ))),
            },
            _ => Ok(Self::failure(&format!(
                "sh: {}: command not found",
                command.first().unwrap_or(&"")
            ))),
        }
    }

    fn run_with_input(
        &self,
        _target: &ExecTarget,
        command: &[&str],
        producer: InputProducer,
    ) -> Result<ExecOutput, ClusterError> {
        let mut stream = Vec::new();
        producer(&mut stream)?;

        match command {
            ["tar", "-xf", "-", "-C", dir] => {
                let dest = self.resolve(dir);
                if !dest.is_dir() {
                    return Ok(Self::failure(&format!(
                        "tar: {dir}: Cannot chdir: No such file or directory"
                    )));
                }
                let mut archive = tar::Archive::new(stream.as_slice());
                match archive.unpack(&dest) {
                    Ok(()) => Ok(Self::success_with(Vec::new())),
                    Err(err) => Ok(Self::failure(&format!("tar: {err}"))),
                }
            }
            _ => Ok(Self::failure("unexpected streaming command")),
        }
    }

    fn run_with_output(
        &self,
        _target: &ExecTarget,
        command: &[&str],
        sink: &mut dyn Write,
    ) -> Result<ExecOutput, ClusterError> {
        match command {
            ["cat", remote] => {
                let path = self.resolve(remote);
                let Ok(content) = std::fs::read(&path) else {
                    return Ok(Self::failure(&format!(
                        "cat: {remote}: No such file or directory"
                    )));
                };
                let limit = self.truncate_downloads_to.lock().unwrap();
                let serve = match *limit {
                    Some(n) => &content[..content.len().min(n as usize)],
                    None => &content[..],
                };
                sink.write_all(serve)?;
                Ok(Self::success_with(Vec::new()))
            }
            ["tar", "-cf", "-", "-C", dir, "."] => {
                let source = self.resolve(dir);
                if !source.is_dir() {
                    return Ok(Self::failure(&format!(
                        "tar: {dir}: Cannot chdir: No such file or directory"
                    )));
                }
                if let Err(err) = archive_dir(&source, sink) {
                    return Ok(Self::failure(&format!("tar: {err}")));
                }
                Ok(Self::success_with(Vec::new()))
            }
            _ => Ok(Self::failure("unexpected streaming command")),
        }
    }
}

/// Archive a directory the way the remote `tar -cf - -C <dir> .` would.
fn archive_dir(source: &Path, sink: &mut dyn Write) -> io::Result<()> {
    let mut builder = tar::Builder::new(sink);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source)?;
    builder.finish()
}
