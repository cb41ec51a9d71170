//! Build status polling and log following
//!
//! One loop drives the whole wait: every tick it makes at most one
//! log-stream attempt (while following is wanted and not yet satisfied)
//! and always fetches status, until a terminal phase, the overall
//! deadline, or an interrupt. The three wake sources are checked in a
//! fixed priority order (interrupt, then deadline, then the tick's work)
//! so the loop is deterministic and runs against a fake clock in tests.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::api::{ApiError, BuildService, BuildStatus, Phase};
use crate::retry::Clock;
use crate::signal::InterruptState;

/// Interval between polling ticks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Wait loop configuration.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Overall deadline for the build to reach a terminal phase.
    pub timeout: Duration,
    /// Tick interval; [`POLL_INTERVAL`] outside of tests.
    pub poll_interval: Duration,
    /// Follow the build log stream to stdout.
    pub follow_logs: bool,
    /// Report the artifact URL when the build completes.
    pub report_artifact: bool,
}

impl WaitConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: POLL_INTERVAL,
            follow_logs: false,
            report_artifact: false,
        }
    }
}

/// Terminal outcomes of the wait loop.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("build {name} failed: {message}")]
    BuildFailed { name: String, message: String },

    #[error("timed out after {0:?} waiting for build to finish")]
    TimedOut(Duration),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Log-follow progression: one attempt per tick until a stream is served
/// or following is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowState {
    Pending,
    Done,
    Disabled,
}

/// Poll `service` until the named build reaches a terminal phase.
///
/// Returns the final status on completion. Log bytes are copied to
/// `log_out`; status lines go to stderr and are suppressed entirely when
/// log-following was requested, to avoid interleaving the two streams.
pub fn wait_for_build(
    service: &dyn BuildService,
    name: &str,
    config: &WaitConfig,
    clock: &dyn Clock,
    interrupt: &InterruptState,
    log_out: &mut dyn Write,
) -> Result<BuildStatus, WaitError> {
    let deadline = clock.now() + config.timeout;
    let mut follow = if config.follow_logs {
        FollowState::Pending
    } else {
        FollowState::Disabled
    };
    let mut logs_unavailable_reported = false;
    let mut last_seen: Option<(Phase, String)> = None;

    loop {
        if interrupt.is_interrupted() {
            return Err(WaitError::Interrupted);
        }
        if clock.now() >= deadline {
            return Err(WaitError::TimedOut(config.timeout));
        }

        if follow == FollowState::Pending {
            match service.stream_logs(name, true) {
                Ok(stream) => {
                    follow = FollowState::Done;
                    copy_logs(stream, log_out);
                }
                Err(ApiError::LogsUnavailable) => {
                    if !logs_unavailable_reported {
                        eprintln!("build log not available yet, still trying");
                        logs_unavailable_reported = true;
                    }
                }
                Err(err) => {
                    eprintln!("following logs failed, continuing without: {err}");
                    follow = FollowState::Disabled;
                }
            }
        }

        let status = service.get_build(name)?;
        let seen = (status.phase, status.message.clone());
        if last_seen.as_ref() != Some(&seen) {
            if !config.follow_logs {
                eprintln!("build {}: {} - {}", status.name, status.phase, status.message);
            }
            last_seen = Some(seen);
        }

        match status.phase {
            Phase::Completed => {
                if config.report_artifact {
                    if let Some(ref url) = status.artifact_url {
                        println!("artifact available at {url}");
                    }
                }
                return Ok(status);
            }
            Phase::Failed => {
                return Err(WaitError::BuildFailed {
                    name: status.name,
                    message: status.message,
                });
            }
            _ => {}
        }

        clock.sleep(config.poll_interval);
    }
}

/// Copy the log stream to `out` until it ends. A broken stream is not
/// fatal to the wait: the build keeps being polled.
fn copy_logs(mut stream: Box<dyn Read + Send>, out: &mut dyn Write) {
    if let Err(err) = io::copy(&mut stream, out) {
        eprintln!("log stream ended with error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeClock, LogScript, MockBuildService};

    fn status(phase: Phase, message: &str) -> BuildStatus {
        BuildStatus {
            name: "demo".to_string(),
            phase,
            message: message.to_string(),
            ..Default::default()
        }
    }

    fn config(timeout_secs: u64) -> WaitConfig {
        WaitConfig {
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_secs(5),
            follow_logs: false,
            report_artifact: false,
        }
    }

    #[test]
    fn test_wait_completes_on_terminal_phase() {
        let service = MockBuildService::new();
        service.push_status(status(Phase::Accepted, "queued"));
        service.push_status(status(Phase::Building, "running"));
        service.push_status(status(Phase::Completed, "done"));

        let clock = FakeClock::new();
        let interrupt = InterruptState::new();
        let mut logs = Vec::new();
        let result = wait_for_build(
            &service,
            "demo",
            &config(600),
            &clock,
            &interrupt,
            &mut logs,
        )
        .unwrap();
        assert_eq!(result.phase, Phase::Completed);
        assert_eq!(service.get_build_calls(), 3);
    }

    #[test]
    fn test_wait_reports_build_failure_message() {
        let service = MockBuildService::new();
        service.push_status(status(Phase::Building, "running"));
        service.push_status(status(Phase::Failed, "qemu exited 1"));

        let clock = FakeClock::new();
        let interrupt = InterruptState::new();
        let mut logs = Vec::new();
        let err = wait_for_build(
            &service,
            "demo",
            &config(600),
            &clock,
            &interrupt,
            &mut logs,
        )
        .unwrap_err();
        match err {
            WaitError::BuildFailed { message, .. } => assert_eq!(message, "qemu exited 1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_wait_times_out_while_nonterminal() {
        let service = MockBuildService::new();
        service.push_status(status(Phase::Building, "running"));

        let clock = FakeClock::new();
        let interrupt = InterruptState::new();
        let mut logs = Vec::new();
        // 12 s deadline with a 5 s tick: polls at t=0, 5, 10, then expires.
        let err = wait_for_build(
            &service,
            "demo",
            &config(12),
            &clock,
            &interrupt,
            &mut logs,
        )
        .unwrap_err();
        assert!(matches!(err, WaitError::TimedOut(_)));
        assert_eq!(service.get_build_calls(), 3);
    }

    #[test]
    fn test_interrupt_beats_deadline_and_tick() {
        let service = MockBuildService::new();
        service.push_status(status(Phase::Building, "running"));

        let clock = FakeClock::new();
        let interrupt = InterruptState::new();
        interrupt.handle_signal();
        let mut logs = Vec::new();
        let err = wait_for_build(
            &service,
            "demo",
            &config(600),
            &clock,
            &interrupt,
            &mut logs,
        )
        .unwrap_err();
        assert!(matches!(err, WaitError::Interrupted));
        assert_eq!(service.get_build_calls(), 0);
    }

    #[test]
    fn test_follow_copies_logs_then_keeps_polling() {
        let service = MockBuildService::new();
        service.push_log_script(LogScript::Unavailable);
        service.push_log_script(LogScript::Stream(b"[1/2] compose\n[2/2] image\n".to_vec()));
        service.push_status(status(Phase::Building, "running"));
        service.push_status(status(Phase::Building, "running"));
        service.push_status(status(Phase::Completed, "done"));

        let clock = FakeClock::new();
        let interrupt = InterruptState::new();
        let mut logs = Vec::new();
        let mut cfg = config(600);
        cfg.follow_logs = true;
        let result = wait_for_build(&service, "demo", &cfg, &clock, &interrupt, &mut logs).unwrap();
        assert_eq!(result.phase, Phase::Completed);
        assert_eq!(logs, b"[1/2] compose\n[2/2] image\n");
        // One 503 attempt, one served stream, then no further attempts.
        assert_eq!(service.log_stream_calls(), 2);
    }

    #[test]
    fn test_follow_disabled_after_hard_error() {
        let service = MockBuildService::new();
        service.push_log_script(LogScript::Error);
        service.push_status(status(Phase::Building, "running"));
        service.push_status(status(Phase::Completed, "done"));

        let clock = FakeClock::new();
        let interrupt = InterruptState::new();
        let mut logs = Vec::new();
        let mut cfg = config(600);
        cfg.follow_logs = true;
        wait_for_build(&service, "demo", &cfg, &clock, &interrupt, &mut logs).unwrap();
        assert!(logs.is_empty());
        assert_eq!(service.log_stream_calls(), 1);
    }
}
