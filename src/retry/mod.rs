//! Parameterized retry with exponential backoff
//!
//! One backoff utility serves every retrying caller: pod lookup uses a
//! 5-step schedule with a 60 s cap, the outer artifact-download loop a
//! 3-step schedule with a 30 s cap. The delay for attempt `n` is
//! `min(cap, base * factor^n)` with a symmetric jitter fraction applied
//! on top.
//!
//! Time is reached through the [`Clock`] trait so retry behavior can be
//! tested against a fake clock without real sleeps.

use std::fmt::Display;
use std::time::{Duration, Instant};

/// Source of time for retry loops and the wait loop.
///
/// Production code uses [`SystemClock`]; tests inject a fake that advances
/// on `sleep` instead of blocking.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block for the given duration.
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Bounded exponential backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    /// Total number of attempts before giving up.
    pub steps: u32,
    /// Delay before the second attempt.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Jitter fraction in [0, 1); the delay is scaled by `1 ± jitter`.
    pub jitter: f64,
    /// Upper bound on the un-jittered delay.
    pub cap: Duration,
}

/// Schedule used while waiting for the artifact pod to become ready.
pub const POD_LOOKUP_SCHEDULE: BackoffSchedule = BackoffSchedule {
    steps: 5,
    base: Duration::from_secs(5),
    factor: 2.0,
    jitter: 0.1,
    cap: Duration::from_secs(60),
};

/// Schedule used by the top-level artifact download orchestration.
pub const DOWNLOAD_SCHEDULE: BackoffSchedule = BackoffSchedule {
    steps: 3,
    base: Duration::from_secs(2),
    factor: 2.0,
    jitter: 0.1,
    cap: Duration::from_secs(30),
};

impl BackoffSchedule {
    /// Delay before the attempt after `attempt` (0-based) has failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.mul_f64(self.factor.powi(attempt as i32));
        let capped = exp.min(self.cap);
        if self.jitter <= 0.0 {
            return capped;
        }
        let scale = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        capped.mul_f64(scale)
    }
}

/// Run `op` up to `schedule.steps` times, sleeping the schedule's delay
/// between attempts.
///
/// `op` receives the 0-based attempt index. The error of the final attempt
/// is returned; intermediate failures are logged to stderr with the retry
/// delay.
pub fn retry<T, E, F>(
    schedule: &BackoffSchedule,
    clock: &dyn Clock,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= schedule.steps {
                    return Err(err);
                }
                let delay = schedule.delay(attempt - 1);
                eprintln!(
                    "{} failed (attempt {}/{}): {}; retrying in {:.1}s",
                    what,
                    attempt,
                    schedule.steps,
                    err,
                    delay.as_secs_f64()
                );
                clock.sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(steps: u32) -> BackoffSchedule {
        BackoffSchedule {
            steps,
            base: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.0,
            cap: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_delay_grows_exponentially_without_jitter() {
        let schedule = no_jitter(5);
        assert_eq!(schedule.delay(0), Duration::from_secs(5));
        assert_eq!(schedule.delay(1), Duration::from_secs(10));
        assert_eq!(schedule.delay(2), Duration::from_secs(20));
        assert_eq!(schedule.delay(3), Duration::from_secs(40));
    }

    #[test]
    fn test_delay_is_capped() {
        let schedule = no_jitter(10);
        assert_eq!(schedule.delay(8), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_jitter_stays_in_band() {
        let schedule = BackoffSchedule {
            jitter: 0.1,
            ..no_jitter(5)
        };
        for _ in 0..100 {
            let d = schedule.delay(1).as_secs_f64();
            assert!((9.0..=11.0).contains(&d), "delay {} outside jitter band", d);
        }
    }

    #[test]
    fn test_retry_returns_first_success() {
        let clock = SystemClock;
        let schedule = BackoffSchedule {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            ..no_jitter(5)
        };
        let mut calls = 0;
        let result: Result<u32, String> = retry(&schedule, &clock, "op", |attempt| {
            calls += 1;
            if attempt < 2 {
                Err("not yet".to_string())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_exhausts_after_steps_attempts() {
        let clock = SystemClock;
        let schedule = BackoffSchedule {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            ..no_jitter(3)
        };
        let mut calls = 0;
        let result: Result<(), String> = retry(&schedule, &clock, "op", |_| {
            calls += 1;
            Err("still broken".to_string())
        });
        assert_eq!(result.unwrap_err(), "still broken");
        assert_eq!(calls, 3);
    }
}
