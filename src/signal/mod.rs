//! Interrupt handling for the wait loop
//!
//! On the first SIGINT/SIGTERM the wait loop is cancelled at its next
//! check; a second signal exits the process immediately. The state is a
//! pair of atomics shared with the `ctrlc` handler thread, polled by the
//! wait loop and the retry sleeps. An in-flight tar transfer is never
//! interrupted mid-stream; it runs to completion or error.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Exit code reported when a run is interrupted.
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Action to take for a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel the wait loop at its next check.
    CancelWait,
    /// Second signal: exit the process immediately.
    ImmediateExit,
    /// Third and later signals are ignored.
    Ignore,
}

/// Shared interrupt state.
#[derive(Debug, Default)]
pub struct InterruptState {
    interrupted: AtomicBool,
    signal_count: AtomicU8,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the first signal has been received.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Number of signals received so far.
    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record one received signal and return the action it triggers.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        match count {
            0 => {
                self.interrupted.store(true, Ordering::SeqCst);
                SignalAction::CancelWait
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }
}

/// Install the process signal handler backing `state`.
///
/// The handler only flips atomics and, on a second signal, exits; all
/// cancellation work happens on the main thread when it observes the flag.
pub fn install(state: Arc<InterruptState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        SignalAction::CancelWait => {
            eprintln!("\ninterrupt received, cancelling (press again to exit immediately)");
        }
        SignalAction::ImmediateExit => {
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
        SignalAction::Ignore => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_cancels() {
        let state = InterruptState::new();
        assert!(!state.is_interrupted());
        assert_eq!(state.handle_signal(), SignalAction::CancelWait);
        assert!(state.is_interrupted());
    }

    #[test]
    fn test_second_signal_exits_immediately() {
        let state = InterruptState::new();
        state.handle_signal();
        assert_eq!(state.handle_signal(), SignalAction::ImmediateExit);
    }

    #[test]
    fn test_later_signals_ignored() {
        let state = InterruptState::new();
        state.handle_signal();
        state.handle_signal();
        assert_eq!(state.handle_signal(), SignalAction::Ignore);
        assert_eq!(state.signal_count(), 3);
    }
}
