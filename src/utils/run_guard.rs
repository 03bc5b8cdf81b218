use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether a guarded operation is currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
        }
    }
}

/// Single-flight token for a long-running operation.
///
/// `try_start` flips Idle to Running atomically and hands back a guard that
/// flips it back when dropped, so early returns and errors release it too.
/// The token is process-local; it does not coordinate separate processes.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when another invocation holds the token.
    pub fn try_start(&self) -> Option<RunTicket> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunTicket {
                running: self.running.clone(),
            })
    }

    pub fn state(&self) -> RunState {
        if self.running.load(Ordering::Acquire) {
            RunState::Running
        } else {
            RunState::Idle
        }
    }
}

/// Held for the duration of one guarded run.
#[derive(Debug)]
pub struct RunTicket {
    running: Arc<AtomicBool>,
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let guard = RunGuard::new();
        assert_eq!(guard.state(), RunState::Idle);

        let ticket = guard.try_start().expect("first start succeeds");
        assert_eq!(guard.state(), RunState::Running);
        assert!(guard.try_start().is_none());

        drop(ticket);
        assert_eq!(guard.state(), RunState::Idle);
        assert!(guard.try_start().is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let guard = RunGuard::new();
        let other = guard.clone();
        let _ticket = guard.try_start().unwrap();
        assert_eq!(other.state(), RunState::Running);
        assert!(other.try_start().is_none());
    }

    #[test]
    fn test_released_on_error_path() {
        fn failing(guard: &RunGuard) -> Result<(), &'static str> {
            let _ticket = guard.try_start().ok_or("busy")?;
            Err("boom")
        }

        let guard = RunGuard::new();
        assert_eq!(failing(&guard), Err("boom"));
        assert_eq!(guard.state(), RunState::Idle);
    }
}
