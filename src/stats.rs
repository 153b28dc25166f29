use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Fatal = 4,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Running,
            2 => RunState::Completed,
            3 => RunState::Cancelled,
            4 => RunState::Fatal,
            _ => RunState::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Fatal
        )
    }
}

/// Counters for one batch run. Written only by the upload worker; the
/// foreground reads them for display and may see slightly stale values.
#[derive(Default)]
pub struct BatchProgress {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    state: AtomicU8,
}

/// Point-in-time copy of [`BatchProgress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub state: RunState,
}

impl ProgressSnapshot {
    pub fn attempted(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Share of rows attempted, 0-100
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.attempted() as f64 / self.total as f64 * 100.0
    }
}

impl BatchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn inc_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            state: self.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_zero() {
        let progress = BatchProgress::new();
        let snap = progress.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.succeeded, 0);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.state, RunState::Idle);
        assert_eq!(snap.percent(), 0.0);
    }

    #[test]
    fn mixed_operations() {
        let progress = BatchProgress::new();
        progress.set_total(4);
        progress.set_state(RunState::Running);
        progress.inc_succeeded();
        progress.inc_failed();
        progress.inc_succeeded();

        let snap = progress.snapshot();
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.attempted(), 3);
        assert_eq!(snap.percent(), 75.0);
        assert_eq!(snap.state, RunState::Running);
        assert!(!snap.state.is_terminal());
    }

    #[test]
    fn state_roundtrip() {
        let progress = BatchProgress::new();
        for state in [
            RunState::Idle,
            RunState::Running,
            RunState::Completed,
            RunState::Cancelled,
            RunState::Fatal,
        ] {
            progress.set_state(state);
            assert_eq!(progress.state(), state);
        }
        assert!(RunState::Cancelled.is_terminal());
    }
}
