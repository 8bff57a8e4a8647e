use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DaybookError;

/// Per-screen busy flag: at most one mutating action (send, summarize, save)
/// is outstanding at a time. Doubles as the screen's loading indicator.
#[derive(Debug, Default)]
pub struct ActionGuard {
    busy: AtomicBool,
}

impl ActionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Result<BusyGuard<'_>, DaybookError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard { flag: &self.busy })
            .map_err(|_| DaybookError::Busy)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Clears the flag when dropped, so every exit path ends the loading state.
#[must_use = "the action ends as soon as the guard is dropped"]
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_action_is_rejected_until_first_finishes() {
        let guard = ActionGuard::new();
        let first = guard.try_begin().expect("idle guard");
        assert!(guard.is_busy());
        assert!(matches!(guard.try_begin(), Err(DaybookError::Busy)));

        drop(first);
        assert!(!guard.is_busy());
        assert!(guard.try_begin().is_ok());
    }

    #[test]
    fn flag_clears_on_early_return() {
        fn failing_action(guard: &ActionGuard) -> Result<(), DaybookError> {
            let _busy = guard.try_begin()?;
            Err(DaybookError::Store(anyhow::anyhow!("boom")))
        }

        let guard = ActionGuard::new();
        assert!(failing_action(&guard).is_err());
        assert!(!guard.is_busy());
    }
}
