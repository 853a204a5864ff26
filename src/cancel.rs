//! Cooperative cancellation for a measurement run.
//!
//! One flag is created per run. The engine checks it at the top of every
//! temperature iteration and every relay-loop iteration; nothing is
//! interrupted mid-measurement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MeasError, MeasResult};

/// Shared cancellation flag. Cloning shares the underlying flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Whether both handles belong to the same run.
    pub fn same_as(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }

    /// Safe-point check: `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> MeasResult<()> {
        if self.is_cancelled() {
            Err(MeasError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());

        other.cancel();
        assert!(flag.is_cancelled());
        assert!(flag.check().unwrap_err().is_cancelled());
        assert!(flag.same_as(&other));
        assert!(!flag.same_as(&CancelFlag::new()));
    }
}
