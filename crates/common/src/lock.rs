//! The per-unit mutual-exclusion gate. Every relay change and every
//! persisted state change happens while one of its guards is alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use crate::error::ControlError;

/// Proof that the caller holds the unit lock. Owned so it can move into a
/// spawned background motion.
pub type UnitGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct UnitLock {
    inner: Arc<Mutex<()>>,
}

impl UnitLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounded acquisition. Gives up with `LockBusy` after `wait`.
    pub async fn acquire(&self, wait: Duration) -> Result<UnitGuard, ControlError> {
        timeout(wait, Arc::clone(&self.inner).lock_owned())
            .await
            .map_err(|_| ControlError::LockBusy)
    }

    /// Unbounded acquisition for bookkeeping that must not be skipped.
    pub async fn acquire_blocking(&self) -> UnitGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
