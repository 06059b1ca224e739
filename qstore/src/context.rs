use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::err::{DeviceError, Result};

/// Cancellation signal shared between a caller and the operations it started.
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        Ok(())
    }
}
