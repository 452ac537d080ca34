//! Cooperative cancellation for analysis requests.
//!
//! The core has no timeouts of its own. A caller hands each request a
//! `Budget`; long-running loops call `tick` per instruction and `check` per
//! block, which fail once the cancel flag is raised or the instruction limit
//! is reached.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ObjlensError, Result};

/// Instruction limit plus a shareable cancel flag.
#[derive(Debug, Default)]
pub struct Budget {
    max_instructions: Option<usize>,
    used: AtomicUsize,
    cancel: Arc<AtomicBool>,
}

impl Budget {
    pub fn new(max_instructions: Option<usize>) -> Self {
        Self {
            max_instructions,
            used: AtomicUsize::new(0),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A budget that never runs out and is never cancelled.
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Handle that cancels this budget when set.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Fail if the request was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ObjlensError::Cancelled);
        }
        Ok(())
    }

    /// Account for one decoded instruction.
    pub fn tick(&self) -> Result<()> {
        self.check()?;
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        match self.max_instructions {
            Some(limit) if used > limit => Err(ObjlensError::BudgetExceeded {
                resource: "instructions",
                used,
                limit,
            }),
            _ => Ok(()),
        }
    }
}
