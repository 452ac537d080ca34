//! Wall-clock limits for analysis requests.
//!
//! The core itself never times out. These helpers run a request on tokio's
//! blocking pool and, when the deadline passes, raise the request's cancel
//! flag so the worker stops at its next instruction or block boundary.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error};

use crate::analysis::pipeline::{Session, SymbolAnalysis};
use crate::budget::Budget;
use crate::error::{ObjlensError, Result};

/// Default limit for one symbol analysis, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub duration: Duration,
    /// Log an error when the deadline passes.
    pub log_warnings: bool,
    /// Request name for logging.
    pub operation_name: String,
}

impl TimeoutConfig {
    pub fn new(seconds: u64, operation: impl Into<String>) -> Self {
        Self {
            duration: Duration::from_secs(seconds),
            log_warnings: true,
            operation_name: operation.into(),
        }
    }

    pub fn default_timeout(operation: impl Into<String>) -> Self {
        Self::new(DEFAULT_TIMEOUT_SECONDS, operation)
    }
}

/// Await `future`, failing with `Timeout` once `config.duration` has passed.
pub async fn with_timeout<T, F>(config: &TimeoutConfig, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    debug!(
        operation = %config.operation_name,
        seconds = config.duration.as_secs(),
        "starting with timeout"
    );
    match timeout(config.duration, future).await {
        Ok(result) => result,
        Err(_) => {
            if config.log_warnings {
                error!(
                    operation = %config.operation_name,
                    seconds = config.duration.as_secs(),
                    "timed out"
                );
            }
            Err(ObjlensError::Timeout {
                seconds: config.duration.as_secs(),
            })
        }
    }
}

/// Run `work` on the blocking pool under `budget`, cancelling it on expiry.
///
/// The worker observes the cancel flag through `budget`; this returns as soon
/// as the deadline passes without waiting for it to wind down.
pub async fn run_blocking_with_timeout<T, F>(
    config: &TimeoutConfig,
    budget: Arc<Budget>,
    work: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Budget) -> Result<T> + Send + 'static,
{
    let cancel = budget.cancel_flag();
    let task = tokio::task::spawn_blocking(move || work(&budget));
    let joined = async move {
        task.await
            .map_err(|e| ObjlensError::Worker(e.to_string()))?
    };
    let result = with_timeout(config, joined).await;
    if matches!(result, Err(ObjlensError::Timeout { .. })) {
        cancel.store(true, Ordering::Relaxed);
    }
    result
}

/// `Session::analyze_symbol` with a wall-clock limit of `seconds`.
pub async fn analyze_with_timeout(
    session: Arc<Session>,
    name: &str,
    seconds: u64,
) -> Result<SymbolAnalysis> {
    let config = TimeoutConfig::new(seconds, format!("analyze {}", name));
    let budget = Arc::new(session.budget());
    let name = name.to_string();
    run_blocking_with_timeout(&config, budget, move |b| session.analyze_symbol(&name, b)).await
}
