//! Error types for the engine.

use std::time::Duration;

use thiserror::Error;

use reveille_store::{InvalidRequest, LedgerError};

use crate::platform::PlatformError;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Ledger error.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Platform alarm service error.
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Rejected request.
    #[error("invalid request: {0}")]
    Invalid(#[from] InvalidRequest),
}

/// Why a recovery run did not complete.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The runtime context could not be acquired; the next health check retries.
    #[error("cold start failed: {0}")]
    ColdStart(String),

    /// Reconciliation ran past its deadline.
    #[error("recovery exceeded its {0:?} deadline")]
    Timeout(Duration),

    /// Reconciliation could not read the live trigger set.
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] EngineError),

    /// The reconciliation worker died.
    #[error("recovery worker aborted: {0}")]
    Worker(String),
}
