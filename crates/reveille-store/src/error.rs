//! Error types for the ledger.

use thiserror::Error;

/// Reasons a notification request is rejected before it reaches the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    /// Negative ids belong to the engine's own triggers.
    #[error("id {0} is in the reserved namespace")]
    ReservedId(i32),

    /// Daily recurrence outside of a 24h clock.
    #[error("invalid time of day {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },

    /// Caller ids near `i32::MAX` have no room for a backup slot.
    #[error("id {0} has no backup slot")]
    NoBackupSlot(i32),

    /// Fire times are stored and carried with millisecond precision.
    #[error("fire time {0} is finer than a millisecond")]
    SubMillisecond(chrono::DateTime<chrono::Utc>),
}

/// Errors that can occur in ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The ledger file was written by an incompatible version.
    #[error("unsupported ledger version: {0}")]
    UnsupportedVersion(u32),

    /// A stored record failed validation.
    #[error("invalid record: {0}")]
    Invalid(#[from] InvalidRequest),

    /// The backing store cannot be reached right now.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}
