//! Durable schedule ledger for Reveille.
//!
//! This crate owns the data model shared by the engine and the host:
//! - `NotificationRequest` and its id namespace
//! - The `ScheduleLedger` trait, the source of truth for what should be scheduled
//! - A file-backed ledger that survives process death and reboot
//! - A cross-process file lock shared with the host's other state files
//! - An in-memory ledger for tests and embedding

mod error;
mod ledger;
mod lock;
mod types;

pub use error::{InvalidRequest, LedgerError};
pub use ledger::{FileLedger, LEDGER_VERSION, MemoryLedger, ScheduleLedger};
pub use lock::{FileLock, lock_path};
pub use types::{NotificationId, NotificationRequest, Recurrence, next_daily_occurrence};
