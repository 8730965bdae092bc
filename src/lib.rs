//! Write-ahead log manager for a journaling filesystem.
//!
//! The crate appends transaction records to a circular on-disk log, commits
//! transactions in page-sized groups, and checkpoints the log so its space
//! can be reused. Redo after a crash is not part of the crate; the
//! [`log::RecordScanner`] only reads the record stream back for inspection.

#![warn(missing_docs)]

pub mod log;
pub mod primitives;
pub mod types;

pub use crate::log::{
    format, FlushLevel, Log, LogClient, LogManager, LogOptions, LogRecord, MetaUnit, Transaction,
};
pub use crate::types::{LogError, Lsn, PageNo, Result, TxId, UnitId};
