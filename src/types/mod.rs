#![forbid(unsafe_code)]

//! Shared identifiers and the crate error type.

use std::fmt;

mod checksum;

pub use checksum::{crc32_excluding, page_crc32, Checksum, Crc32};

/// Log sequence number: `(page sequence << 12) | offset within the page`.
///
/// The page sequence never resets, so LSNs grow monotonically across the
/// circular wrap of the physical log.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Physical page number inside the log region.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

/// Transaction identifier assigned by the transaction manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

/// Identifier of an in-memory metadata unit (a metapage, an inode block, ...).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct UnitId(pub u64);

impl Lsn {
    /// Builds an LSN from a page sequence number and an offset inside that page.
    pub const fn from_parts(sequence: u64, offset: usize) -> Self {
        Lsn((sequence << crate::log::L2_LOG_PAGE_SIZE) | offset as u64)
    }

    /// Page sequence number this LSN falls on.
    pub const fn sequence(self) -> u64 {
        self.0 >> crate::log::L2_LOG_PAGE_SIZE
    }

    /// Offset inside the page.
    pub const fn offset(self) -> usize {
        (self.0 & (crate::log::LOG_PAGE_SIZE as u64 - 1)) as usize
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence(), self.offset())
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the log manager.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// Underlying device error.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The previous session did not shut the log down cleanly.
    #[error("log was not shut down cleanly; run redo before mounting")]
    NeedsRecovery,
    /// Appending would overwrite log pages still needed for recovery.
    #[error("log full: appending would overwrite records still needed for recovery")]
    LogFull,
    /// The page write carrying this transaction's commit record failed.
    #[error("commit of transaction {0} failed: log page write error")]
    CommitFailed(TxId),
    /// A synchronous page write failed.
    #[error("log page {0} write failed")]
    WriteFailed(PageNo),
    /// Outstanding commits or dirty metadata did not drain.
    #[error("log drain incomplete: {0}")]
    DrainIncomplete(&'static str),
    /// The superblock's active-filesystem table is full.
    #[error("too many filesystems share this log")]
    TooManyFilesystems,
    /// The log is not open.
    #[error("log is closed")]
    Closed,
    /// Requested entity does not exist.
    #[error("not found")]
    NotFound,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LogError>;
