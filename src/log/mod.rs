#![forbid(unsafe_code)]

//! Write-ahead log manager.
//!
//! A [`Log`] is a handle to one open log. Records are appended under a
//! single append lock into the current page buffer; commit records queue
//! their transaction for group commit; completed page writes advance the
//! durable LSN. Checkpoints track the oldest LSN recovery still needs so
//! the circular log can be reused.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

mod append;
mod buffer;
mod checkpoint;
mod driver;
pub mod format;
mod group_commit;
mod lifecycle;
mod manager;
mod options;
mod stats;
mod txn;

pub use buffer::PoolCensus;
pub use format::{
    LogGeometry, PageHeader, RecordDesc, RecordKind, RecordScanner, ScannedRecord, SegmentDesc,
    Superblock, SuperblockState,
};
pub use group_commit::FlushLevel;
pub use lifecycle::{format, locate_end, read_superblock, LifecycleState, LogEnd};
pub use manager::{DeviceKey, LogClient, LogManager};
pub use options::{LogLocation, LogOptions};
pub use stats::LogStats;
pub use txn::{
    CommitMode, CommitState, DeferredUnlock, DirtyRanges, LogRecord, MetaUnit, Transaction,
};

use append::AppendState;
use buffer::BufferPool;
use checkpoint::{Admission, CheckpointList};
use driver::{IoDriver, Redriver};
use group_commit::GcState;
use stats::Counters;

use crate::primitives::io::FileIo;
use crate::types::{LogError, Lsn, PageNo, Result};

/// Log page size in bytes.
pub const LOG_PAGE_SIZE: usize = 4096;
/// log2 of [`LOG_PAGE_SIZE`].
pub const L2_LOG_PAGE_SIZE: u32 = 12;

/// State shared by every handle to one open log.
///
/// Lock order: append, gc, transaction, unit, pool, page data. The
/// checkpoint list, admission and superblock locks are leaves.
pub(crate) struct LogCore {
    me: Weak<LogCore>,
    io: Arc<dyn FileIo>,
    geometry: LogGeometry,
    options: LogOptions,
    append: Mutex<AppendState>,
    gc: Mutex<GcState>,
    pool: BufferPool,
    checkpoints: Mutex<CheckpointList>,
    admission: Mutex<Admission>,
    admission_cv: Condvar,
    superblock: Mutex<Superblock>,
    clients: Mutex<Vec<Arc<dyn LogClient>>>,
    /// End of the newest record known to be on disk.
    durable: AtomicU64,
    io_failed: AtomicBool,
    first_failure: Mutex<Option<PageNo>>,
    counters: Counters,
    driver: IoDriver,
    redriver: Arc<Redriver>,
}

impl LogCore {
    fn handle(&self) -> Result<Log> {
        self.me
            .upgrade()
            .map(|core| Log { core })
            .ok_or(LogError::Closed)
    }

    fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable.load(Ordering::SeqCst))
    }
}

/// Handle to an open log. Clones share the log.
#[derive(Clone)]
pub struct Log {
    core: Arc<LogCore>,
}

impl Log {
    /// Appends one record and returns the LSN just past it.
    ///
    /// `ranges` copies dirty ranges of a metadata unit into the record and
    /// requires `tx`. A [`RecordKind::Commit`] record queues `tx` for group
    /// commit; call [`Log::commit`] to wait for it.
    ///
    /// # Panics
    ///
    /// Panics on malformed ranges, ranges without a transaction, or a
    /// commit record for a transaction that already committed.
    pub fn append(
        &self,
        tx: Option<&Arc<Transaction>>,
        record: LogRecord,
        ranges: Option<&DirtyRanges<'_>>,
    ) -> Result<Lsn> {
        self.core.append(tx, record, ranges)
    }

    /// Joins the group commit of `tx`. Forced transactions return once
    /// their commit record is durable; lazy ones return at once.
    pub fn commit(&self, tx: &Arc<Transaction>) -> Result<()> {
        self.core.group_commit(tx)
    }

    /// Pushes queued commits to disk.
    pub fn flush(&self, level: FlushLevel) -> Result<()> {
        self.core.flush(level)
    }

    /// Admits a transaction, waiting while a sync barrier is raised.
    pub fn begin_transaction(&self) -> Result<()> {
        self.core.begin_transaction()
    }

    /// Ends an admitted transaction; the last one out lifts a barrier.
    pub fn end_transaction(&self) -> Result<()> {
        self.core.end_transaction()
    }

    /// Forces a checkpoint and returns the recorded sync LSN.
    pub fn checkpoint(&self, hard: bool) -> Result<Lsn> {
        self.core.checkpoint(hard)
    }

    /// Reports that `unit` was written home. Fails if the commit covering
    /// its changes is not durable yet.
    pub fn unit_written(&self, unit: &MetaUnit) -> Result<()> {
        self.core.unit_written(unit)
    }

    /// Drains the log, writes the final checkpoint and marks the superblock
    /// clean.
    pub fn shutdown(&self) -> Result<()> {
        self.core.shutdown()
    }

    /// End of the last appended record.
    pub fn lsn(&self) -> Lsn {
        self.core.append.lock().lsn
    }

    /// Log durable up to here.
    pub fn durable_lsn(&self) -> Lsn {
        self.core.durable_lsn()
    }

    /// (syncpt, sync).
    pub fn sync_points(&self) -> (Lsn, Lsn) {
        let st = self.core.append.lock();
        (st.syncpt, st.sync)
    }

    /// Append cursor as (page, offset).
    pub fn cursor(&self) -> (PageNo, usize) {
        let st = self.core.append.lock();
        (PageNo(st.page), st.eor)
    }

    /// Counters plus queue and checkpoint state.
    pub fn stats(&self) -> LogStats {
        let mut stats = self.core.counters.snapshot();
        {
            let st = self.core.append.lock();
            stats.lsn = st.lsn.0;
            stats.syncpt = st.syncpt.0;
            stats.sync = st.sync.0;
        }
        stats.pending_commits = self.core.gc.lock().queue.len();
        stats.checkpoint_entries = self.core.checkpoints.lock().len();
        stats.durable_lsn = self.durable_lsn().0;
        stats
    }

    /// True once any page write failed.
    pub fn io_failed(&self) -> bool {
        self.core.io_failed.load(Ordering::SeqCst)
    }

    /// True while new transactions are held back.
    pub fn sync_barrier(&self) -> bool {
        self.core.admission.lock().barrier
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.core.append.lock().lifecycle
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> Superblock {
        self.core.superblock.lock().clone()
    }

    /// Log identity.
    pub fn uuid(&self) -> Uuid {
        self.core.superblock.lock().uuid
    }

    /// Geometry in use.
    pub fn geometry(&self) -> LogGeometry {
        self.core.geometry
    }

    /// Buffer membership snapshot.
    pub fn pool_census(&self) -> PoolCensus {
        self.core.pool_census()
    }

    /// True if both handles refer to the same open log.
    pub fn same_log(&self, other: &Log) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("uuid", &self.uuid())
            .field("lifecycle", &self.lifecycle())
            .field("lsn", &self.lsn())
            .finish()
    }
}
