#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::Lsn;

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) records: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) page_writes: AtomicU64,
    pub(crate) group_commits: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) commit_failures: AtomicU64,
    pub(crate) checkpoints: AtomicU64,
    pub(crate) redrives: AtomicU64,
    pub(crate) buffer_waits: AtomicU64,
    pub(crate) wrap_collapses: AtomicU64,
    pub(crate) barriers: AtomicU64,
    pub(crate) write_errors: AtomicU64,
    pub(crate) rollovers: AtomicU64,
}

/// Snapshot of log activity.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LogStats {
    /// Records appended.
    pub records_appended: u64,
    /// Record bytes appended.
    pub bytes_appended: u64,
    /// Page writes started.
    pub page_writes: u64,
    /// Group-commit page writes dispatched.
    pub group_commit_writes: u64,
    /// Transactions that reached a terminal commit state.
    pub transactions_committed: u64,
    /// Transactions whose commit write failed.
    pub commit_failures: u64,
    /// Checkpoint records written.
    pub checkpoints: u64,
    /// I/O starts handed to the redrive thread.
    pub redrives: u64,
    /// Times an appender waited for a free buffer.
    pub buffer_waits: u64,
    /// Soft log-wrap collapses of the checkpoint.
    pub wrap_collapses: u64,
    /// Sync barriers raised.
    pub barriers_raised: u64,
    /// Failed page writes.
    pub write_errors: u64,
    /// Page rollovers.
    pub rollovers: u64,
    /// Transactions on the commit queue.
    pub pending_commits: usize,
    /// Entries on the checkpoint list.
    pub checkpoint_entries: usize,
    /// End of the last appended record.
    pub lsn: u64,
    /// Log durable up to here.
    pub durable_lsn: u64,
    /// LSN recorded by the last checkpoint record.
    pub syncpt: u64,
    /// Oldest LSN still needed.
    pub sync: u64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> LogStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LogStats {
            records_appended: load(&self.records),
            bytes_appended: load(&self.bytes),
            page_writes: load(&self.page_writes),
            group_commit_writes: load(&self.group_commits),
            transactions_committed: load(&self.committed),
            commit_failures: load(&self.commit_failures),
            checkpoints: load(&self.checkpoints),
            redrives: load(&self.redrives),
            buffer_waits: load(&self.buffer_waits),
            wrap_collapses: load(&self.wrap_collapses),
            barriers_raised: load(&self.barriers),
            write_errors: load(&self.write_errors),
            rollovers: load(&self.rollovers),
            ..LogStats::default()
        }
    }
}

impl LogStats {
    /// Durable LSN as a typed value.
    pub fn durable(&self) -> Lsn {
        Lsn(self.durable_lsn)
    }
}
