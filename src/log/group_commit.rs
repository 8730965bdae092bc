#![forbid(unsafe_code)]

//! Group commit coordinator.
//!
//! Transactions whose commit records sit on the same log page commit with
//! one write of that page. The first committer to find no group write in
//! flight leads: it dispatches the batch at the queue head. Completion marks
//! the batch committed and, when more work is waiting, leads the next batch
//! itself.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::buffer::{BufId, WriteFlags};
use super::checkpoint::SyncKey;
use super::txn::{Transaction, TxPhase};
use super::LogCore;
use crate::types::{LogError, Result, TxId};

/// How far [`crate::log::Log::flush`] goes before returning.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushLevel {
    /// Start writing queued commits without waiting.
    Kick,
    /// Wait until the newest queued commit is durable.
    Latest,
    /// Wait until every commit is durable and clients wrote all logged
    /// metadata home.
    Drain,
}

impl FlushLevel {
    /// Maps the numeric levels 0, 1 and 2.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(FlushLevel::Kick),
            1 => Some(FlushLevel::Latest),
            2 => Some(FlushLevel::Drain),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FlushTarget {
    /// Keep leading until this transaction is committed.
    UpTo(TxId),
    /// Keep leading while anything is queued.
    All,
}

#[derive(Default)]
pub(crate) struct GcState {
    /// Commit queue in LSN order.
    pub(crate) queue: VecDeque<Arc<Transaction>>,
    /// A group-commit write is in flight.
    pub(crate) pageout: bool,
    /// Forced committers blocked in `group_commit`.
    pub(crate) ready: usize,
    pub(crate) flush: Option<FlushTarget>,
}

fn outcome(tx: TxId, failed: bool) -> Result<()> {
    if failed {
        Err(LogError::CommitFailed(tx))
    } else {
        Ok(())
    }
}

impl LogCore {
    /// Joins the group commit of a transaction whose commit record has been
    /// appended.
    pub(crate) fn group_commit(&self, tx: &Arc<Transaction>) -> Result<()> {
        let mut gc = self.gc.lock();
        match tx.state.lock().phase {
            TxPhase::Committed { failed } => return outcome(tx.id(), failed),
            TxPhase::Active => return Err(LogError::Invalid("transaction has no commit record")),
            TxPhase::Queued(_) | TxPhase::Committing(_) => {}
        }
        if !gc.pageout && !gc.queue.is_empty() && (!tx.is_lazy() || gc.flush.is_some()) {
            gc.pageout = true;
            self.gc_write(&mut gc, false);
        }
        if tx.is_lazy() {
            return Ok(());
        }
        let mut ts = tx.state.lock();
        if let TxPhase::Committed { failed } = ts.phase {
            return outcome(tx.id(), failed);
        }
        ts.ready = true;
        gc.ready += 1;
        drop(gc);
        debug!(tid = tx.id().0, "log.group_commit.wait");
        loop {
            if let TxPhase::Committed { failed } = ts.phase {
                return outcome(tx.id(), failed);
            }
            tx.cv.wait(&mut ts);
        }
    }

    /// Dispatches one write for every transaction at the queue head that
    /// shares the head's page. Caller holds the gc lock and has set
    /// `pageout`.
    pub(crate) fn gc_write(&self, gc: &mut GcState, cant_block: bool) {
        let Some(head_seq) = gc
            .queue
            .front()
            .and_then(|head| head.state.lock().phase.placement().map(|p| p.seq))
        else {
            gc.pageout = false;
            return;
        };
        let mut batch = 0usize;
        let mut last = None;
        for tx in gc.queue.iter() {
            let mut ts = tx.state.lock();
            match ts.phase {
                TxPhase::Queued(p) if p.seq == head_seq => {
                    ts.phase = TxPhase::Committing(p);
                    batch += 1;
                    last = Some(tx);
                }
                _ => break,
            }
        }
        let Some(last) = last else {
            gc.pageout = false;
            return;
        };
        let (buf, flags, ceor, full) = {
            let mut ts = last.state.lock();
            let TxPhase::Committing(p) = &mut ts.phase else {
                panic!("group commit batch tail is not committing");
            };
            if p.eop {
                p.eop = false;
                p.free_page = true;
                (
                    p.buf,
                    WriteFlags::WRITE | WriteFlags::RELEASE | WriteFlags::GC,
                    self.final_eor(p.buf),
                    true,
                )
            } else {
                (p.buf, WriteFlags::WRITE | WriteFlags::GC, p.eor, false)
            }
        };
        self.counters.group_commits.fetch_add(1, Ordering::Relaxed);
        debug!(batch, seq = head_seq, ceor, full, "log.group_commit.dispatch");
        self.buf_write(buf, flags, Some(ceor), cant_block);
    }

    /// Completion of a group-commit write; runs on the I/O thread.
    ///
    /// Once any page write has failed the durable LSN stops advancing, so
    /// every later batch completes as failed too.
    pub(crate) fn post_gc(&self, buf: BufId, failed: bool) {
        let failed = failed || self.io_failed.load(Ordering::SeqCst);
        let mut lazy = Vec::new();
        let mut release = false;
        let mut finalize = None;
        let mut batch = 0u64;
        let mut gc = self.gc.lock();
        while let Some(tx) = gc.queue.front().cloned() {
            let mut ts = tx.state.lock();
            let TxPhase::Committing(p) = ts.phase else {
                break;
            };
            debug_assert_eq!(p.buf, buf, "committing transaction on another buffer");
            gc.queue.pop_front();
            ts.phase = TxPhase::Committed { failed };
            if std::mem::take(&mut ts.ready) {
                gc.ready -= 1;
            }
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
            if failed {
                self.counters.commit_failures.fetch_add(1, Ordering::Relaxed);
            }
            tx.cv.notify_all();
            drop(ts);
            if gc.flush == Some(FlushTarget::UpTo(tx.id())) {
                gc.flush = None;
            }
            self.checkpoints.lock().remove(SyncKey::Tx(tx.id()));
            if p.free_page {
                release = true;
            } else if p.eop {
                finalize = Some(p.buf);
            }
            if tx.is_lazy() {
                lazy.push(tx);
            }
            batch += 1;
        }
        if failed {
            warn!(batch, buf = buf.0, "log.group_commit.failed");
        } else {
            debug!(batch, buf = buf.0, "log.group_commit.complete");
        }

        if release {
            self.buf_free(buf);
        }
        if let Some(full) = finalize {
            // The page rolled while its partial write was in flight.
            let eor = self.final_eor(full);
            self.buf_write(
                full,
                WriteFlags::WRITE | WriteFlags::RELEASE | WriteFlags::FREE,
                Some(eor),
                true,
            );
        }

        let relead = match gc.queue.front() {
            Some(head) => {
                gc.ready > 0
                    || gc.flush.is_some()
                    || head
                        .state
                        .lock()
                        .phase
                        .placement()
                        .is_some_and(|p| self.buf_is_queued(p.buf))
            }
            None => false,
        };
        if relead {
            self.gc_write(&mut gc, true);
        } else {
            gc.pageout = false;
        }
        drop(gc);

        for tx in lazy {
            if let Some(unlock) = tx.deferred_unlock() {
                unlock.unlock(tx.id(), !failed);
            }
        }
    }

    pub(crate) fn flush(&self, level: FlushLevel) -> Result<()> {
        let barrier = self.admission.lock().barrier;
        let mut gc = self.gc.lock();
        let tail = gc.queue.back().cloned();
        if let Some(tail) = &tail {
            if gc.flush != Some(FlushTarget::All) {
                gc.flush = Some(FlushTarget::UpTo(tail.id()));
            }
            if !gc.pageout {
                gc.pageout = true;
                self.gc_write(&mut gc, false);
            }
        }
        if level == FlushLevel::Drain || barrier {
            gc.flush = Some(FlushTarget::All);
        }
        debug!(?level, queued = gc.queue.len(), barrier, "log.flush");
        match tail.filter(|_| level != FlushLevel::Kick) {
            Some(tail) => {
                let mut ts = tail.state.lock();
                drop(gc);
                while !matches!(ts.phase, TxPhase::Committed { .. }) {
                    tail.cv.wait(&mut ts);
                }
            }
            None => drop(gc),
        }
        if level == FlushLevel::Drain {
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&self) -> Result<()> {
        self.flush_clients(true)?;
        let mut attempts = 0;
        loop {
            let (queued, dirty) = (self.gc.lock().queue.len(), self.checkpoints.lock().len());
            if queued == 0 && dirty == 0 {
                break;
            }
            if attempts >= self.options.drain_retries {
                self.gc.lock().flush = None;
                warn!(queued, dirty, attempts, "log.flush.drain_incomplete");
                return Err(LogError::DrainIncomplete(if queued > 0 {
                    "commit queue not empty"
                } else {
                    "checkpoint list not empty"
                }));
            }
            attempts += 1;
            debug!(queued, dirty, attempts, "log.flush.drain_retry");
            thread::sleep(self.options.drain_interval);
            self.flush_clients(true)?;
        }
        self.gc.lock().flush = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_levels_map_from_numbers() {
        assert_eq!(FlushLevel::from_level(0), Some(FlushLevel::Kick));
        assert_eq!(FlushLevel::from_level(1), Some(FlushLevel::Latest));
        assert_eq!(FlushLevel::from_level(2), Some(FlushLevel::Drain));
        assert_eq!(FlushLevel::from_level(3), None);
    }

    #[test]
    fn outcome_reports_failure() {
        assert!(outcome(TxId(1), false).is_ok());
        assert!(matches!(
            outcome(TxId(9), true),
            Err(LogError::CommitFailed(TxId(9)))
        ));
    }
}
