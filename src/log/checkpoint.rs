#![forbid(unsafe_code)]

//! Checkpoint engine, sync barrier and transaction admission.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::append::AppendState;
use super::format::RecordKind;
use super::group_commit::{FlushLevel, FlushTarget};
use super::lifecycle::LifecycleState;
use super::txn::{LogRecord, MetaUnit};
use super::{LogCore, LOG_PAGE_SIZE};
use crate::types::{LogError, Lsn, Result, TxId, UnitId};

/// Something still pinning log space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum SyncKey {
    Unit(UnitId),
    Tx(TxId),
}

/// Dirty units and uncommitted transactions ordered by the oldest LSN they
/// need.
#[derive(Default)]
pub(crate) struct CheckpointList {
    entries: BTreeSet<(Lsn, SyncKey)>,
    index: HashMap<SyncKey, Lsn>,
}

impl CheckpointList {
    /// Inserts `key` or moves it to `lsn`.
    pub(crate) fn insert(&mut self, key: SyncKey, lsn: Lsn) {
        if let Some(old) = self.index.insert(key, lsn) {
            self.entries.remove(&(old, key));
        }
        self.entries.insert((lsn, key));
    }

    pub(crate) fn remove(&mut self, key: SyncKey) -> bool {
        match self.index.remove(&key) {
            Some(lsn) => self.entries.remove(&(lsn, key)),
            None => false,
        }
    }

    pub(crate) fn oldest(&self) -> Option<Lsn> {
        self.entries.first().map(|(lsn, _)| *lsn)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
pub(crate) struct Admission {
    pub(crate) active: usize,
    pub(crate) barrier: bool,
}

/// Largest checkpoint trigger distance for a log of `log_bytes`.
pub(crate) fn sync_delta(log_bytes: u64) -> u64 {
    (log_bytes / 8).min(128 * LOG_PAGE_SIZE as u64)
}

impl LogCore {
    /// Advances the checkpoint. Runs under the append lock.
    pub(crate) fn log_sync(&self, st: &mut AppendState, hard: bool) -> Result<Lsn> {
        self.flush_clients(hard)?;
        if st.sync == st.syncpt {
            st.sync = match self.checkpoints.lock().oldest() {
                Some(oldest) => oldest.max(st.syncpt),
                None => st.lsn,
            };
        }
        if st.sync != st.syncpt {
            let record = LogRecord::new(RecordKind::Checkpoint).with_arg(st.sync.0);
            self.write_record(st, None, record, None)?;
            st.syncpt = st.sync;
            self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
            debug!(syncpt = %st.syncpt, lsn = %st.lsn, hard, "log.sync.checkpoint");
        }

        let written = st.written();
        let log_bytes = self.geometry.log_bytes();
        let delta = sync_delta(log_bytes);
        let more = (log_bytes.saturating_sub(written) / 2).min(delta);
        if more < 2 * LOG_PAGE_SIZE as u64 {
            warn!(lsn = %st.lsn, syncpt = %st.syncpt, written, "log.sync.wrap");
            st.syncpt = st.lsn;
            st.sync = st.lsn;
            st.nextsync = delta;
            self.counters.wrap_collapses.fetch_add(1, Ordering::Relaxed);
        } else {
            st.nextsync = written + more;
        }

        if written > log_bytes / 4 {
            let raised = {
                let mut adm = self.admission.lock();
                if !adm.barrier && adm.active > 0 {
                    adm.barrier = true;
                    true
                } else {
                    false
                }
            };
            if raised {
                self.counters.barriers.fetch_add(1, Ordering::Relaxed);
                info!(lsn = %st.lsn, written, "log.sync.barrier_on");
            }
            // Kick queued commits even when no transaction is held back.
            self.flush(FlushLevel::Kick)?;
        }
        Ok(st.syncpt)
    }

    pub(crate) fn checkpoint(&self, hard: bool) -> Result<Lsn> {
        let mut st = self.append.lock();
        if st.lifecycle != LifecycleState::Open {
            return Err(LogError::Closed);
        }
        self.log_sync(&mut st, hard)
    }

    pub(crate) fn begin_transaction(&self) -> Result<()> {
        if self.append.lock().lifecycle != LifecycleState::Open {
            return Err(LogError::Closed);
        }
        let mut adm = self.admission.lock();
        while adm.barrier {
            self.admission_cv.wait(&mut adm);
        }
        adm.active += 1;
        Ok(())
    }

    pub(crate) fn end_transaction(&self) -> Result<()> {
        let lift = {
            let mut adm = self.admission.lock();
            assert!(adm.active > 0, "end_transaction without begin_transaction");
            adm.active -= 1;
            adm.active == 0 && adm.barrier
        };
        if !lift {
            return Ok(());
        }
        let synced = {
            let mut st = self.append.lock();
            if st.lifecycle == LifecycleState::Open {
                self.log_sync(&mut st, true).map(Some)
            } else {
                Ok(None)
            }
        };
        {
            let mut gc = self.gc.lock();
            if gc.flush == Some(FlushTarget::All) {
                gc.flush = None;
            }
        }
        {
            let mut adm = self.admission.lock();
            adm.barrier = false;
            self.admission_cv.notify_all();
        }
        info!("log.sync.barrier_off");
        synced.map(|_| ())
    }

    pub(crate) fn unit_written(&self, unit: &MetaUnit) -> Result<()> {
        let mut us = unit.state.lock();
        if us.lsn.is_none() {
            return Ok(());
        }
        let Some(clsn) = us.clsn else {
            return Err(LogError::Invalid("metadata unit has no committed changes"));
        };
        if self.durable_lsn() < clsn {
            return Err(LogError::Invalid(
                "metadata unit written home before its commit was durable",
            ));
        }
        self.checkpoints.lock().remove(SyncKey::Unit(unit.id()));
        us.lsn = None;
        us.clsn = None;
        Ok(())
    }

    /// Asks every client to write logged metadata home.
    pub(crate) fn flush_clients(&self, hard: bool) -> Result<()> {
        let clients = self.clients.lock().clone();
        if clients.is_empty() {
            return Ok(());
        }
        let log = self.handle()?;
        for client in clients {
            client.flush_metadata(&log, hard)?;
        }
        Ok(())
    }
}
