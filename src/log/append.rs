#![forbid(unsafe_code)]

//! Record append engine and page rollover.
//!
//! The whole path runs under the per-log append lock, which makes the log
//! a single ordered stream. Rollover is lazy: a page is finalized only when
//! another byte has to be written and the page has no room left.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use super::buffer::{BufId, WriteFlags};
use super::checkpoint::SyncKey;
use super::format::{
    RecordDesc, RecordKind, FIRST_DATA_PAGE, PAGE_BODY_END, PAGE_BODY_LEN, PAGE_HEADER_LEN,
    RECORD_DESC_LEN, SEGMENT_DESC_LEN,
};
use super::group_commit::FlushLevel;
use super::lifecycle::LifecycleState;
use super::txn::{DirtyRanges, LogRecord, MetaUnit, Placement, Transaction, TxPhase};
use super::LogCore;
use crate::types::{LogError, Lsn, Result};

/// Append cursor and checkpoint bookkeeping, guarded by the append lock.
pub(crate) struct AppendState {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) page: u32,
    pub(crate) seq: u64,
    pub(crate) eor: usize,
    pub(crate) buf: Option<BufId>,
    /// End of the last appended record.
    pub(crate) lsn: Lsn,
    /// Sync LSN recorded by the last checkpoint record.
    pub(crate) syncpt: Lsn,
    /// Oldest LSN still needed for recovery.
    pub(crate) sync: Lsn,
    /// Bytes past `syncpt` that trigger the next checkpoint.
    pub(crate) nextsync: u64,
}

impl AppendState {
    pub(crate) fn new() -> Self {
        Self {
            lifecycle: LifecycleState::Opening,
            page: FIRST_DATA_PAGE,
            seq: 0,
            eor: PAGE_HEADER_LEN,
            buf: None,
            lsn: Lsn(0),
            syncpt: Lsn(0),
            sync: Lsn(0),
            nextsync: 0,
        }
    }

    pub(crate) fn current(&self) -> Result<BufId> {
        self.buf.ok_or(LogError::Closed)
    }

    /// Bytes appended since the last checkpoint.
    pub(crate) fn written(&self) -> u64 {
        self.lsn.0.saturating_sub(self.syncpt.0)
    }
}

/// Page sequence on which a record of `len` bytes written at (`seq`, `eor`)
/// ends.
pub(crate) fn end_sequence(seq: u64, eor: usize, len: usize) -> u64 {
    let room = PAGE_BODY_END - eor;
    if len <= room {
        seq
    } else {
        seq + (len - room).div_ceil(PAGE_BODY_LEN) as u64
    }
}

impl LogCore {
    pub(crate) fn append(
        &self,
        tx: Option<&Arc<Transaction>>,
        record: LogRecord,
        ranges: Option<&DirtyRanges<'_>>,
    ) -> Result<Lsn> {
        if record.kind == RecordKind::Checkpoint {
            return Err(LogError::Invalid("checkpoint records are written by the log itself"));
        }
        let (nsegs, veclen) = match ranges {
            Some(ranges) => {
                assert!(tx.is_some(), "dirty ranges logged without a transaction");
                ranges.validate()
            }
            None => (0, 0),
        };
        if record.kind == RecordKind::Commit {
            let Some(tx) = tx else {
                panic!("commit record appended without a transaction");
            };
            assert!(
                matches!(tx.state.lock().phase, TxPhase::Active),
                "transaction {} committed twice",
                tx.id()
            );
        }

        let mut st = self.append.lock();
        if st.lifecycle != LifecycleState::Open {
            return Err(LogError::Closed);
        }
        let len = RECORD_DESC_LEN + veclen as usize + nsegs as usize * SEGMENT_DESC_LEN;
        self.reserve(&mut st, len)?;
        if let (Some(tx), Some(ranges)) = (tx, ranges) {
            self.register_unit(&st, tx, ranges.unit);
        }
        self.write_record(&mut st, tx, record, ranges)?;
        if st.written() >= st.nextsync {
            self.log_sync(&mut st, false)?;
        }
        Ok(st.lsn)
    }

    fn would_overwrite(&self, st: &AppendState, len: usize) -> bool {
        let end = end_sequence(st.seq, st.eor, len);
        let floor = match self.checkpoints.lock().oldest() {
            Some(oldest) => oldest.min(st.syncpt),
            None => st.syncpt,
        };
        end >= floor.sequence() + self.geometry.data_pages() as u64
    }

    /// Makes sure a record of `len` bytes will not overwrite pages that
    /// recovery still needs, forcing a checkpoint if it would.
    fn reserve(&self, st: &mut AppendState, len: usize) -> Result<()> {
        if !self.would_overwrite(st, len) {
            return Ok(());
        }
        warn!(lsn = %st.lsn, syncpt = %st.syncpt, len, "log.append.wrap_relief");
        self.flush(FlushLevel::Latest)?;
        self.log_sync(st, true)?;
        if self.would_overwrite(st, len) {
            warn!(lsn = %st.lsn, syncpt = %st.syncpt, len, "log.append.log_full");
            return Err(LogError::LogFull);
        }
        Ok(())
    }

    /// Stamps a unit on its first logging and lets the transaction inherit
    /// the oldest LSN among the units it touched.
    fn register_unit(&self, st: &AppendState, tx: &Arc<Transaction>, unit: &Arc<MetaUnit>) {
        let mut ts = tx.state.lock();
        let mut us = unit.state.lock();
        let mut list = self.checkpoints.lock();
        let unit_lsn = match us.lsn {
            Some(lsn) => lsn,
            None => {
                us.lsn = Some(st.lsn);
                list.insert(SyncKey::Unit(unit.id()), st.lsn);
                st.lsn
            }
        };
        match ts.first_lsn {
            Some(lsn) if lsn <= unit_lsn => {}
            _ => {
                ts.first_lsn = Some(unit_lsn);
                list.insert(SyncKey::Tx(tx.id()), unit_lsn);
            }
        }
        if !ts.units.iter().any(|known| Arc::ptr_eq(known, unit)) {
            ts.units.push(Arc::clone(unit));
        }
    }

    /// Writes one record at the cursor and returns its end LSN.
    pub(crate) fn write_record(
        &self,
        st: &mut AppendState,
        tx: Option<&Arc<Transaction>>,
        record: LogRecord,
        ranges: Option<&DirtyRanges<'_>>,
    ) -> Result<Lsn> {
        if st.eor == PAGE_BODY_END {
            self.next_page(st)?;
        }
        let start = Lsn::from_parts(st.seq, st.eor);
        let (nsegs, veclen) = ranges.map_or((0, 0), |ranges| ranges.validate());
        let backchain = match tx {
            Some(tx) => std::mem::replace(&mut tx.state.lock().last, start),
            None => Lsn(0),
        };
        let arg = match ranges {
            Some(ranges) if record.arg == 0 => ranges.unit.id().0,
            _ => record.arg,
        };
        let desc = RecordDesc {
            kind: record.kind,
            nsegs,
            veclen,
            tid: tx.map_or(0, |tx| tx.id().0),
            backchain,
            arg,
        };
        self.move_bytes(st, &desc.encode())?;
        if let Some(ranges) = ranges {
            for link in ranges.links() {
                for seg in &link.segments {
                    let from = seg.offset as usize;
                    self.move_bytes(st, &link.image[from..from + seg.len as usize])?;
                }
            }
            for link in ranges.links() {
                for seg in &link.segments {
                    self.move_bytes(st, &seg.encode())?;
                }
            }
        }
        let lsn = Lsn::from_parts(st.seq, st.eor);
        st.lsn = lsn;
        self.counters.records.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(desc.encoded_len() as u64, Ordering::Relaxed);
        debug!(kind = %record.kind, tid = desc.tid, lsn = %lsn, "log.append.record");
        if record.kind == RecordKind::Commit {
            if let Some(tx) = tx {
                self.queue_commit(st, tx, lsn)?;
            }
        }
        Ok(lsn)
    }

    fn move_bytes(&self, st: &mut AppendState, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            if st.eor == PAGE_BODY_END {
                self.next_page(st)?;
            }
            let n = src.len().min(PAGE_BODY_END - st.eor);
            let buf = st.current()?;
            self.pool.page(buf).lock()[st.eor..st.eor + n].copy_from_slice(&src[..n]);
            st.eor += n;
            src = &src[n..];
        }
        Ok(())
    }

    fn queue_commit(&self, st: &AppendState, tx: &Arc<Transaction>, lsn: Lsn) -> Result<()> {
        let buf = st.current()?;
        let units = {
            let mut ts = tx.state.lock();
            ts.commit_lsn = Some(lsn);
            std::mem::take(&mut ts.units)
        };
        for unit in &units {
            let mut us = unit.state.lock();
            us.clsn = Some(us.clsn.map_or(lsn, |clsn| clsn.max(lsn)));
        }
        let placement = Placement {
            seq: st.seq,
            page: st.page,
            buf,
            eor: st.eor,
            eop: false,
            free_page: false,
        };
        let mut gc = self.gc.lock();
        tx.state.lock().phase = TxPhase::Queued(placement);
        gc.queue.push_back(Arc::clone(tx));
        debug!(
            tid = tx.id().0,
            page = st.page,
            lsn = %lsn,
            queued = gc.queue.len(),
            "log.group_commit.enqueue"
        );
        Ok(())
    }

    /// Finalizes the current page and moves the cursor to the next one.
    pub(crate) fn next_page(&self, st: &mut AppendState) -> Result<()> {
        let old = st.current()?;
        self.set_final_eor(old, st.eor);
        {
            let mut gc = self.gc.lock();
            let tail_on_page = match gc.queue.back() {
                Some(tail) => {
                    let mut ts = tail.state.lock();
                    match ts.phase.placement_mut() {
                        Some(p) if p.seq == st.seq => {
                            p.eop = true;
                            true
                        }
                        _ => false,
                    }
                }
                None => false,
            };
            if tail_on_page {
                if gc.pageout {
                    // Keep page order on the write queue; the group commit
                    // in flight finalizes this page when it completes.
                    if !self.buf_is_queued(old) {
                        self.buf_write(old, WriteFlags::NONE, None, false);
                    }
                } else {
                    gc.pageout = true;
                    self.gc_write(&mut gc, false);
                }
            } else {
                self.buf_write(
                    old,
                    WriteFlags::WRITE | WriteFlags::RELEASE | WriteFlags::FREE,
                    Some(st.eor),
                    false,
                );
            }
        }
        st.page = self.geometry.next_page(st.page);
        st.seq += 1;
        st.eor = PAGE_HEADER_LEN;
        st.buf = Some(self.buf_alloc(st.page, st.seq));
        self.counters.rollovers.fetch_add(1, Ordering::Relaxed);
        debug!(page = st.page, seq = st.seq, "log.append.rollover");
        Ok(())
    }
}
