#![forbid(unsafe_code)]

//! Descriptors the transaction manager hands to the log: transactions,
//! metadata units and their dirty ranges, and records.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use super::buffer::BufId;
use super::format::{RecordKind, SegmentDesc};
use crate::types::{Lsn, TxId, UnitId};

/// Callback for transactions that do not wait for their commit write.
pub trait DeferredUnlock: Send + Sync {
    /// Runs once the page write carrying the commit record finished.
    /// `durable` is false when that write failed.
    fn unlock(&self, tx: TxId, durable: bool);
}

/// How the owner of a transaction waits for durability.
#[derive(Clone)]
pub enum CommitMode {
    /// The committer blocks in [`crate::log::Log::commit`] until durable.
    Force,
    /// The committer returns at once; the callback runs on completion.
    Lazy(Arc<dyn DeferredUnlock>),
}

impl fmt::Debug for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitMode::Force => f.write_str("Force"),
            CommitMode::Lazy(_) => f.write_str("Lazy"),
        }
    }
}

/// Externally visible group-commit state of a transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitState {
    /// No commit record yet.
    Active,
    /// Commit record written, waiting for a page write.
    Queued,
    /// Part of the page write in flight.
    Committing,
    /// Commit record is durable.
    Committed,
    /// The page write carrying the commit record failed.
    Failed,
}

/// Where a queued transaction's commit record sits.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Placement {
    pub(crate) seq: u64,
    pub(crate) page: u32,
    pub(crate) buf: BufId,
    /// End of the commit record on the page.
    pub(crate) eor: usize,
    /// The page filled up after the record was queued.
    pub(crate) eop: bool,
    /// Release the buffer once this transaction completes.
    pub(crate) free_page: bool,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum TxPhase {
    Active,
    Queued(Placement),
    Committing(Placement),
    Committed { failed: bool },
}

impl TxPhase {
    pub(crate) fn placement(&self) -> Option<&Placement> {
        match self {
            TxPhase::Queued(p) | TxPhase::Committing(p) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn placement_mut(&mut self) -> Option<&mut Placement> {
        match self {
            TxPhase::Queued(p) | TxPhase::Committing(p) => Some(p),
            _ => None,
        }
    }
}

pub(crate) struct TxState {
    pub(crate) first_lsn: Option<Lsn>,
    pub(crate) commit_lsn: Option<Lsn>,
    pub(crate) last: Lsn,
    pub(crate) phase: TxPhase,
    pub(crate) ready: bool,
    pub(crate) units: Vec<Arc<MetaUnit>>,
}

/// One transaction as seen by the log.
pub struct Transaction {
    id: TxId,
    mode: CommitMode,
    pub(crate) state: Mutex<TxState>,
    pub(crate) cv: Condvar,
}

impl Transaction {
    /// Creates a transaction descriptor.
    pub fn new(id: TxId, mode: CommitMode) -> Arc<Self> {
        Arc::new(Self {
            id,
            mode,
            state: Mutex::new(TxState {
                first_lsn: None,
                commit_lsn: None,
                last: Lsn(0),
                phase: TxPhase::Active,
                ready: false,
                units: Vec::new(),
            }),
            cv: Condvar::new(),
        })
    }

    /// Transaction whose committer waits for durability.
    pub fn forced(id: TxId) -> Arc<Self> {
        Self::new(id, CommitMode::Force)
    }

    /// Transaction completed through `unlock` instead of waiting.
    pub fn lazy(id: TxId, unlock: Arc<dyn DeferredUnlock>) -> Arc<Self> {
        Self::new(id, CommitMode::Lazy(unlock))
    }

    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// True for lazily committed transactions.
    pub fn is_lazy(&self) -> bool {
        matches!(self.mode, CommitMode::Lazy(_))
    }

    pub(crate) fn deferred_unlock(&self) -> Option<&Arc<dyn DeferredUnlock>> {
        match &self.mode {
            CommitMode::Lazy(cb) => Some(cb),
            CommitMode::Force => None,
        }
    }

    /// Oldest LSN of any metadata unit this transaction logged.
    pub fn first_lsn(&self) -> Option<Lsn> {
        self.state.lock().first_lsn
    }

    /// End of the commit record, once written.
    pub fn commit_lsn(&self) -> Option<Lsn> {
        self.state.lock().commit_lsn
    }

    /// Current group-commit state.
    pub fn commit_state(&self) -> CommitState {
        match self.state.lock().phase {
            TxPhase::Active => CommitState::Active,
            TxPhase::Queued(_) => CommitState::Queued,
            TxPhase::Committing(_) => CommitState::Committing,
            TxPhase::Committed { failed: false } => CommitState::Committed,
            TxPhase::Committed { failed: true } => CommitState::Failed,
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.commit_state())
            .finish()
    }
}

pub(crate) struct UnitState {
    pub(crate) lsn: Option<Lsn>,
    pub(crate) clsn: Option<Lsn>,
}

/// An in-memory metadata unit whose changes are logged (an inode block, a
/// map page, ...).
pub struct MetaUnit {
    id: UnitId,
    pub(crate) state: Mutex<UnitState>,
}

impl MetaUnit {
    /// Creates a clean unit.
    pub fn new(id: UnitId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(UnitState {
                lsn: None,
                clsn: None,
            }),
        })
    }

    /// Unit id.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// LSN of the first record logged since the unit was last written home.
    pub fn lsn(&self) -> Option<Lsn> {
        self.state.lock().lsn
    }

    /// Commit LSN of the newest transaction that changed the unit. The unit
    /// may go home once the log is durable up to this point.
    pub fn commit_lsn(&self) -> Option<Lsn> {
        self.state.lock().clsn
    }

    /// True while the unit holds logged changes not yet written home.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().lsn.is_some()
    }
}

impl fmt::Debug for MetaUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetaUnit")
            .field("id", &self.id)
            .field("lsn", &state.lsn)
            .field("clsn", &state.clsn)
            .finish()
    }
}

/// Ranges of a metadata unit to copy into a record. `next` continues the
/// description for the same unit when one descriptor is not enough.
pub struct DirtyRanges<'a> {
    /// Unit the ranges belong to.
    pub unit: &'a Arc<MetaUnit>,
    /// In-memory image of the unit.
    pub image: &'a [u8],
    /// Ranges within `image`.
    pub segments: SmallVec<[SegmentDesc; 4]>,
    /// Overflow descriptor.
    pub next: Option<Box<DirtyRanges<'a>>>,
}

impl<'a> DirtyRanges<'a> {
    /// Empty description of `unit`.
    pub fn new(unit: &'a Arc<MetaUnit>, image: &'a [u8]) -> Self {
        Self {
            unit,
            image,
            segments: SmallVec::new(),
            next: None,
        }
    }

    /// Adds a range.
    pub fn with_segment(mut self, offset: u32, len: u32) -> Self {
        self.segments.push(SegmentDesc { offset, len });
        self
    }

    /// Appends an overflow descriptor at the end of the chain.
    pub fn chain(mut self, next: DirtyRanges<'a>) -> Self {
        let mut slot = &mut self.next;
        while let Some(link) = slot {
            slot = &mut link.next;
        }
        *slot = Some(Box::new(next));
        self
    }

    /// Iterates the descriptor and its overflow chain.
    pub fn links(&self) -> impl Iterator<Item = &DirtyRanges<'a>> + '_ {
        std::iter::successors(Some(self), |link| link.next.as_deref())
    }

    /// Checks the description and returns (segment count, vector bytes).
    ///
    /// # Panics
    ///
    /// Panics on an empty descriptor, a zero-length or out-of-bounds range,
    /// or a continuation describing a different unit.
    pub(crate) fn validate(&self) -> (u16, u32) {
        let mut nsegs = 0usize;
        let mut veclen = 0u64;
        for link in self.links() {
            assert!(
                Arc::ptr_eq(link.unit, self.unit),
                "dirty-range continuation describes a different unit"
            );
            assert!(!link.segments.is_empty(), "dirty-range descriptor has no ranges");
            for seg in &link.segments {
                let end = seg.offset as u64 + seg.len as u64;
                assert!(seg.len > 0, "dirty range has zero length");
                assert!(
                    end <= link.image.len() as u64,
                    "dirty range exceeds the unit image"
                );
                nsegs += 1;
                veclen += seg.len as u64;
            }
        }
        assert!(nsegs <= u16::MAX as usize, "too many dirty ranges in one record");
        assert!(veclen <= u32::MAX as u64, "dirty ranges exceed record size limit");
        (nsegs as u16, veclen as u32)
    }
}

/// A record to append. The engine fills in transaction id, backchain and
/// vector lengths.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Record type.
    pub kind: RecordKind,
    /// Type-specific argument.
    pub arg: u64,
}

impl LogRecord {
    /// Record of `kind` with a zero argument.
    pub fn new(kind: RecordKind) -> Self {
        Self { kind, arg: 0 }
    }

    /// Commit record.
    pub fn commit() -> Self {
        Self::new(RecordKind::Commit)
    }

    /// Redo image record.
    pub fn redo() -> Self {
        Self::new(RecordKind::RedoPage)
    }

    /// Sets the argument.
    pub fn with_arg(mut self, arg: u64) -> Self {
        self.arg = arg;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_sums_chain() {
        let unit = MetaUnit::new(UnitId(1));
        let image = vec![0u8; 256];
        let ranges = DirtyRanges::new(&unit, &image)
            .with_segment(0, 16)
            .with_segment(32, 8)
            .chain(DirtyRanges::new(&unit, &image).with_segment(100, 50));
        assert_eq!(ranges.links().count(), 2);
        assert_eq!(ranges.validate(), (3, 74));
    }

    #[test]
    #[should_panic(expected = "dirty range exceeds the unit image")]
    fn out_of_bounds_range_panics() {
        let unit = MetaUnit::new(UnitId(1));
        let image = vec![0u8; 16];
        DirtyRanges::new(&unit, &image).with_segment(8, 16).validate();
    }

    #[test]
    #[should_panic(expected = "different unit")]
    fn foreign_continuation_panics() {
        let a = MetaUnit::new(UnitId(1));
        let b = MetaUnit::new(UnitId(2));
        let image = vec![0u8; 16];
        DirtyRanges::new(&a, &image)
            .with_segment(0, 4)
            .chain(DirtyRanges::new(&b, &image).with_segment(0, 4))
            .validate();
    }

    #[test]
    fn new_transaction_is_active() {
        let tx = Transaction::forced(TxId(5));
        assert_eq!(tx.commit_state(), CommitState::Active);
        assert!(!tx.is_lazy());
        assert_eq!(tx.commit_lsn(), None);
    }
}
