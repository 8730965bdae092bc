#![forbid(unsafe_code)]

//! Format, open and shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{info, warn};

use super::append::AppendState;
use super::buffer::{BufferPool, WriteFlags};
use super::checkpoint::sync_delta;
use super::driver::{IoDriver, Redriver};
use super::format::{
    read_page_header, stamp_page, LogGeometry, PageHeader, RecordKind, Superblock,
    SuperblockState, FIRST_DATA_PAGE, PAGE_BODY_END, PAGE_HEADER_LEN, SUPERBLOCK_PAGE,
};
use super::group_commit::FlushLevel;
use super::options::LogOptions;
use super::stats::Counters;
use super::txn::LogRecord;
use super::{LogCore, LOG_PAGE_SIZE};
use crate::primitives::io::FileIo;
use crate::types::{LogError, Lsn, Result};

/// Lifecycle of an open log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Superblock read, append point being restored.
    Opening,
    /// Accepting records.
    Open,
    /// Draining before the final checkpoint.
    ShuttingDown,
    /// Shut down; the handle only answers queries.
    Closed,
}

/// Lays down an empty log: a clean superblock and data pages whose sequence
/// numbers let [`locate_end`] find page 2 as the end.
pub fn format(io: &dyn FileIo, options: &LogOptions) -> Result<Superblock> {
    let geometry = options.geometry();
    geometry.validate()?;
    let end = geometry.page_offset(geometry.pages);
    if io.len()? < end {
        io.truncate(end)?;
    }
    let n = geometry.data_pages() as u64;
    let mut page = vec![0u8; LOG_PAGE_SIZE];
    for (idx, pn) in (FIRST_DATA_PAGE..geometry.pages).enumerate() {
        page.fill(0);
        let seq = if idx == 0 { n - 1 } else { idx as u64 - 1 };
        stamp_page(&mut page, seq, PAGE_HEADER_LEN);
        io.write_at(geometry.page_offset(pn), &page)?;
    }
    let sb = Superblock::new(&geometry);
    io.write_at(geometry.page_offset(SUPERBLOCK_PAGE), &sb.encode())?;
    io.sync_all()?;
    info!(
        pages = geometry.pages,
        inline = geometry.inline,
        uuid = %sb.uuid,
        "log.format"
    );
    Ok(sb)
}

/// Reads and validates the superblock. Only `base_block` and `block_size`
/// of `geometry` are used.
pub fn read_superblock(io: &dyn FileIo, geometry: &LogGeometry) -> Result<Superblock> {
    let mut page = vec![0u8; LOG_PAGE_SIZE];
    io.read_at(geometry.page_offset(SUPERBLOCK_PAGE), &mut page)?;
    Superblock::decode(&page)
}

/// Page holding the highest sequence number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEnd {
    /// Physical page.
    pub page: u32,
    /// Its sequence number.
    pub sequence: u64,
    /// Its end of records.
    pub eor: u16,
}

fn read_header(io: &dyn FileIo, geometry: &LogGeometry, page: u32) -> Result<PageHeader> {
    let mut image = vec![0u8; LOG_PAGE_SIZE];
    io.read_at(geometry.page_offset(page), &mut image)?;
    read_page_header(&image)
}

/// Finds the logical end of the log by binary search over the data pages.
///
/// Sequence numbers grow by one from page to page except at the single
/// point where the circular region wraps, so the data pages form a rotated
/// ascending run and the end is the last page before the drop.
pub fn locate_end(io: &dyn FileIo, geometry: &LogGeometry) -> Result<LogEnd> {
    let seq_at = |idx: u32| read_header(io, geometry, FIRST_DATA_PAGE + idx);
    let mut lo = 0u32;
    let mut hi = geometry.data_pages() - 1;
    let mut lo_seq = seq_at(lo)?.sequence;
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        let mid_seq = seq_at(mid)?.sequence;
        if mid_seq >= lo_seq {
            lo = mid;
            lo_seq = mid_seq;
        } else {
            hi = mid - 1;
        }
    }
    let header = seq_at(lo)?;
    Ok(LogEnd {
        page: FIRST_DATA_PAGE + lo,
        sequence: header.sequence,
        eor: header.eor,
    })
}

impl LogCore {
    /// Opens a formatted log and restores the append point.
    pub(crate) fn open(
        io: Arc<dyn FileIo>,
        options: LogOptions,
        redriver: Arc<Redriver>,
    ) -> Result<Arc<LogCore>> {
        let options = options.normalize();
        let requested = options.geometry();
        let sb = read_superblock(io.as_ref(), &requested)?;
        if sb.state != SuperblockState::Clean {
            warn!(state = ?sb.state, uuid = %sb.uuid, "log.open.needs_recovery");
            return Err(LogError::NeedsRecovery);
        }
        if sb.block_size != requested.block_size {
            return Err(LogError::Corruption("log block size does not match superblock"));
        }
        if sb.inline != requested.inline {
            return Err(LogError::Corruption("log placement does not match superblock"));
        }
        if requested.inline && sb.pages != requested.pages {
            return Err(LogError::Corruption("inline log size does not match superblock"));
        }
        let geometry = LogGeometry {
            pages: sb.pages,
            ..requested
        };
        geometry.validate()?;

        let buffers = options.buffer_pages;
        let core = Arc::new_cyclic(|me| LogCore {
            me: me.clone(),
            io: Arc::clone(&io),
            geometry,
            options,
            append: Mutex::new(AppendState::new()),
            gc: Mutex::default(),
            pool: BufferPool::new(buffers),
            checkpoints: Mutex::default(),
            admission: Mutex::default(),
            admission_cv: Condvar::new(),
            superblock: Mutex::new(sb),
            clients: Mutex::default(),
            durable: AtomicU64::new(0),
            io_failed: AtomicBool::new(false),
            first_failure: Mutex::new(None),
            counters: Counters::default(),
            driver: IoDriver::default(),
            redriver,
        });
        core.driver.start(Arc::downgrade(&core), io)?;
        if let Err(err) = core.init() {
            core.driver.stop();
            return Err(err);
        }
        Ok(core)
    }

    fn init(&self) -> Result<()> {
        let mut st = self.append.lock();
        let (page, eor) = self.superblock.lock().end_position();
        if !(FIRST_DATA_PAGE..self.geometry.pages).contains(&page)
            || !(PAGE_HEADER_LEN..=PAGE_BODY_END).contains(&eor)
        {
            return Err(LogError::Corruption("log superblock end out of range"));
        }
        let buf = self.buf_read(page)?;
        let header = read_page_header(&self.pool.page(buf).lock());
        let header = match header {
            Ok(header) if header.eor as usize == eor => header,
            Ok(_) => {
                self.buf_free(buf);
                return Err(LogError::Corruption("log end page disagrees with superblock"));
            }
            Err(err) => {
                self.buf_free(buf);
                return Err(err);
            }
        };
        self.set_sequence(buf, header.sequence);
        st.page = page;
        st.seq = header.sequence;
        st.eor = eor;
        st.buf = Some(buf);
        st.lsn = Lsn::from_parts(header.sequence, eor);
        if st.eor == PAGE_BODY_END {
            self.next_page(&mut st)?;
        }

        // Recovery starts from this marker; it records sync 0.
        let lsn = self.write_record(&mut st, None, LogRecord::new(RecordKind::Checkpoint), None)?;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        let cur = st.current()?;
        self.buf_write(cur, WriteFlags::WRITE | WriteFlags::SYNC, Some(st.eor), false);
        self.buf_wait(cur, false)?;
        st.syncpt = lsn;
        st.sync = lsn;
        st.nextsync = sync_delta(self.geometry.log_bytes());
        self.durable.fetch_max(lsn.0, Ordering::SeqCst);

        let serial = {
            let mut sb = self.superblock.lock();
            sb.state = SuperblockState::Mounted;
            sb.serial = sb.serial.wrapping_add(1);
            self.direct_write(SUPERBLOCK_PAGE, &sb.encode())?;
            sb.serial
        };
        st.lifecycle = LifecycleState::Open;
        info!(
            page = st.page,
            eor = st.eor,
            lsn = %lsn,
            serial,
            pages = self.geometry.pages,
            "log.open"
        );
        Ok(())
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        {
            let mut st = self.append.lock();
            match st.lifecycle {
                LifecycleState::Open => st.lifecycle = LifecycleState::ShuttingDown,
                LifecycleState::Closed => return Ok(()),
                LifecycleState::Opening | LifecycleState::ShuttingDown => {
                    return Err(LogError::Invalid("log is not open"))
                }
            }
        }
        let failed = self.io_failed.load(Ordering::SeqCst);
        let level = if failed {
            FlushLevel::Latest
        } else {
            FlushLevel::Drain
        };
        if let Err(err) = self.flush(level) {
            warn!(error = %err, "log.shutdown.flush_failed");
            self.append.lock().lifecycle = LifecycleState::Open;
            return Err(err);
        }

        let mut st = self.append.lock();
        let lsn = self.write_record(&mut st, None, LogRecord::new(RecordKind::Checkpoint), None)?;
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        let cur = st.current()?;
        st.buf = None;
        self.buf_write(
            cur,
            WriteFlags::WRITE | WriteFlags::RELEASE | WriteFlags::SYNC,
            Some(st.eor),
            false,
        );
        let written = self.buf_wait(cur, true);
        st.lifecycle = LifecycleState::Closed;
        let result = match (written, *self.first_failure.lock()) {
            (Err(err), _) => Err(err),
            (Ok(()), Some(page)) => Err(LogError::WriteFailed(page)),
            (Ok(()), None) => {
                let mut sb = self.superblock.lock();
                sb.state = SuperblockState::Clean;
                sb.end = LogGeometry::end_address(st.page, st.eor);
                self.direct_write(SUPERBLOCK_PAGE, &sb.encode())
            }
        };
        drop(st);
        self.driver.stop();
        match &result {
            Ok(()) => info!(lsn = %lsn, "log.shutdown"),
            Err(err) => warn!(lsn = %lsn, error = %err, "log.shutdown.unclean"),
        }
        result
    }
}
