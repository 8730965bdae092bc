#![forbid(unsafe_code)]

//! Fixed pool of page buffers and the per-log write queue.
//!
//! Every buffer is in exactly one place: the free list, bound to the append
//! cursor or a pending commit, or the write queue. Only the queue head may
//! have a write in flight, so pages reach the device in queue order.

use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::atomic::Ordering;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::driver::IoRequest;
use super::format::{stamp_page, PAGE_HEADER_LEN};
use super::{LogCore, LOG_PAGE_SIZE};
use crate::types::{LogError, Lsn, PageNo, Result};

/// Index of a buffer in the pool arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BufId(pub(crate) usize);

#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub(crate) struct WriteFlags(u8);

impl WriteFlags {
    pub(crate) const NONE: Self = Self(0);
    pub(crate) const WRITE: Self = Self(1);
    /// Pop from the write queue on completion.
    pub(crate) const RELEASE: Self = Self(1 << 1);
    /// A caller waits for completion.
    pub(crate) const SYNC: Self = Self(1 << 2);
    /// Completion finishes a group commit.
    pub(crate) const GC: Self = Self(1 << 3);
    /// Return to the free list on completion.
    pub(crate) const FREE: Self = Self(1 << 4);

    pub(crate) fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for WriteFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug)]
struct InFlight {
    flags: WriteFlags,
    ceor: usize,
    read: bool,
}

struct BufMeta {
    page: u32,
    seq: u64,
    /// Final end of records, recorded when the page is rolled.
    eor: usize,
    /// End of records covered by the next write.
    ceor: usize,
    flags: WriteFlags,
    on_free_list: bool,
    queued: bool,
    in_flight: Option<InFlight>,
    /// A write was requested while another was in flight.
    rewrite: bool,
    done: bool,
    failure: Option<LogError>,
}

impl BufMeta {
    fn new() -> Self {
        Self {
            page: 0,
            seq: 0,
            eor: PAGE_HEADER_LEN,
            ceor: PAGE_HEADER_LEN,
            flags: WriteFlags::NONE,
            on_free_list: true,
            queued: false,
            in_flight: None,
            rewrite: false,
            done: false,
            failure: None,
        }
    }
}

struct PoolState {
    bufs: Vec<BufMeta>,
    free: Vec<BufId>,
    wqueue: VecDeque<BufId>,
}

pub(crate) struct BufferPool {
    state: Mutex<PoolState>,
    free_cv: Condvar,
    io_cv: Condvar,
    pages: Vec<Mutex<Box<[u8]>>>,
}

impl BufferPool {
    pub(crate) fn new(count: usize) -> Self {
        let bufs = (0..count).map(|_| BufMeta::new()).collect();
        let free = (0..count).rev().map(BufId).collect();
        let pages = (0..count)
            .map(|_| Mutex::new(vec![0u8; LOG_PAGE_SIZE].into_boxed_slice()))
            .collect();
        Self {
            state: Mutex::new(PoolState {
                bufs,
                free,
                wqueue: VecDeque::new(),
            }),
            free_cv: Condvar::new(),
            io_cv: Condvar::new(),
            pages,
        }
    }

    /// Page bytes of `buf`.
    pub(crate) fn page(&self, buf: BufId) -> &Mutex<Box<[u8]>> {
        &self.pages[buf.0]
    }
}

/// Point-in-time view of buffer membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolCensus {
    /// Buffers in the pool.
    pub total: usize,
    /// Buffers on the free list.
    pub free: usize,
    /// Buffers on the write queue.
    pub queued: usize,
    /// Buffers with I/O in flight.
    pub in_flight: usize,
    /// Buffers found on both the free list and the write queue.
    pub overlapping: usize,
    /// Membership flags agree with the free list and queue contents.
    pub consistent: bool,
}

impl LogCore {
    /// Takes a buffer from the free list, waiting until one is returned.
    pub(crate) fn buf_alloc(&self, page: u32, seq: u64) -> BufId {
        let buf = {
            let mut pool = self.pool.state.lock();
            let buf = loop {
                if let Some(buf) = pool.free.pop() {
                    break buf;
                }
                self.counters.buffer_waits.fetch_add(1, Ordering::Relaxed);
                debug!(page, "log.buffer.wait_free");
                self.pool.free_cv.wait(&mut pool);
            };
            let meta = &mut pool.bufs[buf.0];
            *meta = BufMeta::new();
            meta.on_free_list = false;
            meta.page = page;
            meta.seq = seq;
            buf
        };
        self.pool.page(buf).lock().fill(0);
        buf
    }

    /// Returns an idle buffer to the free list.
    pub(crate) fn buf_free(&self, buf: BufId) {
        let mut pool = self.pool.state.lock();
        release_to_free_list(&mut pool, buf);
        self.pool.free_cv.notify_one();
    }

    /// Binds a buffer filled by [`Self::buf_read`] to the sequence found on
    /// disk.
    pub(crate) fn set_sequence(&self, buf: BufId, seq: u64) {
        self.pool.state.lock().bufs[buf.0].seq = seq;
    }

    pub(crate) fn set_final_eor(&self, buf: BufId, eor: usize) {
        self.pool.state.lock().bufs[buf.0].eor = eor;
    }

    pub(crate) fn final_eor(&self, buf: BufId) -> usize {
        self.pool.state.lock().bufs[buf.0].eor
    }

    pub(crate) fn buf_is_queued(&self, buf: BufId) -> bool {
        self.pool.state.lock().bufs[buf.0].queued
    }

    /// Requests a write of `buf`.
    ///
    /// The buffer joins the tail of the write queue if it is not already on
    /// it. I/O starts only when the buffer is the queue head; with
    /// `cant_block` the start is handed to the redrive task.
    pub(crate) fn buf_write(
        &self,
        buf: BufId,
        flags: WriteFlags,
        ceor: Option<usize>,
        cant_block: bool,
    ) {
        let start = {
            let mut pool = self.pool.state.lock();
            let busy = {
                let meta = &mut pool.bufs[buf.0];
                assert!(!meta.on_free_list, "write requested for a free log buffer");
                meta.flags = flags;
                meta.done = false;
                meta.failure = None;
                if let Some(ceor) = ceor {
                    meta.ceor = ceor;
                }
                let busy = meta.in_flight.is_some();
                if busy && flags.contains(WriteFlags::WRITE) {
                    meta.rewrite = true;
                }
                busy
            };
            if !pool.bufs[buf.0].queued {
                pool.wqueue.push_back(buf);
                pool.bufs[buf.0].queued = true;
            }
            !busy && pool.wqueue.front() == Some(&buf) && flags.contains(WriteFlags::WRITE)
        };
        if start {
            if cant_block {
                self.redrive(buf);
            } else {
                self.start_io(buf);
            }
        }
    }

    /// Hands `buf` to the redrive task.
    pub(crate) fn redrive(&self, buf: BufId) {
        self.counters.redrives.fetch_add(1, Ordering::Relaxed);
        self.redriver.push(self.me.clone(), buf);
    }

    /// Starts the write of the queue head. Stale requests are ignored.
    pub(crate) fn start_io(&self, buf: BufId) {
        let request = {
            let mut pool = self.pool.state.lock();
            let at_head = pool.wqueue.front() == Some(&buf);
            let meta = &mut pool.bufs[buf.0];
            if !at_head || meta.in_flight.is_some() || !meta.flags.contains(WriteFlags::WRITE) {
                return;
            }
            meta.in_flight = Some(InFlight {
                flags: meta.flags,
                ceor: meta.ceor,
                read: false,
            });
            let mut image = self.pool.page(buf).lock().clone();
            stamp_page(&mut image, meta.seq, meta.ceor);
            debug!(
                page = meta.page,
                seq = meta.seq,
                ceor = meta.ceor,
                "log.buffer.start_write"
            );
            IoRequest::Write {
                buf,
                offset: self.geometry.page_offset(meta.page),
                image,
            }
        };
        self.counters.page_writes.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.driver.submit(request) {
            self.abort_io(buf, err);
        }
    }

    /// Reads `page` into a fresh buffer and waits for it.
    pub(crate) fn buf_read(&self, page: u32) -> Result<BufId> {
        let buf = self.buf_alloc(page, 0);
        {
            let mut pool = self.pool.state.lock();
            pool.bufs[buf.0].in_flight = Some(InFlight {
                flags: WriteFlags::NONE,
                ceor: PAGE_HEADER_LEN,
                read: true,
            });
        }
        let request = IoRequest::Read {
            buf,
            offset: self.geometry.page_offset(page),
        };
        if let Err(err) = self.driver.submit(request) {
            self.abort_io(buf, err);
        }
        let failure = {
            let mut pool = self.pool.state.lock();
            while !pool.bufs[buf.0].done {
                self.pool.io_cv.wait(&mut pool);
            }
            pool.bufs[buf.0].failure.take()
        };
        match failure {
            Some(err) => {
                self.buf_free(buf);
                Err(err)
            }
            None => Ok(buf),
        }
    }

    /// Waits for the synchronous write of `buf`, optionally freeing it.
    pub(crate) fn buf_wait(&self, buf: BufId, free: bool) -> Result<()> {
        let (page, failure) = {
            let mut pool = self.pool.state.lock();
            while !pool.bufs[buf.0].done {
                self.pool.io_cv.wait(&mut pool);
            }
            let meta = &mut pool.bufs[buf.0];
            (meta.page, meta.failure.take())
        };
        if free {
            self.buf_free(buf);
        }
        match failure {
            Some(_) => Err(LogError::WriteFailed(PageNo(page))),
            None => Ok(()),
        }
    }

    /// Completion of the I/O on `buf`; runs on the driver thread.
    pub(crate) fn io_done(&self, buf: BufId, result: Result<()>) {
        let mut redrive = None;
        let mut post_gc = false;
        let failed = result.is_err();
        {
            let mut pool = self.pool.state.lock();
            let Some(io) = pool.bufs[buf.0].in_flight.take() else {
                warn!(buf = buf.0, "log.buffer.spurious_completion");
                return;
            };
            let (page, seq) = {
                let meta = &mut pool.bufs[buf.0];
                meta.done = true;
                meta.failure = result.err();
                (meta.page, meta.seq)
            };
            if io.read {
                self.pool.io_cv.notify_all();
                return;
            }
            if failed {
                self.io_failed.store(true, Ordering::SeqCst);
                self.first_failure.lock().get_or_insert(PageNo(page));
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(page, seq, "log.buffer.write_failed");
            } else if !self.io_failed.load(Ordering::SeqCst) {
                self.durable
                    .fetch_max(Lsn::from_parts(seq, io.ceor).0, Ordering::SeqCst);
            }
            let rewrite = std::mem::take(&mut pool.bufs[buf.0].rewrite);
            if !rewrite {
                let meta = &mut pool.bufs[buf.0];
                meta.flags = meta.flags.without(WriteFlags::WRITE);
            }
            if io.flags.contains(WriteFlags::RELEASE) {
                let head = pool.wqueue.pop_front();
                assert_eq!(head, Some(buf), "completed write was not the queue head");
                pool.bufs[buf.0].queued = false;
                if let Some(&next) = pool.wqueue.front() {
                    if pool.bufs[next.0].flags.contains(WriteFlags::WRITE) {
                        redrive = Some(next);
                    }
                }
            } else if rewrite {
                redrive = Some(buf);
            }
            debug!(page, seq, ceor = io.ceor, failed, "log.buffer.write_done");
            if io.flags.contains(WriteFlags::SYNC) {
                self.pool.io_cv.notify_all();
            } else if io.flags.contains(WriteFlags::GC) {
                post_gc = true;
            } else if io.flags.contains(WriteFlags::FREE) {
                release_to_free_list(&mut pool, buf);
                self.pool.free_cv.notify_one();
            }
        }
        if let Some(next) = redrive {
            self.redrive(next);
        }
        if post_gc {
            self.post_gc(buf, failed);
        }
    }

    fn abort_io(&self, buf: BufId, err: LogError) {
        warn!(buf = buf.0, error = %err, "log.buffer.submit_failed");
        let mut pool = self.pool.state.lock();
        let meta = &mut pool.bufs[buf.0];
        meta.in_flight = None;
        meta.done = true;
        meta.failure = Some(err);
        self.pool.io_cv.notify_all();
    }

    /// Writes a page image outside the write queue and syncs it.
    pub(crate) fn direct_write(&self, page: u32, image: &[u8]) -> Result<()> {
        let offset = self.geometry.page_offset(page);
        self.io
            .write_at(offset, image)
            .and_then(|()| self.io.sync_all())
            .map_err(|err| {
                warn!(page, error = %err, "log.buffer.direct_write_failed");
                err
            })
    }

    pub(crate) fn pool_census(&self) -> PoolCensus {
        let pool = self.pool.state.lock();
        let mut census = PoolCensus {
            total: pool.bufs.len(),
            free: pool.free.len(),
            queued: pool.wqueue.len(),
            consistent: true,
            ..PoolCensus::default()
        };
        for (idx, meta) in pool.bufs.iter().enumerate() {
            let id = BufId(idx);
            let on_free = pool.free.contains(&id);
            let on_queue = pool.wqueue.contains(&id);
            if on_free && on_queue {
                census.overlapping += 1;
            }
            if on_free != meta.on_free_list || on_queue != meta.queued {
                census.consistent = false;
            }
            if meta.in_flight.is_some() {
                census.in_flight += 1;
            }
        }
        census
    }
}

fn release_to_free_list(pool: &mut PoolState, buf: BufId) {
    let meta = &mut pool.bufs[buf.0];
    assert!(
        !meta.queued && meta.in_flight.is_none() && !meta.on_free_list,
        "log buffer released while still in use"
    );
    meta.on_free_list = true;
    pool.free.push(buf);
}
