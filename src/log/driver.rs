#![forbid(unsafe_code)]

//! Page I/O threads.
//!
//! Each log owns one driver thread that performs submitted page I/O in
//! order and then runs the completion handler, so completions for a log
//! are handled by a single consumer. Completion never starts I/O itself:
//! it queues the buffer on the manager's redrive thread.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::buffer::BufId;
use super::LogCore;
use crate::primitives::io::FileIo;
use crate::types::{LogError, Result};

pub(crate) enum IoRequest {
    Write {
        buf: BufId,
        offset: u64,
        image: Box<[u8]>,
    },
    Read {
        buf: BufId,
        offset: u64,
    },
}

impl IoRequest {
    fn buf(&self) -> BufId {
        match self {
            IoRequest::Write { buf, .. } | IoRequest::Read { buf, .. } => *buf,
        }
    }
}

/// Per-log I/O thread.
#[derive(Default)]
pub(crate) struct IoDriver {
    sender: Mutex<Option<Sender<IoRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IoDriver {
    pub(crate) fn start(&self, core: Weak<LogCore>, io: Arc<dyn FileIo>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("jlog-io".into())
            .spawn(move || Self::worker_loop(core, io, rx))?;
        *self.sender.lock() = Some(tx);
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn submit(&self, request: IoRequest) -> Result<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(LogError::Closed)?;
        sender.send(request).map_err(|_| LogError::Closed)
    }

    /// Stops accepting I/O and waits for queued requests to finish.
    pub(crate) fn stop(&self) {
        self.sender.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn worker_loop(core: Weak<LogCore>, io: Arc<dyn FileIo>, rx: Receiver<IoRequest>) {
        while let Ok(request) = rx.recv() {
            let Some(core) = core.upgrade() else {
                debug!("log.driver.orphaned");
                break;
            };
            let buf = request.buf();
            let result = match request {
                IoRequest::Write { offset, image, .. } => io
                    .write_at(offset, &image)
                    .and_then(|()| io.sync_all()),
                IoRequest::Read { offset, .. } => {
                    let mut page = core.pool.page(buf).lock();
                    io.read_at(offset, &mut page[..])
                }
            };
            core.io_done(buf, result);
        }
        debug!("log.driver.exit");
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
struct RedriveQueue {
    items: VecDeque<(Weak<LogCore>, BufId)>,
    shutdown: bool,
}

#[derive(Default)]
struct RedriveInner {
    queue: Mutex<RedriveQueue>,
    cv: Condvar,
}

/// Background thread that starts I/O the completion path may not start
/// directly. Shared by every log of a manager.
pub(crate) struct Redriver {
    inner: Arc<RedriveInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Redriver {
    pub(crate) fn spawn() -> Result<Arc<Self>> {
        let inner = Arc::new(RedriveInner::default());
        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("jlog-redrive".into())
            .spawn(move || Self::run(worker))?;
        Ok(Arc::new(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn push(&self, log: Weak<LogCore>, buf: BufId) {
        let mut queue = self.inner.queue.lock();
        queue.items.push_back((log, buf));
        self.inner.cv.notify_one();
    }

    fn run(inner: Arc<RedriveInner>) {
        loop {
            let (log, buf) = {
                let mut queue = inner.queue.lock();
                loop {
                    if let Some(item) = queue.items.pop_front() {
                        break item;
                    }
                    if queue.shutdown {
                        debug!("log.redrive.exit");
                        return;
                    }
                    inner.cv.wait(&mut queue);
                }
            };
            if let Some(core) = log.upgrade() {
                debug!(buf = buf.0, "log.redrive.start");
                core.start_io(buf);
            }
        }
    }
}

impl Drop for Redriver {
    fn drop(&mut self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
            self.inner.cv.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
