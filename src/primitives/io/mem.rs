#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::FileIo;
use crate::types::{LogError, Result};

/// In-memory log device.
///
/// Besides plain storage it can inject write failures at chosen offsets and
/// hold writes at a gate, which lets callers observe a write while it is in
/// flight.
#[derive(Clone, Default)]
pub struct MemFileIo {
    inner: Arc<MemInner>,
}

#[derive(Default)]
struct MemInner {
    data: Mutex<Vec<u8>>,
    faults: Mutex<FaultPlan>,
    gate: Mutex<GateState>,
    gate_cv: Condvar,
    writes: Mutex<HashMap<u64, u64>>,
}

#[derive(Default)]
struct FaultPlan {
    fail_offsets: HashSet<u64>,
    fail_next: u32,
}

#[derive(Default)]
struct GateState {
    held: bool,
    waiting: usize,
}

impl MemFileIo {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled device of `len` bytes.
    pub fn with_len(len: u64) -> Self {
        let io = Self::default();
        io.inner.data.lock().resize(len as usize, 0);
        io
    }

    /// Makes every write starting at `off` fail until faults are cleared.
    pub fn fail_writes_at(&self, off: u64) {
        self.inner.faults.lock().fail_offsets.insert(off);
    }

    /// Makes the next `count` writes fail regardless of offset.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.faults.lock().fail_next = count;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        let mut faults = self.inner.faults.lock();
        faults.fail_offsets.clear();
        faults.fail_next = 0;
    }

    /// Blocks subsequent writes until [`MemFileIo::release_writes`].
    pub fn hold_writes(&self) {
        self.inner.gate.lock().held = true;
    }

    /// Lets held writes proceed.
    pub fn release_writes(&self) {
        let mut gate = self.inner.gate.lock();
        gate.held = false;
        self.inner.gate_cv.notify_all();
    }

    /// Waits until at least `count` writers are parked at the gate.
    pub fn wait_for_held_writes(&self, count: usize) {
        let mut gate = self.inner.gate.lock();
        while gate.waiting < count {
            self.inner.gate_cv.wait(&mut gate);
        }
    }

    /// Number of completed or failed writes issued at `off`.
    pub fn write_count(&self, off: u64) -> u64 {
        self.inner.writes.lock().get(&off).copied().unwrap_or(0)
    }

    /// Total number of writes issued against the device.
    pub fn total_writes(&self) -> u64 {
        self.inner.writes.lock().values().sum()
    }

    /// Copies the current device contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    fn pass_gate(&self) {
        let mut gate = self.inner.gate.lock();
        if !gate.held {
            return;
        }
        gate.waiting += 1;
        self.inner.gate_cv.notify_all();
        while gate.held {
            self.inner.gate_cv.wait(&mut gate);
        }
        gate.waiting -= 1;
    }

    fn injected_failure(&self, off: u64) -> bool {
        let mut faults = self.inner.faults.lock();
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return true;
        }
        faults.fail_offsets.contains(&off)
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.inner.data.lock();
        let start = off as usize;
        let end = start
            .checked_add(dst.len())
            .ok_or(LogError::Invalid("read offset overflow"))?;
        if end > data.len() {
            return Err(LogError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.pass_gate();
        *self.inner.writes.lock().entry(off).or_insert(0) += 1;
        if self.injected_failure(off) {
            return Err(LogError::Io(io::Error::new(
                ErrorKind::Other,
                "injected write failure",
            )));
        }
        let mut data = self.inner.data.lock();
        let start = off as usize;
        let end = start + src.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.data.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.data.lock().resize(len as usize, 0);
        Ok(())
    }
}
