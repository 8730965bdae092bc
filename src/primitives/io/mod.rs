#![forbid(unsafe_code)]

//! Positioned I/O against log devices.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::types::{LogError, Result};

mod mem;

pub use mem::MemFileIo;

/// Positioned I/O against the device holding a log.
///
/// Log pages are always read and written whole at page-aligned offsets; a
/// short transfer is an error.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from the device starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Makes completed writes durable.
    fn sync_all(&self) -> Result<()>;
    /// Current device length in bytes.
    fn len(&self) -> Result<u64>;
    /// Resizes the device; format uses it to extend image files.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// Log device backed by a file or block device node.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Wraps an open handle.
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Opens a device read-write, creating an image file if it is missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

#[cfg(unix)]
fn read_full(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(dst, off)
}

#[cfg(unix)]
fn write_full(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(src, off)
}

#[cfg(windows)]
fn read_full(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        match file.seek_read(dst, off)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                dst = &mut dst[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_full(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        match file.seek_write(src, off)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                src = &src[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_full(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(any(unix, windows)))]
fn write_full(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        read_full(&self.file, off, dst).map_err(LogError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_full(&self.file, off, src).map_err(LogError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_data().map_err(LogError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(LogError::from)
    }
}
