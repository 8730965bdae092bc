#![forbid(unsafe_code)]

use std::time::Duration;

use super::format::LogGeometry;

/// Where the log lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLocation {
    /// Inside the filesystem device, starting at `base_block`.
    Inline {
        /// First device block of the log.
        base_block: u64,
        /// Log size in pages.
        pages: u32,
    },
    /// Dedicated device, possibly shared by several filesystems. `pages` is
    /// used by format; open takes the size from the superblock.
    External {
        /// Log size in pages.
        pages: u32,
    },
}

/// Tunables for opening or formatting a log.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Page buffers in the pool; bounds the in-flight write pipeline.
    pub buffer_pages: usize,
    /// Device block size in bytes.
    pub block_size: u32,
    /// Placement of the log.
    pub location: LogLocation,
    /// Times a full drain re-asks clients to write metadata home.
    pub drain_retries: u32,
    /// Pause between drain attempts.
    pub drain_interval: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            buffer_pages: 16,
            block_size: 4096,
            location: LogLocation::External { pages: 1024 },
            drain_retries: 200,
            drain_interval: Duration::from_millis(25),
        }
    }
}

impl LogOptions {
    /// External log of `pages` pages with default tunables.
    pub fn external(pages: u32) -> Self {
        Self {
            location: LogLocation::External { pages },
            ..Self::default()
        }
    }

    /// Inline log at `base_block` with default tunables.
    pub fn inline(base_block: u64, pages: u32) -> Self {
        Self {
            location: LogLocation::Inline { base_block, pages },
            ..Self::default()
        }
    }

    pub(crate) fn normalize(mut self) -> Self {
        if self.buffer_pages < 4 {
            self.buffer_pages = 4;
        }
        if self.drain_retries == 0 {
            self.drain_retries = 1;
        }
        if self.drain_interval.is_zero() {
            self.drain_interval = Duration::from_millis(1);
        }
        self
    }

    /// Geometry described by these options.
    pub fn geometry(&self) -> LogGeometry {
        match self.location {
            LogLocation::Inline { base_block, pages } => LogGeometry {
                base_block,
                block_size: self.block_size,
                pages,
                inline: true,
            },
            LogLocation::External { pages } => LogGeometry {
                base_block: 0,
                block_size: self.block_size,
                pages,
                inline: false,
            },
        }
    }

    /// True for logs that may be shared between filesystems.
    pub fn is_external(&self) -> bool {
        matches!(self.location, LogLocation::External { .. })
    }
}
