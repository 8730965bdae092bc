#![forbid(unsafe_code)]

//! On-disk layout of the log: page framing, record descriptors, the
//! superblock, and a forward scanner over the record stream.

use std::fmt;

use uuid::Uuid;

use super::LOG_PAGE_SIZE;
use crate::primitives::io::FileIo;
use crate::types::{crc32_excluding, page_crc32, LogError, Lsn, PageNo, Result};

/// Bytes reserved at the start of every log page.
pub const PAGE_HEADER_LEN: usize = 16;
/// Offset of the page trailer; also the first byte past the record body.
pub const PAGE_BODY_END: usize = LOG_PAGE_SIZE - 16;
/// Record bytes that fit on one page.
pub const PAGE_BODY_LEN: usize = PAGE_BODY_END - PAGE_HEADER_LEN;
/// Encoded size of a [`RecordDesc`].
pub const RECORD_DESC_LEN: usize = 32;
/// Encoded size of a [`SegmentDesc`].
pub const SEGMENT_DESC_LEN: usize = 8;
/// Page holding the superblock.
pub const SUPERBLOCK_PAGE: u32 = 1;
/// First page of the circular data region.
pub const FIRST_DATA_PAGE: u32 = 2;
/// Superblock magic value.
pub const LOG_MAGIC: u32 = 0x8765_4321;
/// Superblock format version.
pub const LOG_VERSION: u32 = 1;
/// Slots in the superblock's active-filesystem table.
pub const MAX_ACTIVE: usize = 128;

const SB_CRC: std::ops::Range<usize> = 60..64;
const SB_ACTIVE_OFFSET: usize = 64;
const SB_LEN: usize = SB_ACTIVE_OFFSET + MAX_ACTIVE * 16;

/// Record type carried in a record descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordKind {
    /// Transaction commit.
    Commit = 0x8000,
    /// Checkpoint marker; the argument holds the sync LSN.
    Checkpoint = 0x4000,
    /// Filesystem mount marker.
    Mount = 0x2000,
    /// Redo image of a metadata unit.
    RedoPage = 0x0800,
    /// Unit freed; earlier redo images must be skipped.
    NoRedoPage = 0x0080,
    /// Allocation map update.
    UpdateMap = 0x0008,
}

impl RecordKind {
    /// Decodes the on-disk value.
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x8000 => RecordKind::Commit,
            0x4000 => RecordKind::Checkpoint,
            0x2000 => RecordKind::Mount,
            0x0800 => RecordKind::RedoPage,
            0x0080 => RecordKind::NoRedoPage,
            0x0008 => RecordKind::UpdateMap,
            _ => return None,
        })
    }

    /// Short lowercase name used in dumps.
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Commit => "commit",
            RecordKind::Checkpoint => "checkpoint",
            RecordKind::Mount => "mount",
            RecordKind::RedoPage => "redo-page",
            RecordKind::NoRedoPage => "noredo-page",
            RecordKind::UpdateMap => "update-map",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-size descriptor that opens every record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordDesc {
    /// Record type.
    pub kind: RecordKind,
    /// Number of segment descriptors trailing the vector bytes.
    pub nsegs: u16,
    /// Length of the vector bytes.
    pub veclen: u32,
    /// Owning transaction, zero for administrative records.
    pub tid: u64,
    /// Start of the previous record of the same transaction.
    pub backchain: Lsn,
    /// Checkpoint: sync LSN. Redo records: metadata unit id.
    pub arg: u64,
}

impl RecordDesc {
    /// Serializes the descriptor.
    pub fn encode(&self) -> [u8; RECORD_DESC_LEN] {
        let mut buf = [0u8; RECORD_DESC_LEN];
        buf[0..2].copy_from_slice(&(self.kind as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&self.nsegs.to_le_bytes());
        buf[4..8].copy_from_slice(&self.veclen.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.backchain.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.arg.to_le_bytes());
        buf
    }

    /// Parses a descriptor.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < RECORD_DESC_LEN {
            return Err(LogError::Corruption("record descriptor truncated"));
        }
        let kind = RecordKind::from_u16(read_u16(src, 0))
            .ok_or(LogError::Corruption("unknown record kind"))?;
        Ok(Self {
            kind,
            nsegs: read_u16(src, 2),
            veclen: read_u32(src, 4),
            tid: read_u64(src, 8),
            backchain: Lsn(read_u64(src, 16)),
            arg: read_u64(src, 24),
        })
    }

    /// Total bytes the record occupies in the stream.
    pub fn encoded_len(&self) -> usize {
        RECORD_DESC_LEN + self.veclen as usize + self.nsegs as usize * SEGMENT_DESC_LEN
    }
}

/// Describes one range of a metadata unit copied into a record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SegmentDesc {
    /// Offset within the unit.
    pub offset: u32,
    /// Length in bytes.
    pub len: u32,
}

impl SegmentDesc {
    /// Serializes the segment descriptor.
    pub fn encode(&self) -> [u8; SEGMENT_DESC_LEN] {
        let mut buf = [0u8; SEGMENT_DESC_LEN];
        buf[0..4].copy_from_slice(&self.offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Parses a segment descriptor.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < SEGMENT_DESC_LEN {
            return Err(LogError::Corruption("segment descriptor truncated"));
        }
        Ok(Self {
            offset: read_u32(src, 0),
            len: read_u32(src, 4),
        })
    }
}

/// Decoded page header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageHeader {
    /// Page sequence number.
    pub sequence: u64,
    /// End of records on the page.
    pub eor: u16,
}

/// Writes header and trailer (sequence, end-of-records, checksum) into a
/// page image.
pub fn stamp_page(page: &mut [u8], sequence: u64, eor: usize) {
    assert_eq!(page.len(), LOG_PAGE_SIZE, "log page image has wrong size");
    assert!(
        (PAGE_HEADER_LEN..=PAGE_BODY_END).contains(&eor),
        "end of records outside page body"
    );
    let eor16 = eor as u16;
    let crc = page_crc32(sequence, eor16, &page[PAGE_HEADER_LEN..eor]);
    page[0..8].copy_from_slice(&sequence.to_le_bytes());
    page[8..10].copy_from_slice(&eor16.to_le_bytes());
    page[10..12].fill(0);
    page[12..16].copy_from_slice(&crc.to_le_bytes());
    let t = PAGE_BODY_END;
    page[t..t + 8].copy_from_slice(&sequence.to_le_bytes());
    page[t + 8..t + 10].copy_from_slice(&eor16.to_le_bytes());
    page[t + 10..LOG_PAGE_SIZE].fill(0);
}

/// Validates header/trailer agreement and the page checksum.
pub fn read_page_header(page: &[u8]) -> Result<PageHeader> {
    if page.len() != LOG_PAGE_SIZE {
        return Err(LogError::Corruption("log page truncated"));
    }
    let sequence = read_u64(page, 0);
    let eor = read_u16(page, 8);
    let t = PAGE_BODY_END;
    if read_u64(page, t) != sequence || read_u16(page, t + 8) != eor {
        return Err(LogError::Corruption("log page header and trailer disagree"));
    }
    let end = eor as usize;
    if !(PAGE_HEADER_LEN..=PAGE_BODY_END).contains(&end) {
        return Err(LogError::Corruption("log page end of records out of range"));
    }
    if read_u32(page, 12) != page_crc32(sequence, eor, &page[PAGE_HEADER_LEN..end]) {
        return Err(LogError::Corruption("log page checksum mismatch"));
    }
    Ok(PageHeader { sequence, eor })
}

/// Placement of the log on its device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogGeometry {
    /// First device block of the log.
    pub base_block: u64,
    /// Device block size in bytes.
    pub block_size: u32,
    /// Log size in pages, including the two reserved pages.
    pub pages: u32,
    /// Log lives inside the filesystem it serves.
    pub inline: bool,
}

impl LogGeometry {
    /// Checks the geometry is addressable.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < 512
            || self.block_size as usize > LOG_PAGE_SIZE
        {
            return Err(LogError::Invalid(
                "block size must be a power of two between 512 and 4096",
            ));
        }
        if self.pages < FIRST_DATA_PAGE + 2 {
            return Err(LogError::Invalid("log needs at least two data pages"));
        }
        Ok(())
    }

    /// Byte offset of `page` on the device.
    pub fn page_offset(&self, page: u32) -> u64 {
        let blocks_per_page = (LOG_PAGE_SIZE as u64) / self.block_size as u64;
        (self.base_block + page as u64 * blocks_per_page) * self.block_size as u64
    }

    /// Number of pages in the circular data region.
    pub fn data_pages(&self) -> u32 {
        self.pages - FIRST_DATA_PAGE
    }

    /// Size of the data region in bytes.
    pub fn log_bytes(&self) -> u64 {
        (self.data_pages() as u64) << super::L2_LOG_PAGE_SIZE
    }

    /// Page following `page` in the circular data region.
    pub fn next_page(&self, page: u32) -> u32 {
        if page + 1 >= self.pages {
            FIRST_DATA_PAGE
        } else {
            page + 1
        }
    }

    /// Physical page currently holding page sequence `sequence`.
    ///
    /// Format gives the first data page sequence `N - 1` and the following
    /// pages `0, 1, ...`; every rollover advances both by one.
    pub fn page_for_sequence(&self, sequence: u64) -> u32 {
        let n = self.data_pages() as u64;
        FIRST_DATA_PAGE + ((sequence + 1) % n) as u32
    }

    /// Converts an append position into the superblock's end-of-log value.
    pub fn end_address(page: u32, eor: usize) -> u64 {
        ((page as u64) << super::L2_LOG_PAGE_SIZE) | eor as u64
    }
}

/// Superblock state word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SuperblockState {
    /// Log is in use; a crash leaves it in this state.
    Mounted,
    /// Last session shut down cleanly.
    Clean,
    /// Redo found the log wrapped over live records.
    Wrapped,
    /// Redo hit an unreadable page.
    ReadError,
}

impl SuperblockState {
    fn to_u32(self) -> u32 {
        match self {
            SuperblockState::Mounted => 0,
            SuperblockState::Clean => 1,
            SuperblockState::Wrapped => 2,
            SuperblockState::ReadError => 3,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => SuperblockState::Mounted,
            1 => SuperblockState::Clean,
            2 => SuperblockState::Wrapped,
            3 => SuperblockState::ReadError,
            _ => return None,
        })
    }
}

/// Contents of the log superblock page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Format version.
    pub version: u32,
    /// Shutdown state.
    pub state: SuperblockState,
    /// Log lives inside its filesystem.
    pub inline: bool,
    /// Log size in pages.
    pub pages: u32,
    /// Device block size.
    pub block_size: u32,
    /// log2 of the device block size.
    pub l2_block_size: u32,
    /// Incremented on every open.
    pub serial: u32,
    /// Last end of log: `page << 12 | offset`.
    pub end: u64,
    /// Identity of this log.
    pub uuid: Uuid,
    /// Filesystems currently using the log.
    pub active: Vec<Uuid>,
}

impl Superblock {
    /// Superblock for a freshly formatted log.
    pub fn new(geometry: &LogGeometry) -> Self {
        Self {
            version: LOG_VERSION,
            state: SuperblockState::Clean,
            inline: geometry.inline,
            pages: geometry.pages,
            block_size: geometry.block_size,
            l2_block_size: geometry.block_size.trailing_zeros(),
            serial: 0,
            end: LogGeometry::end_address(FIRST_DATA_PAGE, PAGE_HEADER_LEN),
            uuid: Uuid::new_v4(),
            active: Vec::new(),
        }
    }

    /// Serializes into a full page image.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; LOG_PAGE_SIZE];
        buf[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.state.to_u32().to_le_bytes());
        buf[12..16].copy_from_slice(&(self.inline as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.pages.to_le_bytes());
        buf[20..24].copy_from_slice(&self.block_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.l2_block_size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.serial.to_le_bytes());
        buf[32..40].copy_from_slice(&self.end.to_le_bytes());
        buf[40..56].copy_from_slice(self.uuid.as_bytes());
        for (slot, id) in self.active.iter().take(MAX_ACTIVE).enumerate() {
            let off = SB_ACTIVE_OFFSET + slot * 16;
            buf[off..off + 16].copy_from_slice(id.as_bytes());
        }
        let crc = superblock_crc(&buf);
        buf[SB_CRC].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses and validates a superblock page.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < SB_LEN {
            return Err(LogError::Corruption("log superblock truncated"));
        }
        if read_u32(src, 0) != LOG_MAGIC {
            return Err(LogError::Corruption("log superblock magic mismatch"));
        }
        let version = read_u32(src, 4);
        if version != LOG_VERSION {
            return Err(LogError::Corruption("log superblock version mismatch"));
        }
        if superblock_crc(src) != read_u32(src, SB_CRC.start) {
            return Err(LogError::Corruption("log superblock crc mismatch"));
        }
        let state = SuperblockState::from_u32(read_u32(src, 8))
            .ok_or(LogError::Corruption("log superblock state unknown"))?;
        let uuid = Uuid::from_slice(&src[40..56])
            .map_err(|_| LogError::Corruption("log superblock uuid malformed"))?;
        let mut active = Vec::new();
        for slot in 0..MAX_ACTIVE {
            let off = SB_ACTIVE_OFFSET + slot * 16;
            let id = Uuid::from_slice(&src[off..off + 16])
                .map_err(|_| LogError::Corruption("log superblock active entry malformed"))?;
            if !id.is_nil() {
                active.push(id);
            }
        }
        Ok(Self {
            version,
            state,
            inline: read_u32(src, 12) & 1 == 1,
            pages: read_u32(src, 16),
            block_size: read_u32(src, 20),
            l2_block_size: read_u32(src, 24),
            serial: read_u32(src, 28),
            end: read_u64(src, 32),
            uuid,
            active,
        })
    }

    /// Splits `end` into (page, offset).
    pub fn end_position(&self) -> (u32, usize) {
        let page = (self.end >> super::L2_LOG_PAGE_SIZE) as u32;
        let eor = (self.end & (LOG_PAGE_SIZE as u64 - 1)) as usize;
        (page, eor)
    }

    /// Records a filesystem as a user of the log.
    pub fn add_active(&mut self, id: Uuid) -> Result<()> {
        if self.active.contains(&id) {
            return Ok(());
        }
        if self.active.len() >= MAX_ACTIVE {
            return Err(LogError::TooManyFilesystems);
        }
        self.active.push(id);
        Ok(())
    }

    /// Removes a filesystem; returns false if it was not registered.
    pub fn remove_active(&mut self, id: Uuid) -> bool {
        let before = self.active.len();
        self.active.retain(|entry| *entry != id);
        self.active.len() != before
    }
}

/// One record decoded by [`RecordScanner`].
#[derive(Clone, Debug)]
pub struct ScannedRecord {
    /// Position of the descriptor.
    pub start: Lsn,
    /// Position just past the record; what `append` returned for it.
    pub end: Lsn,
    /// Decoded descriptor.
    pub desc: RecordDesc,
    /// Vector bytes.
    pub data: Vec<u8>,
    /// Segment descriptors.
    pub segments: Vec<SegmentDesc>,
}

/// Walks the record stream forward from a record boundary.
///
/// The stream continues across pages while each next page carries the next
/// sequence number, and ends on the first page that is not full.
pub struct RecordScanner<'a> {
    io: &'a dyn FileIo,
    geometry: LogGeometry,
    page: u32,
    sequence: u64,
    eor: usize,
    pos: usize,
    image: Vec<u8>,
    ended: bool,
}

impl<'a> RecordScanner<'a> {
    /// Starts scanning at `start`, which must be a record boundary.
    pub fn new(io: &'a dyn FileIo, geometry: LogGeometry, start: Lsn) -> Result<Self> {
        let mut scanner = Self {
            io,
            geometry,
            page: geometry.page_for_sequence(start.sequence()),
            sequence: start.sequence(),
            eor: PAGE_HEADER_LEN,
            pos: start.offset().max(PAGE_HEADER_LEN),
            image: vec![0u8; LOG_PAGE_SIZE],
            ended: false,
        };
        if !scanner.load(scanner.page, scanner.sequence)? {
            return Err(LogError::Corruption("scan start page does not hold the sequence"));
        }
        if scanner.pos > scanner.eor {
            return Err(LogError::Invalid("scan start lies past the end of records"));
        }
        Ok(scanner)
    }

    /// Physical page the scanner is positioned on.
    pub fn page(&self) -> PageNo {
        PageNo(self.page)
    }

    fn load(&mut self, page: u32, sequence: u64) -> Result<bool> {
        self.io
            .read_at(self.geometry.page_offset(page), &mut self.image)?;
        match read_page_header(&self.image) {
            Ok(header) if header.sequence == sequence => {
                self.page = page;
                self.sequence = sequence;
                self.eor = header.eor as usize;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Moves to the next page when the current one is exhausted; returns
    /// false once the stream has ended.
    fn settle(&mut self) -> Result<bool> {
        if self.ended {
            return Ok(false);
        }
        if self.pos < self.eor {
            return Ok(true);
        }
        if self.eor < PAGE_BODY_END {
            self.ended = true;
            return Ok(false);
        }
        let next = self.geometry.next_page(self.page);
        if !self.load(next, self.sequence + 1)? {
            self.ended = true;
            return Ok(false);
        }
        self.pos = PAGE_HEADER_LEN;
        self.settle()
    }

    fn take(&mut self, mut len: usize, out: &mut Vec<u8>) -> Result<()> {
        while len > 0 {
            if !self.settle()? {
                return Err(LogError::Corruption("record truncated at end of log"));
            }
            let n = len.min(self.eor - self.pos);
            out.extend_from_slice(&self.image[self.pos..self.pos + n]);
            self.pos += n;
            len -= n;
        }
        Ok(())
    }

    /// Decodes the next record, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<ScannedRecord>> {
        if !self.settle()? {
            return Ok(None);
        }
        let start = Lsn::from_parts(self.sequence, self.pos);
        let mut raw = Vec::with_capacity(RECORD_DESC_LEN);
        self.take(RECORD_DESC_LEN, &mut raw)?;
        let desc = RecordDesc::decode(&raw)?;
        let mut data = Vec::with_capacity(desc.veclen as usize);
        self.take(desc.veclen as usize, &mut data)?;
        let mut segments = Vec::with_capacity(desc.nsegs as usize);
        for _ in 0..desc.nsegs {
            raw.clear();
            self.take(SEGMENT_DESC_LEN, &mut raw)?;
            segments.push(SegmentDesc::decode(&raw)?);
        }
        Ok(Some(ScannedRecord {
            start,
            end: Lsn::from_parts(self.sequence, self.pos),
            desc,
            data,
            segments,
        }))
    }
}

impl Iterator for RecordScanner<'_> {
    type Item = Result<ScannedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.ended = true;
                Some(Err(err))
            }
        }
    }
}

/// CRC over the superblock fields, skipping the stored checksum.
fn superblock_crc(src: &[u8]) -> u32 {
    crc32_excluding(src, SB_LEN, SB_CRC)
}

fn read_u16(src: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&src[off..off + 2]);
    u16::from_le_bytes(b)
}

fn read_u32(src: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&src[off..off + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(src: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&src[off..off + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(pages: u32) -> LogGeometry {
        LogGeometry {
            base_block: 0,
            block_size: 4096,
            pages,
            inline: false,
        }
    }

    #[test]
    fn stamped_page_validates() {
        let mut page = vec![0u8; LOG_PAGE_SIZE];
        page[16..48].fill(0xAB);
        stamp_page(&mut page, 42, 48);
        let header = read_page_header(&page).unwrap();
        assert_eq!(header.sequence, 42);
        assert_eq!(header.eor, 48);
    }

    #[test]
    fn torn_page_is_detected() {
        let mut page = vec![0u8; LOG_PAGE_SIZE];
        stamp_page(&mut page, 7, 64);
        page[PAGE_BODY_END..PAGE_BODY_END + 8].copy_from_slice(&6u64.to_le_bytes());
        assert!(matches!(
            read_page_header(&page),
            Err(LogError::Corruption(_))
        ));

        let mut page = vec![0u8; LOG_PAGE_SIZE];
        stamp_page(&mut page, 7, 64);
        page[20] ^= 0xFF;
        assert!(matches!(
            read_page_header(&page),
            Err(LogError::Corruption("log page checksum mismatch"))
        ));
    }

    #[test]
    fn record_descriptor_roundtrip_and_length() {
        let desc = RecordDesc {
            kind: RecordKind::RedoPage,
            nsegs: 3,
            veclen: 100,
            tid: 9,
            backchain: Lsn::from_parts(4, 128),
            arg: 77,
        };
        let decoded = RecordDesc::decode(&desc.encode()).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(desc.encoded_len(), 32 + 100 + 24);
    }

    #[test]
    fn unknown_record_kind_is_corruption() {
        let mut raw = [0u8; RECORD_DESC_LEN];
        raw[0..2].copy_from_slice(&0x1234u16.to_le_bytes());
        assert!(RecordDesc::decode(&raw).is_err());
    }

    #[test]
    fn superblock_roundtrip_with_active_table() {
        let mut sb = Superblock::new(&geometry(64));
        let fs = Uuid::new_v4();
        sb.add_active(fs).unwrap();
        sb.serial = 3;
        sb.state = SuperblockState::Mounted;
        let decoded = Superblock::decode(&sb.encode()).unwrap();
        assert_eq!(decoded, sb);
        assert_eq!(decoded.end_position(), (FIRST_DATA_PAGE, PAGE_HEADER_LEN));
        assert!(sb.remove_active(fs));
        assert!(!sb.remove_active(fs));
    }

    #[test]
    fn superblock_crc_detects_flip() {
        let sb = Superblock::new(&geometry(64));
        let mut raw = sb.encode();
        raw[17] ^= 1;
        assert!(matches!(
            Superblock::decode(&raw),
            Err(LogError::Corruption("log superblock crc mismatch"))
        ));
    }

    #[test]
    fn active_table_is_bounded() {
        let mut sb = Superblock::new(&geometry(64));
        for _ in 0..MAX_ACTIVE {
            sb.add_active(Uuid::new_v4()).unwrap();
        }
        assert!(matches!(
            sb.add_active(Uuid::new_v4()),
            Err(LogError::TooManyFilesystems)
        ));
    }

    #[test]
    fn sequence_maps_to_physical_page() {
        let g = geometry(10);
        assert_eq!(g.data_pages(), 8);
        assert_eq!(g.page_for_sequence(7), 2);
        assert_eq!(g.page_for_sequence(0), 3);
        assert_eq!(g.page_for_sequence(6), 9);
        assert_eq!(g.page_for_sequence(15), 2);
        assert_eq!(g.next_page(9), 2);
    }

    #[test]
    fn inline_geometry_addresses_blocks() {
        let g = LogGeometry {
            base_block: 100,
            block_size: 1024,
            pages: 16,
            inline: true,
        };
        assert_eq!(g.page_offset(0), 100 * 1024);
        assert_eq!(g.page_offset(2), (100 + 8) * 1024);
    }
}
