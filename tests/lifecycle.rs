#![allow(missing_docs)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jlog::log::format::{
    stamp_page, FIRST_DATA_PAGE, PAGE_BODY_END, PAGE_HEADER_LEN, SUPERBLOCK_PAGE,
};
use jlog::log::{
    read_superblock, DeferredUnlock, DirtyRanges, FlushLevel, LifecycleState,
    LogClient, LogGeometry, RecordKind, RecordScanner, SuperblockState, LOG_PAGE_SIZE,
};
use jlog::primitives::io::{FileIo, MemFileIo};
use jlog::{format, Log, LogError, LogManager, LogOptions, LogRecord, Lsn, MetaUnit, Result};
use jlog::{Transaction, TxId, UnitId};
use uuid::Uuid;

fn formatted(options: &LogOptions) -> Arc<MemFileIo> {
    let io = Arc::new(MemFileIo::new());
    format(io.as_ref(), options).unwrap();
    io
}

fn open(manager: &LogManager, io: &Arc<MemFileIo>, options: LogOptions) -> Result<Log> {
    manager.open(Arc::clone(io) as Arc<dyn FileIo>, options)
}

fn scan_all(io: &MemFileIo, geometry: LogGeometry, start: Lsn) -> Vec<(RecordKind, u64)> {
    RecordScanner::new(io, geometry, start)
        .unwrap()
        .map(|record| {
            let record = record.unwrap();
            (record.desc.kind, record.desc.arg)
        })
        .collect()
}

#[test]
fn open_writes_one_checkpoint_on_a_fresh_log() {
    let options = LogOptions::external(16);
    let io = formatted(&options);
    let manager = LogManager::new().unwrap();
    let log = open(&manager, &io, options.clone()).unwrap();

    assert_eq!(log.lifecycle(), LifecycleState::Open);
    let (page, eor) = log.cursor();
    assert_eq!(page.0, FIRST_DATA_PAGE);
    assert_eq!(eor, PAGE_HEADER_LEN + 32);

    let start = Lsn::from_parts(13, PAGE_HEADER_LEN);
    let end = Lsn::from_parts(13, PAGE_HEADER_LEN + 32);
    assert_eq!(log.lsn(), end);
    assert_eq!(log.sync_points(), (end, end));
    assert_eq!(log.durable_lsn(), end);
    assert_eq!(
        scan_all(&io, log.geometry(), start),
        vec![(RecordKind::Checkpoint, 0)]
    );

    let sb = read_superblock(io.as_ref(), &options.geometry()).unwrap();
    assert_eq!(sb.state, SuperblockState::Mounted);
    assert_eq!(sb.serial, 1);
}

#[test]
fn clean_shutdown_records_the_end_and_reopens() {
    let options = LogOptions::external(32);
    let io = formatted(&options);
    let manager = LogManager::new().unwrap();
    let log = open(&manager, &io, options.clone()).unwrap();
    for arg in 1..=5 {
        log.append(None, LogRecord::new(RecordKind::UpdateMap).with_arg(arg), None)
            .unwrap();
    }
    let before = log.lsn();
    log.shutdown().unwrap();
    assert_eq!(log.lifecycle(), LifecycleState::Closed);
    // A second shutdown is a no-op.
    log.shutdown().unwrap();
    assert!(matches!(
        log.append(None, LogRecord::redo(), None),
        Err(LogError::Closed)
    ));

    let sb = read_superblock(io.as_ref(), &options.geometry()).unwrap();
    assert_eq!(sb.state, SuperblockState::Clean);
    let (page, eor) = sb.end_position();
    assert_eq!(page, FIRST_DATA_PAGE);
    // Five records plus the final checkpoint follow the open checkpoint.
    assert_eq!(eor, PAGE_HEADER_LEN + 32 * 7);

    let again = open(&manager, &io, options).unwrap();
    assert!(again.lsn() > before);
    assert_eq!(again.superblock().serial, 2);
    assert_eq!(again.cursor(), (jlog::PageNo(FIRST_DATA_PAGE), eor + 32));

    let start = Lsn::from_parts(29, PAGE_HEADER_LEN);
    let kinds: Vec<_> = scan_all(&io, again.geometry(), start)
        .into_iter()
        .map(|(kind, _)| kind)
        .collect();
    assert_eq!(kinds.len(), 8);
    assert_eq!(kinds[0], RecordKind::Checkpoint);
    assert!(kinds[1..6].iter().all(|kind| *kind == RecordKind::UpdateMap));
    assert_eq!(kinds[6..], [RecordKind::Checkpoint, RecordKind::Checkpoint]);
    again.shutdown().unwrap();
}

#[test]
fn open_after_crash_needs_recovery() {
    let options = LogOptions::external(16);
    let io = formatted(&options);
    let manager = LogManager::new().unwrap();
    let log = open(&manager, &io, options.clone()).unwrap();
    log.append(None, LogRecord::redo(), None).unwrap();
    drop(log);

    assert!(matches!(
        open(&manager, &io, options),
        Err(LogError::NeedsRecovery)
    ));
}

#[test]
fn full_end_page_rolls_on_open() {
    let options = LogOptions::external(16);
    let io = formatted(&options);
    let geometry = options.geometry();

    let mut page = vec![0u8; LOG_PAGE_SIZE];
    stamp_page(&mut page, 13, PAGE_BODY_END);
    io.write_at(geometry.page_offset(FIRST_DATA_PAGE), &page)
        .unwrap();
    let mut sb = read_superblock(io.as_ref(), &geometry).unwrap();
    sb.end = LogGeometry::end_address(FIRST_DATA_PAGE, PAGE_BODY_END);
    io.write_at(geometry.page_offset(SUPERBLOCK_PAGE), &sb.encode())
        .unwrap();

    let manager = LogManager::new().unwrap();
    let log = open(&manager, &io, options).unwrap();
    assert_eq!(log.cursor(), (jlog::PageNo(FIRST_DATA_PAGE + 1), PAGE_HEADER_LEN + 32));
    assert_eq!(log.stats().rollovers, 1);
    assert_eq!(log.lsn(), Lsn::from_parts(14, PAGE_HEADER_LEN + 32));
    log.shutdown().unwrap();
}

#[test]
fn end_page_disagreeing_with_superblock_is_corruption() {
    let options = LogOptions::external(16);
    let io = formatted(&options);
    let geometry = options.geometry();
    let mut sb = read_superblock(io.as_ref(), &geometry).unwrap();
    sb.end = LogGeometry::end_address(FIRST_DATA_PAGE, 200);
    io.write_at(geometry.page_offset(SUPERBLOCK_PAGE), &sb.encode())
        .unwrap();

    let manager = LogManager::new().unwrap();
    assert!(matches!(
        open(&manager, &io, options),
        Err(LogError::Corruption(_))
    ));
}

#[test]
fn inline_log_lives_at_its_base_block() {
    let options = LogOptions::inline(100, 24);
    let io = formatted(&options);
    assert!(io.len().unwrap() >= options.geometry().page_offset(24));

    let manager = LogManager::new().unwrap();
    let log = open(&manager, &io, options.clone()).unwrap();
    assert!(log.superblock().inline);
    log.append(None, LogRecord::redo(), None).unwrap();
    log.shutdown().unwrap();

    // Nothing was written below the base block.
    let image = io.snapshot();
    assert!(image[..100 * 4096].iter().all(|b| *b == 0));

    let resized = LogOptions::inline(100, 32);
    assert!(matches!(
        open(&manager, &io, resized),
        Err(LogError::Corruption(_))
    ));
    let external = LogOptions::external(24);
    let io_external = Arc::new(MemFileIo::new());
    io_external.write_at(0, &io.snapshot()[100 * 4096..]).unwrap();
    assert!(matches!(
        open(&manager, &io_external, external),
        Err(LogError::Corruption(_))
    ));
}

#[test]
fn block_size_mismatch_is_rejected() {
    let options = LogOptions {
        block_size: 1024,
        ..LogOptions::external(16)
    };
    let io = formatted(&options);
    let manager = LogManager::new().unwrap();
    assert!(matches!(
        open(&manager, &io, LogOptions::external(16)),
        Err(LogError::Corruption(_))
    ));
    let log = open(&manager, &io, options).unwrap();
    log.shutdown().unwrap();
}

#[derive(Default)]
struct Unlocks(Mutex<Vec<TxId>>);

impl DeferredUnlock for Unlocks {
    fn unlock(&self, tx: TxId, durable: bool) {
        assert!(durable);
        self.0.lock().unwrap().push(tx);
    }
}

/// Filesystem that writes every unit home once its commit is durable.
struct HomeWriter {
    id: Uuid,
    units: Mutex<Vec<Arc<MetaUnit>>>,
}

impl HomeWriter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            units: Mutex::new(Vec::new()),
        })
    }
}

impl LogClient for HomeWriter {
    fn id(&self) -> Uuid {
        self.id
    }

    fn flush_metadata(&self, log: &Log, _hard: bool) -> Result<()> {
        let durable = log.durable_lsn();
        let mut units = self.units.lock().unwrap();
        let mut kept = Vec::new();
        for unit in units.drain(..) {
            match unit.commit_lsn() {
                Some(clsn) if clsn <= durable => log.unit_written(&unit)?,
                _ => kept.push(unit),
            }
        }
        *units = kept;
        Ok(())
    }
}

#[test]
fn unmount_drains_lazy_commits_before_shutdown() {
    let options = LogOptions::external(64);
    let io = formatted(&options);
    let manager = LogManager::new().unwrap();
    let fs = HomeWriter::new();
    let log = manager
        .mount(
            "/dev/log".into(),
            Arc::clone(&io) as Arc<dyn FileIo>,
            options.clone(),
            fs.clone(),
        )
        .unwrap();

    let unlocks = Arc::new(Unlocks::default());
    let image = vec![7u8; 256];
    for id in 1..=3u64 {
        let unit = MetaUnit::new(UnitId(id));
        let tx = Transaction::lazy(TxId(id), unlocks.clone());
        log.append(
            Some(&tx),
            LogRecord::redo(),
            Some(&DirtyRanges::new(&unit, &image).with_segment(0, 64)),
        )
        .unwrap();
        log.append(Some(&tx), LogRecord::commit(), None).unwrap();
        log.commit(&tx).unwrap();
        fs.units.lock().unwrap().push(unit);
    }
    assert_eq!(log.stats().pending_commits, 3);

    manager.unmount(&log, fs.id()).unwrap();
    assert_eq!(log.lifecycle(), LifecycleState::Closed);
    let stats = log.stats();
    assert_eq!(stats.pending_commits, 0);
    assert_eq!(stats.checkpoint_entries, 0);
    assert_eq!(stats.transactions_committed, 3);
    assert!(fs.units.lock().unwrap().is_empty());

    let sb = read_superblock(io.as_ref(), &options.geometry()).unwrap();
    assert_eq!(sb.state, SuperblockState::Clean);
    assert!(sb.active.is_empty());
    let mut unlocked = unlocks.0.lock().unwrap().clone();
    unlocked.sort();
    assert_eq!(unlocked, vec![TxId(1), TxId(2), TxId(3)]);
}

#[test]
fn shutdown_reports_undrained_metadata() {
    let options = LogOptions {
        drain_retries: 2,
        drain_interval: Duration::from_millis(1),
        ..LogOptions::external(64)
    };
    let io = formatted(&options);
    let manager = LogManager::new().unwrap();
    let log = open(&manager, &io, options).unwrap();

    let unit = MetaUnit::new(UnitId(1));
    let image = vec![1u8; 64];
    let tx = Transaction::forced(TxId(1));
    log.append(
        Some(&tx),
        LogRecord::redo(),
        Some(&DirtyRanges::new(&unit, &image).with_segment(0, 64)),
    )
    .unwrap();
    log.append(Some(&tx), LogRecord::commit(), None).unwrap();
    log.commit(&tx).unwrap();

    // No client writes the unit home, so the drain gives up.
    assert!(matches!(
        log.flush(FlushLevel::Drain),
        Err(LogError::DrainIncomplete(_))
    ));
    assert!(matches!(log.shutdown(), Err(LogError::DrainIncomplete(_))));
    assert_eq!(log.lifecycle(), LifecycleState::Open);

    log.unit_written(&unit).unwrap();
    log.shutdown().unwrap();
    assert_eq!(log.lifecycle(), LifecycleState::Closed);
}
