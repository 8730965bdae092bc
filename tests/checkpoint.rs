#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use jlog::log::{DeferredUnlock, DirtyRanges, FlushLevel, LogClient, RecordKind};
use jlog::primitives::io::{FileIo, MemFileIo};
use jlog::{format, Log, LogError, LogManager, LogOptions, LogRecord, MetaUnit, Result};
use jlog::{Transaction, TxId, UnitId};
use uuid::Uuid;

fn open_log(pages: u32) -> (LogManager, Log) {
    let io = Arc::new(MemFileIo::new());
    let options = LogOptions::external(pages);
    format(io.as_ref(), &options).unwrap();
    let manager = LogManager::new().unwrap();
    let log = manager.open(io as Arc<dyn FileIo>, options).unwrap();
    (manager, log)
}

fn assert_ordered(log: &Log) {
    let (syncpt, sync) = log.sync_points();
    assert!(syncpt <= sync, "syncpt {syncpt} past sync {sync}");
    assert!(sync <= log.lsn(), "sync {sync} past lsn {}", log.lsn());
}

fn log_unit(log: &Log, tx: &Arc<Transaction>, unit: &Arc<MetaUnit>, image: &[u8]) {
    let ranges = DirtyRanges::new(unit, image).with_segment(0, image.len() as u32);
    log.append(Some(tx), LogRecord::redo(), Some(&ranges)).unwrap();
}

fn commit_forced(log: &Log, id: u64, unit: &Arc<MetaUnit>, image: &[u8]) -> Arc<Transaction> {
    let tx = Transaction::forced(TxId(id));
    log_unit(log, &tx, unit, image);
    log.append(Some(&tx), LogRecord::commit(), None).unwrap();
    log.commit(&tx).unwrap();
    tx
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Default)]
struct Unlocks(Mutex<Vec<(TxId, bool)>>);

impl DeferredUnlock for Unlocks {
    fn unlock(&self, tx: TxId, durable: bool) {
        self.0.lock().unwrap().push((tx, durable));
    }
}

struct Ignore;

impl DeferredUnlock for Ignore {
    fn unlock(&self, _tx: TxId, _durable: bool) {}
}

#[test]
fn checkpoint_follows_the_oldest_dirty_unit() {
    let (_manager, log) = open_log(64);
    let image = vec![3u8; 100];
    log.append(None, LogRecord::new(RecordKind::UpdateMap), None)
        .unwrap();

    let a = MetaUnit::new(UnitId(1));
    let b = MetaUnit::new(UnitId(2));
    commit_forced(&log, 1, &a, &image);
    commit_forced(&log, 2, &b, &image);
    let a_lsn = a.lsn().unwrap();
    let b_lsn = b.lsn().unwrap();
    assert!(a_lsn < b_lsn);
    assert_eq!(log.stats().checkpoint_entries, 2);

    assert_eq!(log.checkpoint(false).unwrap(), a_lsn);
    assert_ordered(&log);

    log.unit_written(&a).unwrap();
    assert!(!a.is_dirty());
    assert_eq!(log.checkpoint(false).unwrap(), b_lsn);
    assert_ordered(&log);

    log.unit_written(&b).unwrap();
    let end = log.lsn();
    assert_eq!(log.checkpoint(true).unwrap(), end);
    assert_eq!(log.stats().checkpoint_entries, 0);
    assert_ordered(&log);

    // With nothing dirty the checkpoint moves up to the end of the log.
    let lsn = log.lsn();
    assert_eq!(log.checkpoint(false).unwrap(), lsn);
    assert!(log.lsn() > lsn);
}

#[test]
fn unit_written_requires_a_durable_commit() {
    let (_manager, log) = open_log(64);
    let image = vec![9u8; 64];

    let clean = MetaUnit::new(UnitId(1));
    log.unit_written(&clean).unwrap();

    let pending = MetaUnit::new(UnitId(2));
    let open_tx = Transaction::forced(TxId(1));
    log_unit(&log, &open_tx, &pending, &image);
    assert!(matches!(log.unit_written(&pending), Err(LogError::Invalid(_))));

    let unit = MetaUnit::new(UnitId(3));
    let lazy = Transaction::lazy(TxId(2), Arc::new(Ignore));
    log_unit(&log, &lazy, &unit, &image);
    let clsn = log.append(Some(&lazy), LogRecord::commit(), None).unwrap();
    log.commit(&lazy).unwrap();
    assert_eq!(unit.commit_lsn(), Some(clsn));
    assert!(log.durable_lsn() < clsn);
    assert!(matches!(log.unit_written(&unit), Err(LogError::Invalid(_))));
    assert!(unit.is_dirty());

    log.flush(FlushLevel::Latest).unwrap();
    log.unit_written(&unit).unwrap();
    assert!(!unit.is_dirty());
    assert_eq!(unit.commit_lsn(), None);
}

#[test]
fn appends_trigger_checkpoints_as_the_log_fills() {
    let (_manager, log) = open_log(64);
    let image = vec![0x11; 2000];
    for id in 1..=20 {
        let unit = MetaUnit::new(UnitId(id));
        commit_forced(&log, id, &unit, &image);
        log.unit_written(&unit).unwrap();
        assert_ordered(&log);
    }
    let stats = log.stats();
    assert!(stats.checkpoints >= 2, "checkpoints: {}", stats.checkpoints);
    assert_eq!(stats.wrap_collapses, 0);
    assert_eq!(stats.checkpoint_entries, 0);
}

#[test]
fn sync_barrier_holds_new_transactions_until_the_last_one_ends() {
    let (_manager, log) = open_log(64);
    let unit = MetaUnit::new(UnitId(1));
    let image = vec![0x22; 2000];

    log.begin_transaction().unwrap();
    let tx = Transaction::forced(TxId(1));
    for _ in 0..200 {
        if log.sync_barrier() {
            break;
        }
        log_unit(&log, &tx, &unit, &image);
    }
    assert!(log.sync_barrier());
    assert_eq!(log.stats().barriers_raised, 1);

    let admitted = AtomicBool::new(false);
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            log.begin_transaction().unwrap();
            admitted.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst));

        log.end_transaction().unwrap();
        waiter.join().unwrap();
    });
    assert!(admitted.load(Ordering::SeqCst));
    assert!(!log.sync_barrier());
    log.end_transaction().unwrap();
}

#[test]
fn quarter_full_log_flushes_queued_commits_without_a_barrier() {
    let (_manager, log) = open_log(64);
    let unit = MetaUnit::new(UnitId(1));
    let image = vec![0x2D; 2000];
    let open = Transaction::forced(TxId(1));
    for _ in 0..40 {
        log_unit(&log, &open, &unit, &image);
    }

    let unlocks = Arc::new(Unlocks::default());
    let lazy = Transaction::lazy(TxId(2), unlocks.clone());
    log.append(Some(&lazy), LogRecord::commit(), None).unwrap();
    log.commit(&lazy).unwrap();

    // No transaction is admitted, so nothing is held back, but the
    // checkpoint still pushes the queued commit out.
    log.checkpoint(false).unwrap();
    wait_until(|| !unlocks.0.lock().unwrap().is_empty());
    assert_eq!(*unlocks.0.lock().unwrap(), vec![(TxId(2), true)]);
    assert!(!log.sync_barrier());
    assert_eq!(log.stats().barriers_raised, 0);
    assert_ordered(&log);
}

#[test]
fn pinned_log_space_reports_log_full() {
    let (_manager, log) = open_log(8);
    let unit = MetaUnit::new(UnitId(1));
    let image = vec![0x33; 2000];
    let tx = Transaction::forced(TxId(1));

    let mut full = false;
    for _ in 0..64 {
        let before = log.lsn();
        let ranges = DirtyRanges::new(&unit, &image).with_segment(0, 2000);
        match log.append(Some(&tx), LogRecord::redo(), Some(&ranges)) {
            Ok(_) => assert_ordered(&log),
            Err(LogError::LogFull) => {
                assert_eq!(log.lsn(), before);
                full = true;
                break;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert!(full);
    let lsn = unit.lsn().unwrap();
    assert!(log.lsn().sequence() < lsn.sequence() + log.geometry().data_pages() as u64);
    assert!(log.stats().wrap_collapses > 0);
}

/// Writes every unit home as soon as its commit is durable.
struct HomeWriter {
    id: Uuid,
    units: Mutex<Vec<Arc<MetaUnit>>>,
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
fn written_units_let_the_log_wrap() {
    let io = Arc::new(MemFileIo::new());
    let options = LogOptions::external(16);
    format(io.as_ref(), &options).unwrap();
    let manager = LogManager::new().unwrap();
    let fs = Arc::new(HomeWriter {
        id: Uuid::new_v4(),
        units: Mutex::new(Vec::new()),
    });
    let log = manager
        .mount("/dev/wrap".into(), io as Arc<dyn FileIo>, options, fs.clone())
        .unwrap();
    let first = log.lsn();

    let image = vec![0x44; 1500];
    for id in 1..=100 {
        let unit = MetaUnit::new(UnitId(id));
        commit_forced(&log, id, &unit, &image);
        fs.units.lock().unwrap().push(unit);
    }

    let data_pages = log.geometry().data_pages() as u64;
    assert!(log.lsn().sequence() > first.sequence() + data_pages);
    assert_ordered(&log);
    let stats = log.stats();
    assert!(stats.rollovers > data_pages);
    assert_eq!(stats.transactions_committed, 100);

    manager.unmount(&log, fs.id).unwrap();
    assert_eq!(log.stats().checkpoint_entries, 0);
}

#[test]
fn checkpoint_of_a_closed_log_fails() {
    let (_manager, log) = open_log(16);
    log.shutdown().unwrap();
    assert!(matches!(log.checkpoint(false), Err(LogError::Closed)));
    assert!(matches!(log.begin_transaction(), Err(LogError::Closed)));
}
