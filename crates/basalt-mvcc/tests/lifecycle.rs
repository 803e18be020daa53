//! End-to-end lifecycle scenarios: begin/commit/abort against a real table,
//! with visibility, rollback, and loose-payload reclamation checked from
//! the outside.

use std::sync::Arc;

use basalt_mvcc::TransactionManager;
use basalt_storage::{
    BlockLayout, ColumnKind, ColumnValue, DataTable, LogRecord, LogSink, ProjectedDelta,
    RecordBufferPool, VarlenEntry,
};
use basalt_types::{ColumnId, TableId, Timestamp, WorkerId};
use parking_lot::Mutex;

const COL_BALANCE: ColumnId = ColumnId::new(1);
const COL_NOTE: ColumnId = ColumnId::new(2);

fn setup(gc: bool) -> (TransactionManager, Arc<DataTable>) {
    let pool = Arc::new(RecordBufferPool::new(4096));
    let manager = TransactionManager::new(Arc::clone(&pool), gc, None);
    let table = Arc::new(DataTable::new(
        TableId::new(7),
        BlockLayout::new(vec![ColumnKind::Fixed, ColumnKind::Varlen]),
        64,
        pool,
    ));
    (manager, table)
}

fn row(balance: u64, note: &[u8]) -> Vec<Option<ColumnValue>> {
    vec![
        Some(ColumnValue::Fixed(balance)),
        Some(ColumnValue::Varlen(VarlenEntry::from_slice(note))),
    ]
}

fn delta(balance: u64, note: &[u8]) -> ProjectedDelta {
    ProjectedDelta::new(
        [COL_BALANCE, COL_NOTE],
        [
            Some(ColumnValue::Fixed(balance)),
            Some(ColumnValue::Varlen(VarlenEntry::from_slice(note))),
        ],
    )
    .unwrap()
}

fn balance_of(cells: &[Option<ColumnValue>]) -> u64 {
    cells[0].as_ref().unwrap().as_fixed().unwrap()
}

fn note_of(cells: &[Option<ColumnValue>]) -> &[u8] {
    cells[1].as_ref().unwrap().as_varlen().unwrap().as_bytes()
}

#[test]
fn insert_commit_stamps_every_undo_record() {
    let (manager, table) = setup(false);
    let txn = manager.begin(None);
    let slot = table.insert(&*txn, row(10, b"opening")).unwrap();

    let commit = manager.commit(&txn, Box::new(|| {}));
    assert!(commit > txn.start_time());
    assert_eq!(txn.txn_id(), commit);
    for idx in txn.undo_record_indices() {
        let stamp = manager
            .buffer_pool()
            .with_undo(idx, |rec| rec.timestamp().load())
            .unwrap();
        assert_eq!(stamp, commit);
    }

    let reader = manager.begin(None);
    let cells = table.select(&*reader, slot).unwrap();
    assert_eq!(balance_of(&cells), 10);
    assert_eq!(note_of(&cells), b"opening");
    manager.commit(&reader, Box::new(|| {}));
}

#[test]
fn insert_abort_deallocates_and_reclaims_varlen() {
    let (manager, table) = setup(false);
    let txn = manager.begin(None);
    let slot = table.insert(&*txn, row(10, b"short-lived")).unwrap();
    manager.abort(&txn);

    let accessor = table.accessor();
    assert!(!accessor.is_allocated(slot));
    assert!(!accessor.is_present(slot));
    assert_eq!(accessor.read_version_ptr(slot), None);

    let loose = txn.loose_entries();
    assert_eq!(loose.len(), 1);
    assert_eq!(loose[0].as_bytes(), b"short-lived");

    // Abort allocates no timestamp: only begin consumed a tick.
    assert_eq!(manager.get_timestamp(), Timestamp::new(1));
}

#[test]
fn snapshot_isolation_around_an_update() {
    let (manager, table) = setup(false);
    let setup_txn = manager.begin(None);
    let slot = table.insert(&*setup_txn, row(10, b"v1")).unwrap();
    manager.commit(&setup_txn, Box::new(|| {}));

    let early_reader = manager.begin(None);
    let writer = manager.begin(None);
    assert!(table.update(&*writer, slot, delta(20, b"v2")).unwrap());

    // The writer sees its own uncommitted write; the earlier snapshot does
    // not.
    assert_eq!(balance_of(&table.select(&*writer, slot).unwrap()), 20);
    assert_eq!(balance_of(&table.select(&*early_reader, slot).unwrap()), 10);

    manager.commit(&writer, Box::new(|| {}));
    assert_eq!(balance_of(&table.select(&*early_reader, slot).unwrap()), 10);

    let late_reader = manager.begin(None);
    let cells = table.select(&*late_reader, slot).unwrap();
    assert_eq!(balance_of(&cells), 20);
    assert_eq!(note_of(&cells), b"v2");

    manager.commit(&early_reader, Box::new(|| {}));
    manager.commit(&late_reader, Box::new(|| {}));
}

#[test]
fn update_abort_restores_the_before_image() {
    let (manager, table) = setup(false);
    let setup_txn = manager.begin(None);
    let slot = table.insert(&*setup_txn, row(10, b"durable")).unwrap();
    manager.commit(&setup_txn, Box::new(|| {}));

    let writer = manager.begin(None);
    assert!(table.update(&*writer, slot, delta(99, b"doomed")).unwrap());
    manager.abort(&writer);

    let reader = manager.begin(None);
    let cells = table.select(&*reader, slot).unwrap();
    assert_eq!(balance_of(&cells), 10);
    assert_eq!(note_of(&cells), b"durable");

    // The overwritten in-place payload went to the loose list.
    let loose = writer.loose_entries();
    assert_eq!(loose.len(), 1);
    assert_eq!(loose[0].as_bytes(), b"doomed");
    manager.commit(&reader, Box::new(|| {}));
}

#[test]
fn lost_race_update_abort_reclaims_the_staged_payload() {
    let (manager, table) = setup(false);
    let setup_txn = manager.begin(None);
    let slot = table.insert(&*setup_txn, row(10, b"base")).unwrap();
    manager.commit(&setup_txn, Box::new(|| {}));

    let loser = manager.begin(None);
    let winner = manager.begin(None);
    assert!(table.update(&*winner, slot, delta(30, b"winner")).unwrap());
    assert!(!table.update(&*loser, slot, delta(20, b"loser")).unwrap());

    // The loser's undo record was never installed.
    let last = loser.undo_record_indices().pop().unwrap();
    let installed = manager
        .buffer_pool()
        .with_undo(last, |rec| rec.table().is_some())
        .unwrap();
    assert!(!installed);

    manager.abort(&loser);
    let loose = loser.loose_entries();
    assert_eq!(loose.len(), 1);
    assert_eq!(loose[0].as_bytes(), b"loser");

    // The winner's write was untouched by the loser's abort.
    assert_eq!(balance_of(&table.select(&*winner, slot).unwrap()), 30);
    manager.commit(&winner, Box::new(|| {}));

    let reader = manager.begin(None);
    assert_eq!(note_of(&table.select(&*reader, slot).unwrap()), b"winner");
    manager.commit(&reader, Box::new(|| {}));
}

#[test]
fn delete_roundtrip_and_abort() {
    let (manager, table) = setup(false);
    let setup_txn = manager.begin(None);
    let slot = table.insert(&*setup_txn, row(5, b"row")).unwrap();
    manager.commit(&setup_txn, Box::new(|| {}));

    let deleter = manager.begin(None);
    assert!(table.delete(&*deleter, slot).unwrap());
    assert!(table.select(&*deleter, slot).is_none());
    manager.abort(&deleter);

    let reader = manager.begin(None);
    assert!(table.select(&*reader, slot).is_some());
    manager.commit(&reader, Box::new(|| {}));

    let deleter2 = manager.begin(None);
    let before_delete = manager.begin(None);
    assert!(table.delete(&*deleter2, slot).unwrap());
    manager.commit(&deleter2, Box::new(|| {}));

    // A snapshot from before the delete still sees the row.
    assert!(table.select(&*before_delete, slot).is_some());
    manager.commit(&before_delete, Box::new(|| {}));

    let after = manager.begin(None);
    assert!(table.select(&*after, slot).is_none());
    manager.commit(&after, Box::new(|| {}));
}

#[test]
fn second_write_over_own_delete_installs() {
    let (manager, table) = setup(false);
    let setup_txn = manager.begin(None);
    let slot = table.insert(&*setup_txn, row(10, b"kept")).unwrap();
    manager.commit(&setup_txn, Box::new(|| {}));

    // A transaction's own delete is not a conflict for its later writes on
    // the same slot.
    let txn = manager.begin(None);
    assert!(table.delete(&*txn, slot).unwrap());
    assert!(table.update(&*txn, slot, delta(20, b"revised")).unwrap());
    assert!(table.delete(&*txn, slot).unwrap());
    manager.abort(&txn);

    // Unwinding the whole sequence lands back on the committed image.
    let reader = manager.begin(None);
    let cells = table.select(&*reader, slot).unwrap();
    assert_eq!(balance_of(&cells), 10);
    assert_eq!(note_of(&cells), b"kept");
    manager.commit(&reader, Box::new(|| {}));
}

#[test]
fn abort_purity_no_chain_carries_the_aborters_id() {
    let (manager, table) = setup(false);
    let setup_txn = manager.begin(None);
    let s1 = table.insert(&*setup_txn, row(1, b"one")).unwrap();
    let s2 = table.insert(&*setup_txn, row(2, b"two")).unwrap();
    manager.commit(&setup_txn, Box::new(|| {}));

    let txn = manager.begin(None);
    assert!(table.update(&*txn, s1, delta(11, b"one'")).unwrap());
    assert!(table.update(&*txn, s2, delta(22, b"two'")).unwrap());
    assert!(table.update(&*txn, s1, delta(111, b"one''")).unwrap());
    let aborter_id = txn.txn_id();
    manager.abort(&txn);

    for slot in [s1, s2] {
        let mut cursor = table.accessor().read_version_ptr(slot);
        while let Some(idx) = cursor {
            let (stamp, next) = manager
                .buffer_pool()
                .with_undo(idx, |rec| (rec.timestamp().load(), rec.next()))
                .unwrap();
            assert_ne!(stamp, aborter_id);
            cursor = next;
        }
    }
}

#[test]
fn worker_registry_membership_tracks_begin_and_commit() {
    let (manager, _table) = setup(true);
    let worker = manager.register_worker(WorkerId::new(9));

    let t1 = manager.begin(Some(&worker));
    let t2 = manager.begin(Some(&worker));
    assert_eq!(worker.live_count(), 2);

    manager.commit(&t1, Box::new(|| {}));
    assert_eq!(worker.live_count(), 1);
    manager.abort(&t2);
    assert_eq!(worker.live_count(), 0);

    assert_eq!(manager.completed_transactions_for_gc().len(), 2);
    manager.unregister_worker(&worker);
}

/// A sink that only records; nothing becomes durable until the test says
/// so. Lets the commit protocol around `log_processed` be observed.
struct HoldingSink {
    batches: Mutex<Vec<Vec<LogRecord>>>,
}

impl LogSink for HoldingSink {
    fn accept(&self, records: Vec<LogRecord>) {
        self.batches.lock().push(records);
    }
}

#[test]
fn read_only_commit_record_reaches_the_sink() {
    let pool = Arc::new(RecordBufferPool::new(64));
    let sink = Arc::new(HoldingSink {
        batches: Mutex::new(Vec::new()),
    });
    let manager = TransactionManager::new(pool, false, Some(Arc::clone(&sink) as _));

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let in_callback = Arc::clone(&fired);
    let txn = manager.begin(None);
    let commit = manager.commit(
        &txn,
        Box::new(move || in_callback.store(true, std::sync::atomic::Ordering::SeqCst)),
    );

    // Until the log processes the record, the commit is not durable and
    // the callback has not run.
    assert!(!txn.is_log_processed());
    assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));

    let mut batches = sink.batches.lock();
    assert_eq!(batches.len(), 1);
    let mut records = batches.pop().unwrap();
    drop(batches);
    assert_eq!(records.len(), 1);
    let Some(LogRecord::Commit(record)) = records.pop() else {
        panic!("expected a single commit record");
    };
    assert!(record.is_read_only());
    assert_eq!(record.commit_time(), commit);

    record.mark_durable();
    assert!(txn.is_log_processed());
    assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
}
