//! The full commit pipeline against the real log manager: records are
//! framed to a file, and callbacks fire only once the flush has synced.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use basalt_mvcc::TransactionManager;
use basalt_storage::{
    BlockLayout, ColumnKind, ColumnValue, DataTable, ProjectedDelta, RecordBufferPool, VarlenEntry,
};
use basalt_types::{ColumnId, TableId, WorkerId};
use basalt_wal::{verify_log, LogManager};

fn fixture(path: &std::path::Path) -> (Arc<LogManager>, TransactionManager, Arc<DataTable>) {
    let pool = Arc::new(RecordBufferPool::new(1024));
    let log = Arc::new(LogManager::create(path).unwrap());
    let manager = TransactionManager::new(Arc::clone(&pool), true, Some(Arc::clone(&log) as _));
    let table = Arc::new(DataTable::new(
        TableId::new(3),
        BlockLayout::new(vec![ColumnKind::Fixed, ColumnKind::Varlen]),
        16,
        pool,
    ));
    (log, manager, table)
}

#[test]
fn commit_becomes_durable_only_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let (log, manager, table) = fixture(&dir.path().join("basalt.log"));

    let fired = Arc::new(AtomicUsize::new(0));
    let in_callback = Arc::clone(&fired);

    let txn = manager.begin(None);
    table
        .insert(
            &*txn,
            vec![
                Some(ColumnValue::Fixed(42)),
                Some(ColumnValue::Varlen(VarlenEntry::from_slice(b"ledger"))),
            ],
        )
        .unwrap();
    manager.commit(
        &txn,
        Box::new(move || {
            in_callback.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(!txn.is_log_processed());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(log.queued_buffers(), 1);

    let summary = log.flush().unwrap();
    // One redo frame plus one commit frame.
    assert_eq!(summary.frames, 2);
    assert_eq!(summary.commits, 1);
    assert!(txn.is_log_processed());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn read_only_commits_flow_through_but_leave_no_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basalt.log");
    let (log, manager, _table) = fixture(&path);

    let worker = manager.register_worker(WorkerId::new(0));
    let txn = manager.begin(Some(&worker));
    manager.commit(&txn, Box::new(|| {}));

    let summary = log.flush().unwrap();
    assert_eq!(summary.frames, 0);
    assert_eq!(summary.commits, 1);
    assert!(txn.is_log_processed());
    assert_eq!(verify_log(&path).unwrap(), 0);
    manager.unregister_worker(&worker);
}

#[test]
fn aborted_transactions_never_reach_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basalt.log");
    let (log, manager, table) = fixture(&path);

    let txn = manager.begin(None);
    let slot = table
        .insert(
            &*txn,
            vec![
                Some(ColumnValue::Fixed(1)),
                Some(ColumnValue::Varlen(VarlenEntry::from_slice(b"discard"))),
            ],
        )
        .unwrap();
    table
        .update(
            &*txn,
            slot,
            ProjectedDelta::new([ColumnId::new(1)], [Some(ColumnValue::Fixed(2))]).unwrap(),
        )
        .unwrap();
    manager.abort(&txn);

    assert_eq!(log.queued_buffers(), 0);
    log.flush().unwrap();
    assert_eq!(verify_log(&path).unwrap(), 0);
    assert!(txn.is_log_processed());
}

#[test]
fn interleaved_commits_verify_in_order_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basalt.log");
    let (log, manager, table) = fixture(&path);

    for i in 0..5_u64 {
        let txn = manager.begin(None);
        table
            .insert(
                &*txn,
                vec![
                    Some(ColumnValue::Fixed(i)),
                    Some(ColumnValue::Varlen(VarlenEntry::from_slice(b"row"))),
                ],
            )
            .unwrap();
        manager.commit(&txn, Box::new(|| {}));
    }
    log.flush().unwrap();

    // Five redo frames plus five commit frames, all structurally sound.
    assert_eq!(verify_log(&path).unwrap(), 10);
}
