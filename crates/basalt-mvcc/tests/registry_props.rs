//! Property tests over arbitrary begin/commit/abort interleavings: the
//! watermark stays conservative, commit timestamps stay ordered, and every
//! completed transaction reaches the handoff queue exactly once.

use std::sync::Arc;

use basalt_mvcc::{TransactionContext, TransactionManager};
use basalt_storage::RecordBufferPool;
use basalt_types::{Timestamp, WorkerId};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Begin { on_worker: bool },
    CommitOldest,
    AbortNewest,
    Watermark,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => any::<bool>().prop_map(|on_worker| Op::Begin { on_worker }),
        2 => Just(Op::CommitOldest),
        1 => Just(Op::AbortNewest),
        1 => Just(Op::Watermark),
    ]
}

proptest! {
    #[test]
    fn lifecycle_interleavings_hold_invariants(
        ops in proptest::collection::vec(op_strategy(), 1..120)
    ) {
        let manager = TransactionManager::new(
            Arc::new(RecordBufferPool::new(4096)),
            true,
            None,
        );
        let worker = manager.register_worker(WorkerId::new(0));

        let mut live: Vec<Arc<TransactionContext>> = Vec::new();
        let mut completed = 0_usize;
        let mut last_commit = Timestamp::new(-1);

        for op in ops {
            match op {
                Op::Begin { on_worker } => {
                    let txn = manager.begin(on_worker.then_some(&worker));
                    // Strictly younger than everything already live.
                    for other in &live {
                        prop_assert!(txn.start_time() > other.start_time());
                    }
                    live.push(txn);
                }
                Op::CommitOldest => {
                    if live.is_empty() {
                        continue;
                    }
                    let txn = live.remove(0);
                    let commit = manager.commit(&txn, Box::new(|| {}));
                    prop_assert!(commit > txn.start_time());
                    prop_assert!(commit > last_commit);
                    last_commit = commit;
                    completed += 1;
                }
                Op::AbortNewest => {
                    let Some(txn) = live.pop() else { continue };
                    manager.abort(&txn);
                    prop_assert!(txn.txn_id().is_uncommitted());
                    completed += 1;
                }
                Op::Watermark => {
                    let watermark = manager.oldest_transaction_start_time();
                    for txn in &live {
                        prop_assert!(watermark <= txn.start_time());
                    }
                }
            }
        }

        let min_live = live.iter().map(|t| t.start_time()).min();
        let watermark = manager.oldest_transaction_start_time();
        if let Some(min_live) = min_live {
            prop_assert!(watermark <= min_live);
        }

        for txn in live.drain(..) {
            manager.abort(&txn);
            completed += 1;
        }
        manager.unregister_worker(&worker);

        prop_assert_eq!(manager.completed_transactions_for_gc().len(), completed);
    }
}
