use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use crate::remote_flush::job::FlushJob;
use crate::remote_flush::FlushReason;

use super::helpers::*;

/// Reproduces the cross-job commit-ordering scenario: two jobs on the same
/// column family, the later-assigned `max_memtable_id` must not commit
/// before the earlier one, even though its own local work finishes first.
#[test]
fn later_job_blocks_on_commit_until_earlier_job_commits() {
    let db_dir = tempdir().unwrap();
    let engine = open_engine(db_dir.path());
    // 128-byte write buffer, 32 small puts: freezes several memtables, the
    // oldest gets wal_seq 0.
    freeze_one_memtable(&engine, "order");

    let registry = fresh_registry();

    let mut job_a = FlushJob::new(
        1,
        0,
        0,
        FlushReason::Manual,
        engine.clone(),
        disabled_config(),
        registry.clone(),
        not_shutting_down(),
    );
    assert!(job_a.pick_memtables().unwrap());

    let mut job_b = FlushJob::new(
        2,
        0,
        u64::MAX,
        FlushReason::Manual,
        engine,
        disabled_config(),
        registry,
        not_shutting_down(),
    );
    assert!(job_b.pick_memtables().unwrap());

    let order = Arc::new(Mutex::new(Vec::new()));
    let order_b = Arc::clone(&order);
    let b_handle = thread::spawn(move || {
        job_b.run_local().unwrap();
        order_b.lock().unwrap().push(2u64);
    });

    // Give job_b's thread plenty of time to reach its commit step; it must
    // stay blocked behind job_a's still-pending max_memtable_id.
    thread::sleep(Duration::from_millis(150));
    assert!(
        order.lock().unwrap().is_empty(),
        "later job committed before the earlier one"
    );

    job_a.run_local().unwrap();
    order.lock().unwrap().push(1u64);

    b_handle.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}
