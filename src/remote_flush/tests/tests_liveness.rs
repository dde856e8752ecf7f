use std::thread;
use std::time::Duration;

use crate::remote_flush::job::FlushJob;

use super::helpers::*;

#[test]
fn unreachable_worker_is_reaped_after_liveness_timeout() {
    let registry = registry_with_timeout(Duration::from_millis(20));
    registry.register_worker("127.0.0.1", 9);
    let reaper = registry.spawn_reaper(Duration::from_millis(5));

    thread::sleep(Duration::from_millis(100));
    assert!(registry.worker_snapshot().is_empty());

    drop(registry);
    reaper.join().unwrap();
}

#[test]
fn claiming_a_worker_touches_it_and_keeps_it_alive_past_the_timeout() {
    let db_dir = tempfile::tempdir().unwrap();
    let engine = open_engine(db_dir.path());
    freeze_one_memtable(&engine, "liveness");

    let registry = registry_with_timeout(Duration::from_millis(60));
    registry.register_worker("127.0.0.1", 9);
    let reaper = registry.spawn_reaper(Duration::from_millis(10));

    let config = enabled_config(Vec::new(), vec![("127.0.0.1".to_string(), 9)]);
    let mut job = FlushJob::new(
        1,
        0,
        u64::MAX,
        crate::remote_flush::FlushReason::Manual,
        engine,
        config,
        registry.clone(),
        not_shutting_down(),
    );
    assert!(job.pick_memtables().unwrap());

    // match_remote_worker touches the worker on every successful claim,
    // which should keep it alive well past its 60ms liveness timeout.
    for _ in 0..6 {
        thread::sleep(Duration::from_millis(20));
        job.match_remote_worker().unwrap();
        job.quit_remote_worker();
    }
    assert_eq!(registry.worker_snapshot().len(), 1);

    job.cancel().unwrap();
    drop(job);
    drop(registry);
    reaper.join().unwrap();
}
