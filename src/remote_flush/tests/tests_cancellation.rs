use tempfile::tempdir;

use crate::remote_flush::job::{FlushJob, JobState};
use crate::remote_flush::{FlushReason, RemoteFlushError};

use super::helpers::*;

#[test]
fn pick_memtables_refuses_when_shutting_down() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    freeze_one_memtable(&engine, "k");

    let mut job = FlushJob::new(
        3,
        0,
        u64::MAX,
        FlushReason::Shutdown,
        engine,
        disabled_config(),
        fresh_registry(),
        already_shutting_down(),
    );

    let err = job.pick_memtables().unwrap_err();
    assert!(matches!(err, RemoteFlushError::ShuttingDown));
    assert_eq!(job.state(), JobState::Cancelled);
}

#[test]
fn cancel_after_pick_returns_memtables_to_engine() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    freeze_one_memtable(&engine, "k");

    let mut job = FlushJob::new(
        4,
        0,
        u64::MAX,
        FlushReason::Manual,
        engine.clone(),
        disabled_config(),
        fresh_registry(),
        not_shutting_down(),
    );
    assert!(job.pick_memtables().unwrap());
    assert_eq!(job.state(), JobState::Picked);

    job.cancel().unwrap();
    assert_eq!(job.state(), JobState::Cancelled);

    // The frozen memtable should be back on the engine, available to a
    // fresh job.
    let mut retry = FlushJob::new(
        5,
        0,
        u64::MAX,
        FlushReason::Manual,
        engine,
        disabled_config(),
        fresh_registry(),
        not_shutting_down(),
    );
    assert!(retry.pick_memtables().unwrap());
}
