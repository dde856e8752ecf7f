use tempfile::tempdir;

use crate::remote_flush::job::{FlushJob, JobState};
use crate::remote_flush::{FlushReason, RemoteFlushError};

use super::helpers::*;

#[test]
fn empty_endpoint_list_falls_back_to_local() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    freeze_one_memtable(&engine, "k");

    let mut job = FlushJob::new(
        1,
        0,
        u64::MAX,
        FlushReason::WriteBufferFull,
        engine.clone(),
        disabled_config(),
        fresh_registry(),
        not_shutting_down(),
    );

    assert!(job.pick_memtables().unwrap());
    let err = job.match_mem_node(&[]).unwrap_err();
    assert!(matches!(err, RemoteFlushError::NoMemNode));

    job.run_local().unwrap();
    assert_eq!(job.state(), JobState::Committed);
    assert!(job.out_files()[0].is_some());
}

#[test]
fn pick_memtables_with_no_frozen_data_cancels() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());

    let mut job = FlushJob::new(
        2,
        0,
        u64::MAX,
        FlushReason::Manual,
        engine,
        disabled_config(),
        fresh_registry(),
        not_shutting_down(),
    );

    let picked_any = job.pick_memtables().unwrap();
    assert!(!picked_any);
    assert_eq!(job.state(), JobState::Cancelled);
}
