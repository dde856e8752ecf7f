use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use crate::remote_flush::job::{FlushJob, JobState};
use crate::remote_flush::memory_node::MemoryNodeServer;
use crate::remote_flush::worker::WorkerServer;

use super::helpers::*;

#[test]
fn remote_flush_round_trip_commits_via_worker() {
    let mem_node = MemoryNodeServer::bind("127.0.0.1:0", 1 << 20).unwrap();
    let mem_addr = mem_node.local_addr().unwrap();
    thread::spawn(move || {
        let _ = mem_node.serve();
    });

    let worker = WorkerServer::bind("127.0.0.1:0", Duration::from_secs(2)).unwrap();
    let worker_addr = worker.local_addr().unwrap();
    thread::spawn(move || {
        let _ = worker.serve();
    });

    let db_dir = tempdir().unwrap();
    let engine = open_engine(db_dir.path());
    freeze_one_memtable(&engine, "remote");

    let output_dir = tempdir().unwrap();
    let config = enabled_config(
        vec![("127.0.0.1".to_string(), mem_addr.port())],
        vec![("127.0.0.1".to_string(), worker_addr.port())],
    );

    let registry = fresh_registry();
    registry.register_worker("127.0.0.1", worker_addr.port());

    let mut job = FlushJob::new(
        10,
        0,
        u64::MAX,
        crate::remote_flush::FlushReason::WriteBufferFull,
        engine,
        config.clone(),
        registry,
        not_shutting_down(),
    );

    assert!(job.pick_memtables().unwrap());
    job.match_mem_node(&config.memory_node_endpoints).unwrap();
    job.match_remote_worker().unwrap();

    job.run_remote(&output_dir.path().to_string_lossy())
        .unwrap();

    assert_eq!(job.state(), JobState::Committed);
    let (file_name, file_size, properties) = job.out_files()[0].clone().unwrap();
    assert!(file_size > 0);
    assert!(properties.num_entries > 0);
    assert!(!file_name.is_empty());
}
