use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use crate::remote_flush::job::{FlushJob, JobState};
use crate::remote_flush::memory_node::MemoryNodeServer;
use crate::remote_flush::protocol::{
    HelloMessage, MessageKind, RunRequestMessage, TcpTransport, Transport,
};
use crate::remote_flush::worker::WorkerServer;
use crate::remote_flush::FlushReason;

use super::helpers::*;

/// Accepts exactly one connection, reads through `RunRequest` (so the
/// generator believes the job was accepted), then drops the connection
/// without ever sending `RunResult` — simulating a worker crashing
/// mid-build.
fn spawn_crashing_worker() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            let mut transport = TcpTransport::from_stream(stream);
            let _: Result<HelloMessage, _> = transport.recv_message(MessageKind::Hello);
            let _: Result<RunRequestMessage, _> = transport.recv_message(MessageKind::RunRequest);
            // Drop without replying: the generator observes TransportClosed.
        }
    });
    addr
}

#[test]
fn transport_closed_mid_run_retries_on_a_second_worker() {
    let mem_node = MemoryNodeServer::bind("127.0.0.1:0", 1 << 20).unwrap();
    let mem_addr = mem_node.local_addr().unwrap();
    thread::spawn(move || {
        let _ = mem_node.serve();
    });

    let crasher_addr = spawn_crashing_worker();

    let good_worker = WorkerServer::bind("127.0.0.1:0", Duration::from_secs(2)).unwrap();
    let good_addr = good_worker.local_addr().unwrap();
    thread::spawn(move || {
        let _ = good_worker.serve();
    });

    let db_dir = tempdir().unwrap();
    let engine = open_engine(db_dir.path());
    freeze_one_memtable(&engine, "retry");

    let output_dir = tempdir().unwrap();
    let config = enabled_config(
        vec![("127.0.0.1".to_string(), mem_addr.port())],
        Vec::new(),
    );

    let registry = fresh_registry();
    // Only the crashing worker is known when the job first matches a
    // worker; the good one is registered afterwards so the retry path
    // has somewhere to land.
    registry.register_worker("127.0.0.1", crasher_addr.port());

    let mut job = FlushJob::new(
        20,
        0,
        u64::MAX,
        FlushReason::WriteBufferFull,
        engine,
        config.clone(),
        registry.clone(),
        not_shutting_down(),
    );

    assert!(job.pick_memtables().unwrap());
    job.match_mem_node(&config.memory_node_endpoints).unwrap();
    let (claimed_host, claimed_port) = job.match_remote_worker().unwrap();
    assert_eq!(claimed_port, crasher_addr.port());
    assert_eq!(claimed_host, "127.0.0.1");

    registry.register_worker("127.0.0.1", good_addr.port());

    job.run_remote(&output_dir.path().to_string_lossy())
        .expect("job should recover by retrying on the second worker");

    assert_eq!(job.state(), JobState::Committed);
    let (_, file_size, properties) = job.out_files()[0].clone().unwrap();
    assert!(file_size > 0);
    assert!(properties.num_entries > 0);
}
