//! # Remote Flush Coordination
//!
//! This module lets a column family's frozen memtables be flushed to a
//! sorted-table file by a **worker** process instead of the local engine
//! thread, using a **memory node** as the in-transit holding area for the
//! memtable's serialized image.
//!
//! ## Roles
//!
//! | Role | Type | Responsibility |
//! |------|------|-----------------|
//! | Generator | [`job::FlushJob`] | Picks memtables, drives the job, commits the result. |
//! | Memory node | [`memory_node::MemoryNodeServer`] | Holds packed memtable images between offer and fetch. |
//! | Worker | [`worker::WorkerServer`] | Reconstructs memtables, builds the sorted table, reports back. |
//!
//! ## Data flow
//!
//! ```text
//! generator --MemtableImage--> memory node
//! generator --RunRequest-----> worker
//! worker    --FetchRequest---> memory node --FetchStream--> worker
//! worker    --RunResult------> generator
//! generator --Release--------> memory node
//! ```
//!
//! Every party communicates using the length-prefixed frames defined in
//! [`protocol`]. The generator is the single source of truth for job
//! progress: memory nodes and workers are stateless with respect to any
//! single flush once it has been released or reported.
//!
//! ## Sub-modules
//!
//! - [`arena`] — serializable block allocator used to transport a memtable's
//!   backing storage.
//! - [`table_properties`] — wire-stable metadata record describing a flush's
//!   output file.
//! - [`protocol`] — framed message types and the [`protocol::Transport`] trait.
//! - [`registry`] — in-memory discovery of generators, memory nodes, and workers.
//! - [`job`] — the flush job state machine run by the generator.
//! - [`memory_node`] — the memory-node accept loop.
//! - [`worker`] — the worker accept loop and build pipeline.

pub mod arena;
pub mod job;
pub mod memory_node;
pub mod protocol;
pub mod registry;
pub mod table_properties;
pub mod worker;

#[cfg(test)]
mod tests;

use std::time::Duration;

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::engine::EngineError;
use crate::manifest::ManifestError;
use crate::memtable::MemtableError;
use crate::sstable::SSTableError;

pub use arena::{ArenaError, SerializableArena};
pub use job::{FlushJob, FlushJobInfo, JobState};
pub use registry::DiscoveryRegistry;
pub use table_properties::TableProperties;

/// Why a flush job was initiated.
///
/// Mirrors the engine's own flush triggers so that a `FlushJobInfo` listener
/// can distinguish automatic background flushes from explicit ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The write buffer filled up and a memtable was frozen.
    WriteBufferFull,
    /// An explicit `flush_all_frozen`-style request.
    Manual,
    /// Issued ahead of engine shutdown to drain frozen memtables.
    Shutdown,
}

/// Errors surfaced by the remote flush coordination subsystem.
#[derive(Debug, Error)]
pub enum RemoteFlushError {
    /// No memory node in the candidate list accepted the job.
    #[error("no memory node available")]
    NoMemNode,

    /// No worker in the candidate list was free within the probe budget.
    #[error("no worker available")]
    NoWorker,

    /// The transport was closed by the remote peer before the protocol completed.
    #[error("transport closed by peer")]
    TransportClosed,

    /// A read or write did not complete within the configured step timeout.
    #[error("transport timed out")]
    TransportTimeout,

    /// A peer sent a message that violates the protocol (bad tag, bad length, wrong state).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A memory node rejected an offer because it is over capacity.
    #[error("memory node out of capacity")]
    OutOfCapacity,

    /// The worker reported a failure while building the output file.
    #[error("remote flush failed: {0}")]
    RemoteFailed(String),

    /// The local fallback path failed.
    #[error("local flush failed: {0}")]
    LocalFailed(String),

    /// The job was cancelled before it committed.
    #[error("flush job cancelled")]
    Cancelled,

    /// The generator is shutting down; no new work may start.
    #[error("shutting down")]
    ShuttingDown,

    /// Error from the shared binary codec.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Error from the serializable arena used to transport memtable images.
    #[error("arena error: {0}")]
    Arena(#[from] arena::ArenaError),

    /// Error from the SSTable writer/reader used on the worker's build path.
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Error from the manifest used to publish a committed flush.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error from the memtable being iterated for a flush image.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error surfaced by the embedding engine.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Underlying I/O error (socket, file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the remote flush coordination subsystem.
///
/// Constructed by the embedding application and passed to [`job::FlushJob::new`].
/// Follows the same plain-data-struct convention as
/// [`EngineConfig`](crate::engine::EngineConfig).
#[derive(Debug, Clone)]
pub struct RemoteFlushConfig {
    /// Master switch. When `false`, [`job::FlushJob::run_remote`] returns
    /// [`RemoteFlushError::NoMemNode`] immediately so callers fall back to
    /// [`job::FlushJob::run_local`].
    pub remote_enabled: bool,

    /// Candidate `(host, port)` pairs for memory nodes, in priority order.
    pub memory_node_endpoints: Vec<(String, u16)>,

    /// Candidate `(host, port)` pairs for workers, in priority order.
    pub worker_endpoints: Vec<(String, u16)>,

    /// Reliable byte-stream transport is always available; set `true` once
    /// an RDMA-backed [`protocol::Transport`] implementation is wired in to
    /// prefer it when available.
    pub rdma_enabled: bool,

    /// Maximum time to wait for any single protocol step (connect, one
    /// frame read/write) before raising [`RemoteFlushError::TransportTimeout`].
    pub per_step_timeout: Duration,

    /// Number of times a `TransportTimeout` or `NoWorker` failure is retried
    /// before giving up and falling back to the local path.
    pub max_retries: u32,

    /// Maximum number of flush jobs a single generator drives concurrently.
    pub max_in_flight_flushes: usize,
}

impl Default for RemoteFlushConfig {
    fn default() -> Self {
        Self {
            remote_enabled: false,
            memory_node_endpoints: Vec::new(),
            worker_endpoints: Vec::new(),
            rdma_enabled: false,
            per_step_timeout: Duration::from_secs(5),
            max_retries: 2,
            max_in_flight_flushes: 1,
        }
    }
}
