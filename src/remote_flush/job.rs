//! Flush job state machine driven by the generator (the local engine).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::encoding::encode_vec;
use tracing::{info, warn};

use crate::engine::utils::{MergeIterator, PointEntry, Record, RangeTombstone};
use crate::engine::Engine;
use crate::memtable::{FrozenMemtable, MemtableRecord};
use crate::sstable::{self, SSTable};

use super::protocol::{
    HelloMessage, MemtableImageMessage, MessageKind, OfferAckMessage, OfferJobMessage, PeerRole,
    ReleaseMessage, RunRequestMessage, RunResultMessage, RunStatus, TcpTransport, Transport,
};
use super::registry::DiscoveryRegistry;
use super::table_properties::TableProperties;
use super::{FlushReason, RemoteFlushConfig, RemoteFlushError};

/// States a [`FlushJob`] moves through. Every job reaches exactly one of
/// `Committed`, `Cancelled`, or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Newly created, no memtables picked yet.
    Idle,
    /// `pick_memtables` succeeded; memtables are held under this job.
    Picked,
    /// A memory node accepted an offer for this job's images.
    MemMatched,
    /// A worker has been claimed to run this job.
    WorkerMatched,
    /// `run_remote`/`run_local` is executing.
    Running,
    /// The version edit was published; terminal.
    Committed,
    /// The job was abandoned before committing; terminal.
    Cancelled,
    /// The job hit an unrecoverable error; terminal.
    Failed,
}

/// Snapshot handed to listeners on every state transition.
#[derive(Debug, Clone)]
pub struct FlushJobInfo {
    /// Identifier of the job this snapshot describes.
    pub job_id: u64,
    /// Column family the job is flushing.
    pub column_family_id: u64,
    /// Current state.
    pub state: JobState,
    /// Why the flush was initiated.
    pub reason: FlushReason,
    /// Populated once the job reaches `Failed`.
    pub error: Option<String>,
}

type Listener = Box<dyn Fn(&FlushJobInfo) + Send + Sync>;

/// One memtable materialized for transport: its logical records plus a
/// parity arena image (see [`super::arena::SerializableArena`] docs).
struct PreparedImage {
    column_family_id: u64,
    earliest_lsn: u64,
    max_lsn: u64,
    records: Vec<u8>,
    arena_image: Vec<u8>,
    size_bytes: u64,
}

/// Drives one memtable flush from picking through commit, either by
/// dispatching it to a remote worker or by running it locally.
pub struct FlushJob {
    job_id: u64,
    column_family_id: u64,
    max_memtable_id: u64,
    reason: FlushReason,
    engine: Engine,
    config: RemoteFlushConfig,
    registry: Arc<DiscoveryRegistry>,
    shutting_down: Arc<AtomicBool>,
    state: JobState,
    picked: Vec<FrozenMemtable>,
    mem_node: Option<(String, u16)>,
    mem_node_reservation: Option<u64>,
    worker: Option<(String, u16)>,
    /// Four output slots per the on-disk atomic-flush convention; this crate
    /// only ever populates slot zero.
    out_files: [Option<(String, u64, TableProperties)>; 4],
    listeners: Vec<Listener>,
    last_error: Option<String>,
    /// Whether this job's `max_memtable_id` is currently registered with the
    /// registry's commit-ordering gate (see [`FlushJob::commit`]).
    registered_commit: bool,
}

impl FlushJob {
    /// Creates a new job in [`JobState::Idle`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: u64,
        column_family_id: u64,
        max_memtable_id: u64,
        reason: FlushReason,
        engine: Engine,
        config: RemoteFlushConfig,
        registry: Arc<DiscoveryRegistry>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id,
            column_family_id,
            max_memtable_id,
            reason,
            engine,
            config,
            registry,
            shutting_down,
            state: JobState::Idle,
            picked: Vec::new(),
            mem_node: None,
            mem_node_reservation: None,
            worker: None,
            out_files: [None, None, None, None],
            listeners: Vec::new(),
            last_error: None,
            registered_commit: false,
        }
    }

    /// Registers a listener invoked on every state transition.
    pub fn add_listener(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// The job's four output slots; this crate only ever populates slot zero.
    pub fn out_files(&self) -> &[Option<(String, u64, TableProperties)>; 4] {
        &self.out_files
    }

    fn transition(&mut self, state: JobState) {
        self.state = state;
        let info = FlushJobInfo {
            job_id: self.job_id,
            column_family_id: self.column_family_id,
            state,
            reason: self.reason,
            error: self.last_error.clone(),
        };
        for listener in &self.listeners {
            listener(&info);
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Records `err` as the job's failure, transitions to `Failed`, and
    /// releases this job's slot in the commit-ordering gate so jobs behind
    /// it on the same column family are not blocked forever. Returns `err`
    /// unchanged so call sites can use it with `map_err`.
    fn fail(&mut self, err: RemoteFlushError) -> RemoteFlushError {
        self.last_error = Some(err.to_string());
        self.transition(JobState::Failed);
        self.complete_pending_commit();
        err
    }

    /// Picks the longest prefix of frozen memtables whose WAL ids are at
    /// most `max_memtable_id`. Returns `Ok(false)` (job transitions to
    /// `Cancelled`) if there is nothing eligible.
    pub fn pick_memtables(&mut self) -> Result<bool, RemoteFlushError> {
        if self.is_shutting_down() {
            self.transition(JobState::Cancelled);
            return Err(RemoteFlushError::ShuttingDown);
        }

        loop {
            let Some(frozen) = self.engine.take_oldest_frozen()? else {
                break;
            };
            let wal_id = frozen.memtable.wal.wal_seq();
            if wal_id > self.max_memtable_id {
                self.engine.return_frozen(frozen)?;
                break;
            }
            self.picked.push(frozen);
        }

        if self.picked.is_empty() {
            self.transition(JobState::Cancelled);
            return Ok(false);
        }

        self.registry
            .register_pending_commit(self.column_family_id, self.max_memtable_id);
        self.registered_commit = true;
        self.transition(JobState::Picked);
        Ok(true)
    }

    /// Releases this job's slot in the registry's commit-ordering gate, if
    /// it ever registered one. Idempotent: safe to call from every terminal
    /// transition (`Committed`, `Cancelled`, `Failed`).
    fn complete_pending_commit(&mut self) {
        if self.registered_commit {
            self.registered_commit = false;
            self.registry
                .complete_commit(self.column_family_id, self.max_memtable_id);
        }
    }

    /// Registers every candidate with the registry (if not already known),
    /// then repeatedly reserves capacity for this job's picked memtables
    /// against whichever registered node has the most headroom, probing it
    /// for reachability before accepting it. A reachable-but-unreachable
    /// node is evicted from the registry and the next-best candidate is
    /// tried. Fails with [`RemoteFlushError::NoMemNode`] once no registered
    /// node has enough headroom, or if the subsystem is disabled entirely.
    pub fn match_mem_node(&mut self, candidates: &[(String, u16)]) -> Result<(String, u16), RemoteFlushError> {
        if !self.config.remote_enabled {
            return Err(RemoteFlushError::NoMemNode);
        }
        let needed_bytes = self.estimate_picked_bytes()?;
        for (host, port) in candidates {
            self.registry.register_mem_node(host.clone(), *port, u64::MAX);
        }
        loop {
            let Some((host, port)) = self.registry.reserve_mem_node(needed_bytes) else {
                return Err(RemoteFlushError::NoMemNode);
            };
            if TcpTransport::connect(&host, port, self.config.per_step_timeout).is_ok() {
                self.registry.touch(&host, port);
                self.mem_node = Some((host.clone(), port));
                self.mem_node_reservation = Some(needed_bytes);
                self.transition(JobState::MemMatched);
                return Ok((host, port));
            }
            self.registry.release_mem_node(&host, port, needed_bytes);
            self.registry.remove_mem_node(&host, port);
        }
    }

    /// Cheap lower-bound estimate of the on-wire byte size of this job's
    /// picked memtables, used to reserve capacity before the real
    /// bincode-encoded images are built in [`FlushJob::prepare_images`].
    fn estimate_picked_bytes(&self) -> Result<u64, RemoteFlushError> {
        let mut total = 0u64;
        for frozen in &self.picked {
            for record in frozen.iter_for_flush()? {
                total += record_byte_len(&record);
            }
        }
        Ok(total)
    }

    /// Claims a free worker from the registry. Fails with
    /// [`RemoteFlushError::NoWorker`] if none is currently idle.
    pub fn match_remote_worker(&mut self) -> Result<(String, u16), RemoteFlushError> {
        if !self.config.remote_enabled {
            return Err(RemoteFlushError::NoWorker);
        }
        match self.registry.claim_worker() {
            Some((host, port)) => {
                self.registry.touch(&host, port);
                self.worker = Some((host.clone(), port));
                self.transition(JobState::WorkerMatched);
                Ok((host, port))
            }
            None => Err(RemoteFlushError::NoWorker),
        }
    }

    /// Releases the memory-node lease: returns the reserved capacity to the
    /// registry and sends `Release` so the memory node frees the held
    /// images. Idempotent.
    pub fn quit_mem_node(&mut self) {
        if let Some((host, port)) = self.mem_node.take() {
            if let Some(bytes) = self.mem_node_reservation.take() {
                self.registry.release_mem_node(&host, port, bytes);
            }
            if let Ok(mut transport) = TcpTransport::connect(&host, port, self.config.per_step_timeout) {
                let _ = transport.send_message(
                    MessageKind::Hello,
                    &HelloMessage {
                        role: PeerRole::Generator,
                        host: String::new(),
                        port: 0,
                    },
                );
                let _ = transport.send_message(
                    MessageKind::Release,
                    &ReleaseMessage {
                        generator_id: 0,
                        job_id: self.job_id,
                    },
                );
            }
        }
    }

    /// Releases the worker lease in the registry, idempotent.
    pub fn quit_remote_worker(&mut self) {
        if let Some((host, port)) = self.worker.take() {
            self.registry.release_worker(&host, port);
        }
    }

    /// Returns picked memtables to the frozen list and releases any leases.
    /// Safe to call in every non-`Committed` state.
    pub fn cancel(&mut self) -> Result<(), RemoteFlushError> {
        if self.state == JobState::Committed {
            return Ok(());
        }
        for frozen in self.picked.drain(..).rev() {
            self.engine.return_frozen(frozen)?;
        }
        self.quit_mem_node();
        self.quit_remote_worker();
        self.transition(JobState::Cancelled);
        self.complete_pending_commit();
        Ok(())
    }

    fn prepare_images(&self) -> Result<Vec<PreparedImage>, RemoteFlushError> {
        let mut images = Vec::with_capacity(self.picked.len());
        for frozen in &self.picked {
            let records: Vec<MemtableRecord> = frozen.iter_for_flush()?.collect();
            let mut record_bytes = Vec::new();
            encode_vec(&records, &mut record_bytes)
                .map_err(|e| RemoteFlushError::ProtocolViolation(format!("encode records: {e}")))?;

            let mut arena = super::arena::SerializableArena::new();
            let chunk_size = record_bytes.len().min(super::arena::DEFAULT_BLOCK_SIZE).max(1);
            for chunk in record_bytes.chunks(chunk_size) {
                arena.write(chunk)?;
            }
            let arena_image = arena.pack()?;

            images.push(PreparedImage {
                column_family_id: self.column_family_id,
                earliest_lsn: records.iter().map(record_lsn).min().unwrap_or(0),
                max_lsn: frozen.max_lsn(),
                size_bytes: record_bytes.len() as u64,
                records: record_bytes,
                arena_image,
            });
        }
        Ok(images)
    }

    /// Runs the flush via a remote worker: offers the picked memtables'
    /// images to the matched memory node, asks the matched worker to build
    /// the output, and publishes the result on success.
    ///
    /// If the worker's connection drops mid-build (`TransportClosed` after
    /// `RunRequest` was accepted but before `RunResult` arrives), the dead
    /// worker is evicted from the registry and a second worker is claimed to
    /// retry with the same already-offered images, up to `max_retries`
    /// times.
    ///
    /// Requires [`FlushJob::match_mem_node`] and
    /// [`FlushJob::match_remote_worker`] to have already succeeded.
    pub fn run_remote(&mut self, output_dir: &str) -> Result<(), RemoteFlushError> {
        if self.is_shutting_down() {
            return Err(RemoteFlushError::ShuttingDown);
        }
        let (mem_host, mem_port) = self
            .mem_node
            .clone()
            .ok_or(RemoteFlushError::NoMemNode)?;
        let (mut worker_host, mut worker_port) = self
            .worker
            .clone()
            .ok_or(RemoteFlushError::NoWorker)?;

        self.transition(JobState::Running);

        let images = self.prepare_images().map_err(|e| self.fail(e))?;
        let total_bytes: u64 = images.iter().map(|i| i.size_bytes).sum();
        let (sstable_id, sstable_path) = self
            .engine
            .reserve_sstable_path()
            .map_err(|e| self.fail(e.into()))?;
        let file_name = sstable_path
            .rsplit('/')
            .next()
            .unwrap_or(&sstable_path)
            .to_string();

        let mut attempt = 0;
        let mut offered = false;
        loop {
            if !offered {
                match self.offer_images(&mem_host, mem_port, &images, total_bytes) {
                    Ok(()) => offered = true,
                    Err(RemoteFlushError::TransportTimeout) if attempt < self.config.max_retries => {
                        attempt += 1;
                        warn!(job_id = self.job_id, attempt, "memory node offer timed out, retrying");
                        thread::sleep(self.config.per_step_timeout / 4);
                        continue;
                    }
                    Err(err) => return Err(self.fail(err)),
                }
            }

            match self.run_on_worker(&worker_host, worker_port, &mem_host, mem_port, output_dir, &file_name) {
                Ok(result) => match result.status {
                    RunStatus::Ok => {
                        if let Some(first) = result.files.into_iter().next() {
                            self.out_files[0] =
                                Some((first.file_name, first.file_size, first.properties));
                        }
                        self.commit(sstable_id, &sstable_path)?;
                        return Ok(());
                    }
                    RunStatus::Failed(reason) => {
                        return Err(self.fail(RemoteFlushError::RemoteFailed(reason)));
                    }
                    RunStatus::Cancelled => {
                        self.transition(JobState::Cancelled);
                        self.complete_pending_commit();
                        return Err(RemoteFlushError::Cancelled);
                    }
                },
                Err(RemoteFlushError::TransportTimeout) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(job_id = self.job_id, attempt, "worker run step timed out, retrying");
                    thread::sleep(self.config.per_step_timeout / 4);
                }
                Err(RemoteFlushError::TransportClosed) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        job_id = self.job_id,
                        attempt,
                        worker_host = %worker_host,
                        worker_port,
                        "worker connection closed mid-run, retrying with a second worker"
                    );
                    self.registry.remove_worker(&worker_host, worker_port);
                    self.worker = None;
                    match self.match_remote_worker() {
                        Ok((host, port)) => {
                            worker_host = host;
                            worker_port = port;
                        }
                        Err(err) => return Err(self.fail(err)),
                    }
                }
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Offers this job's prepared images to a memory node. On success the
    /// memory node holds the images until a `Release`/`Cancel` or its own
    /// capacity timeout; a worker may fetch them any number of times.
    fn offer_images(
        &self,
        mem_host: &str,
        mem_port: u16,
        images: &[PreparedImage],
        total_bytes: u64,
    ) -> Result<(), RemoteFlushError> {
        let mut mem_transport = TcpTransport::connect(mem_host, mem_port, self.config.per_step_timeout)?;
        mem_transport.send_message(
            MessageKind::Hello,
            &HelloMessage {
                role: PeerRole::Generator,
                host: String::new(),
                port: 0,
            },
        )?;
        mem_transport.send_message(
            MessageKind::OfferJob,
            &OfferJobMessage {
                generator_id: 0,
                job_id: self.job_id,
                total_bytes,
                memtable_count: images.len() as u32,
            },
        )?;
        let ack: OfferAckMessage = mem_transport.recv_message(MessageKind::OfferAck)?;
        if !ack.accepted {
            return Err(RemoteFlushError::OutOfCapacity);
        }
        for (idx, image) in images.iter().enumerate() {
            mem_transport.send_message(
                MessageKind::MemtableImage,
                &MemtableImageMessage {
                    memtable_index: idx as u32,
                    column_family_id: image.column_family_id,
                    earliest_lsn: image.earliest_lsn,
                    max_lsn: image.max_lsn,
                    records: image.records.clone(),
                    arena_image: image.arena_image.clone(),
                },
            )?;
        }
        self.registry.touch(mem_host, mem_port);
        Ok(())
    }

    /// Asks `worker_host`/`worker_port` to fetch the already-offered images
    /// from the memory node and build the output file.
    #[allow(clippy::too_many_arguments)]
    fn run_on_worker(
        &self,
        worker_host: &str,
        worker_port: u16,
        mem_host: &str,
        mem_port: u16,
        output_dir: &str,
        file_name: &str,
    ) -> Result<RunResultMessage, RemoteFlushError> {
        let mut worker_transport =
            TcpTransport::connect(worker_host, worker_port, self.config.per_step_timeout)?;
        worker_transport.send_message(
            MessageKind::Hello,
            &HelloMessage {
                role: PeerRole::Generator,
                host: String::new(),
                port: 0,
            },
        )?;
        worker_transport.send_message(
            MessageKind::RunRequest,
            &RunRequestMessage {
                generator_id: 0,
                job_id: self.job_id,
                mem_node_host: mem_host.to_string(),
                mem_node_port: mem_port,
                output_dir: output_dir.to_string(),
                output_file_name: file_name.to_string(),
                sync_output_directory: true,
            },
        )?;
        let result: RunResultMessage = worker_transport.recv_message(MessageKind::RunResult)?;
        self.registry.touch(worker_host, worker_port);
        Ok(result)
    }

    /// Alternative to `run_remote`: builds the output locally via the same
    /// merge-and-write pipeline the engine's own flush path uses, so
    /// `NoMemNode`/`NoWorker`/`OutOfCapacity` can degrade gracefully.
    pub fn run_local(&mut self) -> Result<(), RemoteFlushError> {
        if self.is_shutting_down() {
            self.transition(JobState::Cancelled);
            self.complete_pending_commit();
            return Err(RemoteFlushError::ShuttingDown);
        }
        self.transition(JobState::Running);

        let wal_ids: Vec<u64> = self
            .picked
            .iter()
            .map(|f| f.memtable.wal.wal_seq())
            .collect();

        let mut point_entries = Vec::new();
        let mut range_tombstones = Vec::new();
        {
            let mut sources: Vec<Box<dyn Iterator<Item = Record>>> = Vec::new();
            for frozen in &self.picked {
                let records: Vec<Record> = frozen
                    .iter_for_flush()?
                    .map(memtable_record_to_record)
                    .collect();
                sources.push(Box::new(records.into_iter()));
            }
            for record in MergeIterator::new(sources) {
                match record {
                    Record::Put {
                        key,
                        value,
                        lsn,
                        timestamp,
                    } => point_entries.push(PointEntry {
                        key,
                        value: Some(value),
                        lsn,
                        timestamp,
                    }),
                    Record::Delete { key, lsn, timestamp } => point_entries.push(PointEntry {
                        key,
                        value: None,
                        lsn,
                        timestamp,
                    }),
                    Record::RangeDelete {
                        start,
                        end,
                        lsn,
                        timestamp,
                    } => range_tombstones.push(RangeTombstone {
                        start,
                        end,
                        lsn,
                        timestamp,
                    }),
                }
            }
        }

        if point_entries.is_empty() && range_tombstones.is_empty() {
            self.registry
                .wait_for_commit_turn(self.column_family_id, self.max_memtable_id);
            self.engine
                .release_frozen_wals(&wal_ids)
                .map_err(|e| self.fail(e.into()))?;
            self.transition(JobState::Committed);
            self.complete_pending_commit();
            return Ok(());
        }

        let (sstable_id, sstable_path) = self
            .engine
            .reserve_sstable_path()
            .map_err(|e| self.fail(e.into()))?;
        let point_count = point_entries.len();
        let range_count = range_tombstones.len();
        let num_deletions = point_entries.iter().filter(|e| e.value.is_none()).count() as u64;
        sstable::SstWriter::new(&sstable_path)
            .build(
                point_entries.into_iter(),
                point_count,
                range_tombstones.into_iter(),
                range_count,
            )
            .map_err(|e| self.fail(RemoteFlushError::LocalFailed(e.to_string())))?;

        // Opened once here purely to validate the freshly written file
        // before publishing; `commit` re-opens it via the engine.
        let _ = SSTable::open(&sstable_path)
            .map_err(|e| self.fail(RemoteFlushError::LocalFailed(e.to_string())))?;

        let file_size = std::fs::metadata(&sstable_path)
            .map_err(|e| self.fail(RemoteFlushError::Io(e)))?
            .len();
        let file_name = sstable_path
            .rsplit('/')
            .next()
            .unwrap_or(&sstable_path)
            .to_string();
        self.out_files[0] = Some((
            file_name,
            file_size,
            TableProperties {
                num_entries: point_count as u64,
                num_deletions,
                num_range_deletions: range_count as u64,
                column_family_id: self.column_family_id,
                ..TableProperties::default()
            },
        ));

        self.commit(sstable_id, &sstable_path)?;
        info!(job_id = self.job_id, sstable_id, "local flush committed");
        Ok(())
    }

    /// Publishes the version edit, blocking first until every earlier
    /// `max_memtable_id` on this column family has committed or cancelled —
    /// see the registry's commit-ordering gate.
    fn commit(&mut self, sstable_id: u64, sstable_path: &str) -> Result<(), RemoteFlushError> {
        let wal_ids: Vec<u64> = self
            .picked
            .iter()
            .map(|f| f.memtable.wal.wal_seq())
            .collect();
        self.registry
            .wait_for_commit_turn(self.column_family_id, self.max_memtable_id);
        if let Err(err) = self
            .engine
            .publish_remote_flush_output(sstable_id, sstable_path, &wal_ids)
        {
            self.last_error = Some(err.to_string());
            self.transition(JobState::Failed);
            self.complete_pending_commit();
            return Err(err.into());
        }
        self.quit_mem_node();
        self.quit_remote_worker();
        self.transition(JobState::Committed);
        self.complete_pending_commit();
        Ok(())
    }
}

fn record_lsn(record: &MemtableRecord) -> u64 {
    match record {
        MemtableRecord::Put { lsn, .. } => *lsn,
        MemtableRecord::Delete { lsn, .. } => *lsn,
        MemtableRecord::RangeDelete { lsn, .. } => *lsn,
    }
}

/// Raw key/value byte length of a record, ignoring wire-framing overhead.
/// Used only to estimate capacity needs ahead of the real bincode encoding.
fn record_byte_len(record: &MemtableRecord) -> u64 {
    match record {
        MemtableRecord::Put { key, value, .. } => (key.len() + value.len()) as u64,
        MemtableRecord::Delete { key, .. } => key.len() as u64,
        MemtableRecord::RangeDelete { start, end, .. } => (start.len() + end.len()) as u64,
    }
}

fn memtable_record_to_record(record: MemtableRecord) -> Record {
    match record {
        MemtableRecord::Put {
            key,
            value,
            lsn,
            timestamp,
        } => Record::Put {
            key,
            value,
            lsn,
            timestamp,
        },
        MemtableRecord::Delete { key, lsn, timestamp } => Record::Delete { key, lsn, timestamp },
        MemtableRecord::RangeDelete {
            start,
            end,
            lsn,
            timestamp,
        } => Record::RangeDelete {
            start,
            end,
            lsn,
            timestamp,
        },
    }
}
