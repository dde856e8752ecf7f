//! Wire protocol between generator, memory node, and worker.
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! [kind: u32 LE][body_len: u32 LE][body: body_len bytes]
//! ```
//!
//! `kind` identifies which [`MessageKind`] the body decodes as; `body` is
//! encoded with the crate's [`crate::encoding`] traits, same as every other
//! on-disk structure. [`Transport`] is the seam a non-TCP carrier (RDMA,
//! an in-process channel for tests) plugs into.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::remote_flush::table_properties::TableProperties;
use crate::remote_flush::RemoteFlushError;

/// Maximum body size accepted for a single frame (256 MiB), guarding
/// against a corrupt or hostile length prefix triggering a huge allocation.
pub const MAX_FRAME_BODY: u32 = 256 * 1024 * 1024;

/// Identifies which message type a frame's body decodes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// Initial handshake identifying the sender's role and endpoint.
    Hello = 0,
    /// Generator offers a flush job to a memory node.
    OfferJob = 1,
    /// Memory node's accept/reject response to `OfferJob`.
    OfferAck = 2,
    /// One memtable's packed arena image plus metadata.
    MemtableImage = 3,
    /// Worker asks a memory node for a job's held images.
    FetchRequest = 4,
    /// Memory node streams a held image back to a worker.
    FetchStream = 5,
    /// Generator tells a memory node it may drop a job's images.
    Release = 6,
    /// Generator asks a worker to run a flush job.
    RunRequest = 7,
    /// Worker reports incremental progress on a running job.
    RunProgress = 8,
    /// Worker reports the final outcome of a run.
    RunResult = 9,
    /// Generator (or a peer) aborts an in-flight job.
    Cancel = 10,
    /// Liveness probe with no payload.
    Heartbeat = 11,
    /// Generic error reply when a request cannot be serviced.
    Error = 12,
}

impl MessageKind {
    fn from_u32(v: u32) -> Result<Self, RemoteFlushError> {
        Ok(match v {
            0 => Self::Hello,
            1 => Self::OfferJob,
            2 => Self::OfferAck,
            3 => Self::MemtableImage,
            4 => Self::FetchRequest,
            5 => Self::FetchStream,
            6 => Self::Release,
            7 => Self::RunRequest,
            8 => Self::RunProgress,
            9 => Self::RunResult,
            10 => Self::Cancel,
            11 => Self::Heartbeat,
            12 => Self::Error,
            other => {
                return Err(RemoteFlushError::ProtocolViolation(format!(
                    "unknown message kind tag {other}"
                )));
            }
        })
    }
}

/// A carrier over which framed messages can be sent and received.
///
/// Implemented for [`TcpStream`] via [`TcpTransport`]. An RDMA-backed
/// implementation would plug in here without the rest of the protocol
/// needing to change.
pub trait Transport {
    /// Sends one frame: `kind` followed by `body`.
    fn send(&mut self, kind: MessageKind, body: &[u8]) -> Result<(), RemoteFlushError>;

    /// Blocks for the next frame and returns its kind and body.
    fn recv(&mut self) -> Result<(MessageKind, Vec<u8>), RemoteFlushError>;

    /// Serializes and sends `msg` tagged as `kind`.
    fn send_message<T: Encode>(&mut self, kind: MessageKind, msg: &T) -> Result<(), RemoteFlushError> {
        let body = encoding::encode_to_vec(msg)?;
        self.send(kind, &body)
    }

    /// Receives one frame and decodes its body as `T`, verifying the kind
    /// matches `expected`.
    fn recv_message<T: Decode>(&mut self, expected: MessageKind) -> Result<T, RemoteFlushError> {
        let (kind, body) = self.recv()?;
        if kind != expected {
            return Err(RemoteFlushError::ProtocolViolation(format!(
                "expected {expected:?}, got {kind:?}"
            )));
        }
        let (msg, _) = encoding::decode_from_slice(&body)?;
        Ok(msg)
    }
}

/// A [`Transport`] backed by a plain TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Connects to `addr`, bounding both the connect and subsequent
    /// read/write operations by `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, RemoteFlushError> {
        use std::net::ToSocketAddrs;

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RemoteFlushError::Io(io::Error::other("unresolvable address")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Applies a fresh read/write timeout to the underlying socket, used to
    /// give long-running steps (e.g. streaming an image) more budget than a
    /// handshake.
    pub fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))
    }

    /// Shuts down both halves of the connection.
    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}

fn map_io_err(e: io::Error) -> RemoteFlushError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => RemoteFlushError::TransportTimeout,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
            RemoteFlushError::TransportClosed
        }
        _ => RemoteFlushError::Io(e),
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, kind: MessageKind, body: &[u8]) -> Result<(), RemoteFlushError> {
        if body.len() as u64 > MAX_FRAME_BODY as u64 {
            return Err(RemoteFlushError::ProtocolViolation(format!(
                "frame body of {} bytes exceeds {MAX_FRAME_BODY}",
                body.len()
            )));
        }
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&(kind as u32).to_le_bytes());
        header[4..8].copy_from_slice(&(body.len() as u32).to_le_bytes());
        self.stream.write_all(&header).map_err(map_io_err)?;
        self.stream.write_all(body).map_err(map_io_err)?;
        self.stream.flush().map_err(map_io_err)
    }

    fn recv(&mut self) -> Result<(MessageKind, Vec<u8>), RemoteFlushError> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).map_err(map_io_err)?;
        let kind = MessageKind::from_u32(u32::from_le_bytes(header[0..4].try_into().unwrap()))?;
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if len > MAX_FRAME_BODY {
            return Err(RemoteFlushError::ProtocolViolation(format!(
                "declared frame body of {len} bytes exceeds {MAX_FRAME_BODY}"
            )));
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body).map_err(map_io_err)?;
        Ok((kind, body))
    }
}

// ------------------------------------------------------------------------------------------------
// Message payloads
// ------------------------------------------------------------------------------------------------

/// Role a [`Hello`](MessageKind::Hello) sender identifies as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The local database driving a flush job.
    Generator,
    /// A stateless RAM buffer for in-flight memtable images.
    MemoryNode,
    /// The process that executes a flush on behalf of a generator.
    Worker,
}

impl Encode for PeerRole {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u32 = match self {
            Self::Generator => 0,
            Self::MemoryNode => 1,
            Self::Worker => 2,
        };
        tag.encode_to(buf)
    }
}

impl Decode for PeerRole {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u32::decode_from(buf)?;
        let role = match tag {
            0 => Self::Generator,
            1 => Self::MemoryNode,
            2 => Self::Worker,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "PeerRole",
                });
            }
        };
        Ok((role, n))
    }
}

/// Handshake payload: identifies the sender.
#[derive(Debug, Clone)]
pub struct HelloMessage {
    /// The role the sender is acting as.
    pub role: PeerRole,
    /// Host the sender can be reached back on.
    pub host: String,
    /// Port the sender can be reached back on.
    pub port: u16,
}

impl Encode for HelloMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.role.encode_to(buf)?;
        self.host.encode_to(buf)?;
        (self.port as u32).encode_to(buf)
    }
}

impl Decode for HelloMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (role, n) = PeerRole::decode_from(&buf[off..])?;
        off += n;
        let (host, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (port, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                role,
                host,
                port: port as u16,
            },
            off,
        ))
    }
}

/// Offer header a generator sends a memory node before streaming images.
#[derive(Debug, Clone)]
pub struct OfferJobMessage {
    /// Identifier of the offering generator.
    pub generator_id: u64,
    /// Identifier of the flush job.
    pub job_id: u64,
    /// Total bytes across all memtable images about to be sent.
    pub total_bytes: u64,
    /// Number of memtable images about to be sent.
    pub memtable_count: u32,
}

impl Encode for OfferJobMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.generator_id.encode_to(buf)?;
        self.job_id.encode_to(buf)?;
        self.total_bytes.encode_to(buf)?;
        self.memtable_count.encode_to(buf)
    }
}

impl Decode for OfferJobMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (generator_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (job_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (total_bytes, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (memtable_count, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                generator_id,
                job_id,
                total_bytes,
                memtable_count,
            },
            off,
        ))
    }
}

/// A memory node's response to [`OfferJobMessage`].
#[derive(Debug, Clone)]
pub struct OfferAckMessage {
    /// Whether the memory node has room for the offered bytes.
    pub accepted: bool,
    /// Human-readable rejection reason; empty when `accepted` is true.
    pub reason: String,
}

impl Encode for OfferAckMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.accepted.encode_to(buf)?;
        self.reason.encode_to(buf)
    }
}

impl Decode for OfferAckMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (accepted, n) = bool::decode_from(&buf[off..])?;
        off += n;
        let (reason, n) = String::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { accepted, reason }, off))
    }
}

/// One memtable's image: metadata followed by its packed arena bytes and
/// record list, ready for a worker to reconstruct.
#[derive(Debug, Clone)]
pub struct MemtableImageMessage {
    /// Position of this memtable within the job's picked list.
    pub memtable_index: u32,
    /// Column family this memtable belongs to.
    pub column_family_id: u64,
    /// Lowest LSN present in the memtable.
    pub earliest_lsn: u64,
    /// Highest LSN present in the memtable.
    pub max_lsn: u64,
    /// bincode-encoded `Vec<MemtableRecord>`, the memtable's logical content.
    pub records: Vec<u8>,
    /// Packed [`crate::remote_flush::arena::SerializableArena`] backing the
    /// records, carried for parity with the spec's arena-transport design
    /// even though this engine's memtable does not itself allocate from an
    /// arena; a worker may ignore it and rebuild directly from `records`.
    pub arena_image: Vec<u8>,
}

impl Encode for MemtableImageMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.memtable_index.encode_to(buf)?;
        self.column_family_id.encode_to(buf)?;
        self.earliest_lsn.encode_to(buf)?;
        self.max_lsn.encode_to(buf)?;
        self.records.encode_to(buf)?;
        self.arena_image.encode_to(buf)
    }
}

impl Decode for MemtableImageMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (memtable_index, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (column_family_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (earliest_lsn, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (max_lsn, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (records, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (arena_image, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                memtable_index,
                column_family_id,
                earliest_lsn,
                max_lsn,
                records,
                arena_image,
            },
            off,
        ))
    }
}

/// A worker's request to pull a job's held images from a memory node.
#[derive(Debug, Clone)]
pub struct FetchRequestMessage {
    /// Generator that owns the job.
    pub generator_id: u64,
    /// Job whose images should be streamed.
    pub job_id: u64,
}

impl Encode for FetchRequestMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.generator_id.encode_to(buf)?;
        self.job_id.encode_to(buf)
    }
}

impl Decode for FetchRequestMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (generator_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (job_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                generator_id,
                job_id,
            },
            off,
        ))
    }
}

/// Tells a memory node it may drop a job's images (after commit or cancel).
pub type ReleaseMessage = FetchRequestMessage;

/// First [`MessageKind::FetchStream`] frame a memory node sends a worker,
/// announcing how many [`MemtableImageMessage`] frames follow.
#[derive(Debug, Clone)]
pub struct FetchStreamHeader {
    /// Number of memtable images that will follow as separate `FetchStream` frames.
    pub memtable_count: u32,
    /// Sum of the sizes of the images that will follow.
    pub total_bytes: u64,
}

impl Encode for FetchStreamHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.memtable_count.encode_to(buf)?;
        self.total_bytes.encode_to(buf)
    }
}

impl Decode for FetchStreamHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (memtable_count, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (total_bytes, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                memtable_count,
                total_bytes,
            },
            off,
        ))
    }
}

/// Request a generator sends a worker to execute a flush.
#[derive(Debug, Clone)]
pub struct RunRequestMessage {
    /// Identifier of the requesting generator.
    pub generator_id: u64,
    /// Identifier of the flush job.
    pub job_id: u64,
    /// Host of the memory node holding this job's images.
    pub mem_node_host: String,
    /// Port of the memory node holding this job's images.
    pub mem_node_port: u16,
    /// Directory the worker should write the output file(s) into.
    pub output_dir: String,
    /// Exact file name the worker must use for its (sole, slot-zero) output
    /// file, pre-reserved by the generator against its manifest.
    pub output_file_name: String,
    /// Whether the worker should fsync the output directory after writing.
    pub sync_output_directory: bool,
}

impl Encode for RunRequestMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.generator_id.encode_to(buf)?;
        self.job_id.encode_to(buf)?;
        self.mem_node_host.encode_to(buf)?;
        (self.mem_node_port as u32).encode_to(buf)?;
        self.output_dir.encode_to(buf)?;
        self.output_file_name.encode_to(buf)?;
        self.sync_output_directory.encode_to(buf)
    }
}

impl Decode for RunRequestMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (generator_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (job_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (mem_node_host, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (mem_node_port, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (output_dir, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (output_file_name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (sync_output_directory, n) = bool::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                generator_id,
                job_id,
                mem_node_host,
                mem_node_port: mem_node_port as u16,
                output_dir,
                output_file_name,
                sync_output_directory,
            },
            off,
        ))
    }
}

/// One output file reported in a [`RunResultMessage`].
#[derive(Debug, Clone)]
pub struct OutputFileMessage {
    /// Filename (not full path) of the produced sorted table.
    pub file_name: String,
    /// Size of the produced file in bytes.
    pub file_size: u64,
    /// Metadata describing the file's contents.
    pub properties: TableProperties,
}

impl Encode for OutputFileMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_name.encode_to(buf)?;
        self.file_size.encode_to(buf)?;
        self.properties.encode_to(buf)
    }
}

impl Decode for OutputFileMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (file_name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (file_size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (properties, n) = TableProperties::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                file_name,
                file_size,
                properties,
            },
            off,
        ))
    }
}

/// Outcome reported by a worker after attempting a run.
#[derive(Debug, Clone)]
pub enum RunStatus {
    /// The flush succeeded; `files` lists every output produced (at most
    /// four, per the job's output-slot limit).
    Ok,
    /// The flush failed for the given reason; no files were left behind.
    Failed(String),
    /// The flush was aborted by a [`MessageKind::Cancel`] before completion.
    Cancelled,
}

impl Encode for RunStatus {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Self::Ok => 0u32.encode_to(buf),
            Self::Failed(reason) => {
                1u32.encode_to(buf)?;
                reason.encode_to(buf)
            }
            Self::Cancelled => 2u32.encode_to(buf),
        }
    }
}

impl Decode for RunStatus {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut off) = u32::decode_from(buf)?;
        let status = match tag {
            0 => Self::Ok,
            1 => {
                let (reason, n) = String::decode_from(&buf[off..])?;
                off += n;
                Self::Failed(reason)
            }
            2 => Self::Cancelled,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "RunStatus",
                });
            }
        };
        Ok((status, off))
    }
}

/// Final report a worker sends a generator for a run.
#[derive(Debug, Clone)]
pub struct RunResultMessage {
    /// Job this result pertains to.
    pub job_id: u64,
    /// Outcome of the run.
    pub status: RunStatus,
    /// Output files produced, empty unless `status` is [`RunStatus::Ok`].
    pub files: Vec<OutputFileMessage>,
}

impl Encode for RunResultMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.job_id.encode_to(buf)?;
        self.status.encode_to(buf)?;
        encoding::encode_vec(&self.files, buf)
    }
}

impl Decode for RunResultMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (job_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (status, n) = RunStatus::decode_from(&buf[off..])?;
        off += n;
        let (files, n) = encoding::decode_vec::<OutputFileMessage>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                job_id,
                status,
                files,
            },
            off,
        ))
    }
}

/// Aborts an in-flight job, sent by a generator to a worker or memory node.
#[derive(Debug, Clone)]
pub struct CancelMessage {
    /// Generator that owns the job.
    pub generator_id: u64,
    /// Job being aborted.
    pub job_id: u64,
}

impl Encode for CancelMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.generator_id.encode_to(buf)?;
        self.job_id.encode_to(buf)
    }
}

impl Decode for CancelMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (generator_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (job_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                generator_id,
                job_id,
            },
            off,
        ))
    }
}

/// A generic error reply.
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    /// Human-readable description of what went wrong.
    pub reason: String,
}

impl Encode for ErrorMessage {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.reason.encode_to(buf)
    }
}

impl Decode for ErrorMessage {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (reason, n) = String::decode_from(buf)?;
        Ok((Self { reason }, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn hello_round_trips_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = TcpTransport::from_stream(stream);
            let msg: HelloMessage = transport.recv_message(MessageKind::Hello).unwrap();
            assert_eq!(msg.host, "worker-1");
            assert_eq!(msg.port, 4242);
            assert_eq!(msg.role, PeerRole::Worker);
        });

        let mut client =
            TcpTransport::connect("127.0.0.1", addr.port(), Duration::from_secs(2)).unwrap();
        client
            .send_message(
                MessageKind::Hello,
                &HelloMessage {
                    role: PeerRole::Worker,
                    host: "worker-1".to_string(),
                    port: 4242,
                },
            )
            .unwrap();

        handle.join().unwrap();
    }

    #[test]
    fn unknown_message_kind_is_protocol_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = TcpTransport::from_stream(stream);
            let err = transport.recv().unwrap_err();
            assert!(matches!(err, RemoteFlushError::ProtocolViolation(_)));
        });

        let mut raw = TcpStream::connect(addr).unwrap();
        raw.write_all(&99u32.to_le_bytes()).unwrap();
        raw.write_all(&1u32.to_le_bytes()).unwrap();
        raw.write_all(b"x").unwrap();

        handle.join().unwrap();
    }
}
