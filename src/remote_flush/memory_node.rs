//! Memory-node accept loop: a stateless holding area for in-flight memtable
//! images between a generator's offer and a worker's fetch.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{info, warn};

use super::protocol::{
    FetchRequestMessage, FetchStreamHeader, HelloMessage, MemtableImageMessage, MessageKind,
    OfferAckMessage, OfferJobMessage, PeerRole, ReleaseMessage, TcpTransport, Transport,
};
use super::RemoteFlushError;

type JobKey = (u64, u64);

struct HeldJob {
    images: Vec<MemtableImageMessage>,
    total_bytes: u64,
}

struct MemoryNodeState {
    jobs: HashMap<JobKey, HeldJob>,
    held_bytes: u64,
}

/// Accepts connections from generators (offering images) and workers
/// (fetching them), holding at most `capacity_bytes` of images at once.
pub struct MemoryNodeServer {
    listener: TcpListener,
    capacity_bytes: u64,
    state: Arc<Mutex<MemoryNodeState>>,
}

impl MemoryNodeServer {
    /// Binds a memory node to `addr` with the given total capacity.
    pub fn bind(addr: &str, capacity_bytes: u64) -> Result<Self, RemoteFlushError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            capacity_bytes,
            state: Arc::new(Mutex::new(MemoryNodeState {
                jobs: HashMap::new(),
                held_bytes: 0,
            })),
        })
    }

    /// Local address this server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, RemoteFlushError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop forever, spawning one thread per connection.
    /// Intended to be called from its own dedicated thread.
    pub fn serve(&self) -> Result<(), RemoteFlushError> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            let state = Arc::clone(&self.state);
            let capacity_bytes = self.capacity_bytes;
            thread::spawn(move || {
                if let Err(err) = handle_session(stream, &state, capacity_bytes) {
                    warn!(%peer, %err, "memory node session ended with error");
                }
            });
        }
    }
}

fn handle_session(
    stream: TcpStream,
    state: &Arc<Mutex<MemoryNodeState>>,
    capacity_bytes: u64,
) -> Result<(), RemoteFlushError> {
    let mut transport = TcpTransport::from_stream(stream);
    let hello: HelloMessage = transport.recv_message(MessageKind::Hello)?;

    match hello.role {
        PeerRole::Generator => handle_generator_session(&mut transport, state, capacity_bytes),
        PeerRole::Worker => handle_worker_session(&mut transport, state),
        PeerRole::MemoryNode => Err(RemoteFlushError::ProtocolViolation(
            "memory node does not accept peer-to-peer sessions".to_string(),
        )),
    }
}

fn handle_generator_session(
    transport: &mut TcpTransport,
    state: &Arc<Mutex<MemoryNodeState>>,
    capacity_bytes: u64,
) -> Result<(), RemoteFlushError> {
    let (kind, body) = transport.recv()?;
    match kind {
        MessageKind::OfferJob => {
            let (offer, _) = crate::encoding::decode_from_slice::<OfferJobMessage>(&body)?;
            let key = (offer.generator_id, offer.job_id);

            let accepted = {
                let mut guard = state.lock().unwrap();
                if guard.held_bytes + offer.total_bytes > capacity_bytes {
                    false
                } else {
                    guard.held_bytes += offer.total_bytes;
                    guard.jobs.insert(
                        key,
                        HeldJob {
                            images: Vec::with_capacity(offer.memtable_count as usize),
                            total_bytes: offer.total_bytes,
                        },
                    );
                    true
                }
            };

            transport.send_message(
                MessageKind::OfferAck,
                &OfferAckMessage {
                    accepted,
                    reason: if accepted {
                        String::new()
                    } else {
                        "over capacity".to_string()
                    },
                },
            )?;
            if !accepted {
                return Ok(());
            }

            for _ in 0..offer.memtable_count {
                let image: MemtableImageMessage = transport.recv_message(MessageKind::MemtableImage)?;
                let mut guard = state.lock().unwrap();
                if let Some(held) = guard.jobs.get_mut(&key) {
                    held.images.push(image);
                }
            }
            info!(job_id = offer.job_id, "memory node accepted job images");
            Ok(())
        }
        MessageKind::Release => {
            let (release, _) = crate::encoding::decode_from_slice::<ReleaseMessage>(&body)?;
            release_job(state, (release.generator_id, release.job_id));
            Ok(())
        }
        MessageKind::Cancel => {
            let (cancel, _) = crate::encoding::decode_from_slice::<super::protocol::CancelMessage>(&body)?;
            release_job(state, (cancel.generator_id, cancel.job_id));
            Ok(())
        }
        other => Err(RemoteFlushError::ProtocolViolation(format!(
            "unexpected message {other:?} from generator"
        ))),
    }
}

fn release_job(state: &Arc<Mutex<MemoryNodeState>>, key: JobKey) {
    let mut guard = state.lock().unwrap();
    if let Some(held) = guard.jobs.remove(&key) {
        guard.held_bytes = guard.held_bytes.saturating_sub(held.total_bytes);
    }
}

fn handle_worker_session(
    transport: &mut TcpTransport,
    state: &Arc<Mutex<MemoryNodeState>>,
) -> Result<(), RemoteFlushError> {
    let request: FetchRequestMessage = transport.recv_message(MessageKind::FetchRequest)?;
    let key = (request.generator_id, request.job_id);

    let held = {
        let guard = state.lock().unwrap();
        guard.jobs.get(&key).map(|h| (h.images.clone(), h.total_bytes))
    };

    let Some((images, total_bytes)) = held else {
        return Err(RemoteFlushError::ProtocolViolation(format!(
            "no held images for job {:?}",
            key
        )));
    };

    transport.send_message(
        MessageKind::FetchStream,
        &FetchStreamHeader {
            memtable_count: images.len() as u32,
            total_bytes,
        },
    )?;
    for image in images {
        transport.send_message(MessageKind::FetchStream, &image)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rejects_offer_over_capacity() {
        let server = MemoryNodeServer::bind("127.0.0.1:0", 100).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let _ = server.serve();
        });

        let mut transport = TcpTransport::connect("127.0.0.1", addr.port(), Duration::from_secs(2)).unwrap();
        transport
            .send_message(
                MessageKind::Hello,
                &HelloMessage {
                    role: PeerRole::Generator,
                    host: String::new(),
                    port: 0,
                },
            )
            .unwrap();
        transport
            .send_message(
                MessageKind::OfferJob,
                &OfferJobMessage {
                    generator_id: 1,
                    job_id: 1,
                    total_bytes: 1_000,
                    memtable_count: 1,
                },
            )
            .unwrap();
        let ack: OfferAckMessage = transport.recv_message(MessageKind::OfferAck).unwrap();
        assert!(!ack.accepted);

        drop(handle);
    }
}
