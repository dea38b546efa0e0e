use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frontend::{RpcService, ServiceError, ServiceResult};
use crate::metrics::REPLICATION_PEERS;

const FRAME_BACKLOG: usize = 4_096;

/// Streams encoded write frames to every connected replica.
///
/// Streams never finish on their own, so a graceful stop is the same as a
/// hard stop.
pub struct ReplicationService {
    max_send_msg_size: usize,
    frames: broadcast::Sender<Arc<str>>,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    peers: Arc<AtomicUsize>,
}

impl ReplicationService {
    pub fn new(max_send_msg_size: usize) -> Self {
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        Self {
            max_send_msg_size,
            frames,
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
            peers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_send_msg_size(&self) -> usize {
        self.max_send_msg_size
    }

    /// Queue a frame for all replicas; returns how many will receive it
    pub fn broadcast(&self, frame: Arc<str>) -> usize {
        self.frames.send(frame).unwrap_or(0)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RpcService for ReplicationService {
    fn name(&self) -> &'static str {
        "replication"
    }

    async fn serve(&self, addr: SocketAddr) -> ServiceResult<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::bind(addr, e))?;
        let bound = listener.local_addr().map_err(|e| ServiceError::bind(addr, e))?;
        *self.local_addr.lock() = Some(bound);
        info!(addr = %bound, "Replication service listening");

        let frames = self.frames.clone();
        let shutdown = self.shutdown.clone();
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            info!(%peer, "Replica connected");
                            tokio::spawn(stream_to_replica(
                                stream,
                                peer,
                                frames.subscribe(),
                                shutdown.clone(),
                                Arc::clone(&peers),
                            ));
                        }
                        Err(e) => warn!(error = %e, "Failed to accept replica"),
                    },
                }
            }
            debug!("Replication accept loop stopped");
        });
        Ok(bound)
    }

    async fn graceful_stop(&self) {
        self.stop();
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn stream_to_replica(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut frames: broadcast::Receiver<Arc<str>>,
    shutdown: CancellationToken,
    peers: Arc<AtomicUsize>,
) {
    REPLICATION_PEERS.set(peers.fetch_add(1, Ordering::AcqRel) as i64 + 1);
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(frame) => {
                let sent = async {
                    stream.write_all(frame.as_bytes()).await?;
                    stream.write_all(b"\n").await
                }
                .await;
                if let Err(e) = sent {
                    warn!(%peer, error = %e, "Replica stream failed");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // The replica can no longer be consistent; make it reconnect
                warn!(%peer, missed, "Replica fell behind, closing stream");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    REPLICATION_PEERS.set(peers.fetch_sub(1, Ordering::AcqRel) as i64 - 1);
    info!(%peer, "Replica disconnected");
}
