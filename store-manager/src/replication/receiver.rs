use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ReplicationError, ReplicationResult};
use crate::metrics::REPLICATION_PEERS;
use crate::schema::WriteEvent;
use crate::storage::StorageEngine;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Replica side: reads frames from the master and applies them locally.
///
/// The connection is made during role negotiation, before storage exists;
/// frames are only read once [`attach`](Self::attach) has supplied storage.
pub struct ReplicationReceiver {
    master_host: String,
    retry_interval: Duration,
    max_recv_msg_size: usize,
    initial: Mutex<Option<TcpStream>>,
    storage: watch::Sender<Option<Arc<dyn StorageEngine>>>,
}

impl ReplicationReceiver {
    /// Connect to the master once; failure here is fatal to startup
    pub async fn connect(
        master_host: &str,
        retry_interval: Duration,
        max_recv_msg_size: usize,
    ) -> ReplicationResult<Self> {
        let stream = dial(master_host).await?;
        info!(master = master_host, "Connected to replication master");
        let (storage, _) = watch::channel(None);
        Ok(Self {
            master_host: master_host.to_string(),
            retry_interval,
            max_recv_msg_size,
            initial: Mutex::new(Some(stream)),
            storage,
        })
    }

    pub fn master_host(&self) -> &str {
        &self.master_host
    }

    /// Hand over the storage replicated writes are applied to
    pub fn attach(&self, storage: Arc<dyn StorageEngine>) {
        self.storage.send_replace(Some(storage));
    }

    /// Receive loop; reconnects after stream errors until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut attached = self.storage.subscribe();
        let storage = tokio::select! {
            _ = cancel.cancelled() => return,
            ready = attached.wait_for(Option::is_some) => ready.ok().and_then(|s| s.clone()),
        };
        let Some(storage) = storage else {
            return;
        };

        loop {
            let initial = self.initial.lock().take();
            let stream = match initial {
                Some(stream) => Ok(stream),
                None => dial(&self.master_host).await,
            };

            let outcome = match stream {
                Ok(stream) => {
                    REPLICATION_PEERS.set(1);
                    let outcome = self.apply_frames(stream, &*storage, &cancel).await;
                    REPLICATION_PEERS.set(0);
                    outcome
                }
                Err(e) => Err(e),
            };

            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = outcome {
                warn!(master = %self.master_host, error = %e, "Replication stream lost");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        info!("Replication receiver stopped");
    }

    async fn apply_frames(
        &self,
        stream: TcpStream,
        storage: &dyn StorageEngine,
        cancel: &CancellationToken,
    ) -> ReplicationResult<()> {
        let mut reader = BufReader::new(stream);
        let mut frame = Vec::new();
        loop {
            let complete = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = read_frame(&mut reader, &mut frame, self.max_recv_msg_size) => read?,
            };
            if !complete {
                return Err(ReplicationError::Stream(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "master closed the stream",
                )));
            }
            let event: WriteEvent = serde_json::from_slice(&frame)?;
            if let Err(e) = storage.apply_replicated(event).await {
                warn!(error = %e, "Failed to apply replicated write");
            }
        }
    }
}

/// Read one newline-terminated frame into `frame`, without the newline.
///
/// Never buffers more than `limit + 1` bytes. Returns `false` when the
/// stream ends before a full frame.
async fn read_frame<R>(reader: &mut R, frame: &mut Vec<u8>, limit: usize) -> ReplicationResult<bool>
where
    R: AsyncBufRead + Unpin,
{
    frame.clear();
    let bound = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    (&mut *reader).take(bound).read_until(b'\n', frame).await?;
    if frame.last() == Some(&b'\n') {
        frame.pop();
        return Ok(true);
    }
    if frame.len() > limit {
        return Err(ReplicationError::FrameTooLarge {
            size: frame.len(),
            limit,
        });
    }
    Ok(false)
}

async fn dial(master_host: &str) -> ReplicationResult<TcpStream> {
    let connect_error = |reason: String| ReplicationError::Connect {
        host: master_host.to_string(),
        reason,
    };
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(master_host)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(connect_error(e.to_string())),
        Err(_) => Err(connect_error(format!("timed out after {:?}", CONNECT_TIMEOUT))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::RpcService;
    use crate::replication::{ReplicationSender, ReplicationService};
    use crate::schema::{Bar, Row, TimeBucketKey};
    use crate::storage::{ChangeSink, InstanceSetup, LocalStore};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn event() -> WriteEvent {
        WriteEvent::new(
            TimeBucketKey::bars("AAPL", "1Min"),
            vec![Row::Bar(Bar {
                epoch: 60,
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: dec!(1),
                volume: dec!(1),
            })],
        )
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Port 1 on localhost is not listening in test environments
        let err = ReplicationReceiver::connect("127.0.0.1:1", Duration::from_secs(1), 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplicationError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_stops_at_limit() {
        let mut reader: &[u8] = b"{\"a\":1}\nshort\n";
        let mut frame = Vec::new();
        assert!(read_frame(&mut reader, &mut frame, 8).await.unwrap());
        assert_eq!(frame, b"{\"a\":1}");
        assert!(read_frame(&mut reader, &mut frame, 8).await.unwrap());
        assert_eq!(frame, b"short");
        assert!(!read_frame(&mut reader, &mut frame, 8).await.unwrap());

        let endless = vec![b'x'; 64 * 1024];
        let mut reader: &[u8] = &endless;
        let err = read_frame(&mut reader, &mut frame, 1024).await.unwrap_err();
        assert!(matches!(err, ReplicationError::FrameTooLarge { limit: 1024, .. }));
        assert_eq!(frame.len(), 1025);
    }

    #[tokio::test]
    async fn test_oversized_frame_without_newline_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let master = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            // Keep writing with no newline until the replica hangs up
            let chunk = vec![b'x'; 4096];
            while socket.write_all(&chunk).await.is_ok() {}
        });

        let receiver = ReplicationReceiver::connect(&addr.to_string(), Duration::from_secs(1), 1024)
            .await
            .unwrap();
        let stream = receiver.initial.lock().take().unwrap();
        let dir = TempDir::new().unwrap();
        let replica = LocalStore::initialize(InstanceSetup {
            wal_bypass: true,
            ..InstanceSetup::new(dir.path())
        })
        .await
        .unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            receiver.apply_frames(stream, &replica, &CancellationToken::new()),
        )
        .await
        .expect("oversized frame was never rejected");
        assert!(matches!(
            outcome,
            Err(ReplicationError::FrameTooLarge { limit: 1024, .. })
        ));
        master.abort();
    }

    #[tokio::test]
    async fn test_master_to_replica_round_trip() {
        let service = Arc::new(ReplicationService::new(1024 * 1024));
        let addr = service.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sender = Arc::new(ReplicationSender::new(Arc::clone(&service)));
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&sender).run(cancel.clone()));

        let receiver = Arc::new(
            ReplicationReceiver::connect(&addr.to_string(), Duration::from_millis(50), 1024 * 1024)
                .await
                .unwrap(),
        );
        let dir = TempDir::new().unwrap();
        let replica = Arc::new(
            LocalStore::initialize(InstanceSetup {
                wal_bypass: true,
                ..InstanceSetup::new(dir.path())
            })
            .await
            .unwrap(),
        );
        let mut applied = replica.subscribe();
        receiver.attach(replica.clone());
        tokio::spawn(Arc::clone(&receiver).run(cancel.clone()));

        // Wait for the service to register the replica before publishing
        tokio::time::timeout(Duration::from_secs(5), async {
            while service.peer_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("replica never connected");

        sender.publish(&event());
        let got = tokio::time::timeout(Duration::from_secs(5), applied.recv())
            .await
            .expect("replicated write never applied")
            .unwrap();
        assert_eq!(got.key.as_str(), "AAPL/1Min/OHLCV");

        cancel.cancel();
        service.stop();
    }
}
