use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ReplicationService;
use crate::schema::WriteEvent;
use crate::storage::ChangeSink;

const EVENT_BACKLOG: usize = 4_096;

/// Master side: takes accepted writes from storage and frames them for the
/// replication service
pub struct ReplicationSender {
    service: Arc<ReplicationService>,
    events: broadcast::Sender<WriteEvent>,
    pending: Mutex<Option<broadcast::Receiver<WriteEvent>>>,
}

impl ReplicationSender {
    pub fn new(service: Arc<ReplicationService>) -> Self {
        let (events, pending) = broadcast::channel(EVENT_BACKLOG);
        Self {
            service,
            events,
            pending: Mutex::new(Some(pending)),
        }
    }

    /// Forward events until `cancel` fires. Only the first call does work.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut events) = self.pending.lock().take() else {
            warn!("Replication sender already running");
            return;
        };
        info!("Replication sender started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.forward(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Replication sender lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Replication sender stopped");
    }

    fn forward(&self, event: &WriteEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(key = %event.key, error = %e, "Failed to encode replication frame");
                return;
            }
        };
        let limit = self.service.max_send_msg_size();
        if frame.len() > limit {
            warn!(key = %event.key, size = frame.len(), limit, "Replication frame too large, dropped");
            return;
        }
        self.service.broadcast(Arc::from(frame));
    }
}

impl ChangeSink for ReplicationSender {
    fn publish(&self, event: &WriteEvent) {
        // No running sender means no replicas to feed yet
        let _ = self.events.send(event.clone());
    }
}
