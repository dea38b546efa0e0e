//! Master/replica streaming
//!
//! The master publishes every accepted write as a newline-delimited JSON
//! [`WriteEvent`] frame to each connected replica. A replica connects to the
//! master, reads frames and applies them to its local storage.
//!
//! [`WriteEvent`]: crate::schema::WriteEvent

mod receiver;
mod sender;
mod service;

pub use receiver::ReplicationReceiver;
pub use sender::ReplicationSender;
pub use service::ReplicationService;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use store_common::error::{ErrorCategory, ErrorClassification};
use thiserror::Error;

use crate::config::ReplicationSettings;
use crate::frontend::{RpcService, ServiceError};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReplicationError {
    #[error("Failed to connect to master {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Replication service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Replication stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ErrorClassification for ReplicationError {
    fn category(&self) -> ErrorCategory {
        match self {
            ReplicationError::Connect { .. } => ErrorCategory::Transient,
            ReplicationError::Service(_) => ErrorCategory::Configuration,
            ReplicationError::Stream(_) => ErrorCategory::Transient,
            ReplicationError::FrameTooLarge { .. } => ErrorCategory::Permanent,
            ReplicationError::Decode(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            ReplicationError::Connect { .. } | ReplicationError::Stream(_) => {
                Some(Duration::from_secs(1))
            }
            _ => None,
        }
    }
}

pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Replication role, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRole {
    None,
    Master,
    Client { master_host: String },
}

impl ReplicationRole {
    /// `enabled` wins over a configured master host
    pub fn from_settings(settings: &ReplicationSettings) -> Self {
        let host = settings.master_host.trim();
        if settings.enabled {
            ReplicationRole::Master
        } else if !host.is_empty() {
            ReplicationRole::Client {
                master_host: host.to_string(),
            }
        } else {
            ReplicationRole::None
        }
    }
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationRole::None => f.write_str("none"),
            ReplicationRole::Master => f.write_str("master"),
            ReplicationRole::Client { master_host } => write!(f, "client of {}", master_host),
        }
    }
}

/// Builds the replication endpoints for the negotiated role
#[async_trait]
pub trait ReplicationFactory: Send + Sync {
    /// Start serving the replication service and return the sender that
    /// feeds it
    async fn master(
        &self,
        service: Arc<ReplicationService>,
        settings: &ReplicationSettings,
    ) -> ReplicationResult<Arc<ReplicationSender>>;

    /// Connect to the master
    async fn client(
        &self,
        master_host: &str,
        settings: &ReplicationSettings,
    ) -> ReplicationResult<Arc<ReplicationReceiver>>;
}

/// TCP implementation of [`ReplicationFactory`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpReplicationFactory;

#[async_trait]
impl ReplicationFactory for TcpReplicationFactory {
    async fn master(
        &self,
        service: Arc<ReplicationService>,
        settings: &ReplicationSettings,
    ) -> ReplicationResult<Arc<ReplicationSender>> {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.listen_port));
        service.serve(addr).await?;
        Ok(Arc::new(ReplicationSender::new(service)))
    }

    async fn client(
        &self,
        master_host: &str,
        settings: &ReplicationSettings,
    ) -> ReplicationResult<Arc<ReplicationReceiver>> {
        let receiver = ReplicationReceiver::connect(
            master_host,
            settings.retry_interval,
            settings.max_recv_msg_size,
        )
        .await?;
        Ok(Arc::new(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_settings() {
        let mut settings = ReplicationSettings::default();
        assert_eq!(ReplicationRole::from_settings(&settings), ReplicationRole::None);

        settings.master_host = "10.0.0.1:5996".into();
        assert_eq!(
            ReplicationRole::from_settings(&settings),
            ReplicationRole::Client {
                master_host: "10.0.0.1:5996".into()
            }
        );

        settings.enabled = true;
        assert_eq!(ReplicationRole::from_settings(&settings), ReplicationRole::Master);

        settings.master_host.clear();
        assert_eq!(ReplicationRole::from_settings(&settings), ReplicationRole::Master);
    }
}
