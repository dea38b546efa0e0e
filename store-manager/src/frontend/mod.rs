//! Network surfaces of the server
//!
//! * [`ApiService`]: query/write RPC listener with message size limits
//! * [`HttpMux`]: primary HTTP listener routing `/rpc`, `/ws`, `/metrics`
//! * [`UtilitiesServer`]: optional `/heartbeat` endpoint
//!
//! Services are constructed early and bound late, so [`RpcService`] splits
//! construction from [`RpcService::serve`].

mod api;
mod http;
mod stream;
mod utilities;
mod workers;

pub use api::{ApiHandler, ApiRequest, ApiResponse, ApiService, MessageLimits, RpcEndpoint, StoreApi};
pub use http::{serve_http, HttpMux, RouteHandler};
pub use stream::stream_route;
pub use utilities::UtilitiesServer;
pub use workers::spawn_uptime_monitor;

use std::fmt::Display;
use std::net::SocketAddr;

use async_trait::async_trait;
use store_common::error::{ErrorCategory, ErrorClassification, NetworkError};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Server error: {0}")]
    Serve(String),

    #[error("{0} service is already serving")]
    AlreadyServing(&'static str),
}

impl ServiceError {
    pub fn bind(addr: SocketAddr, reason: impl Display) -> Self {
        ServiceError::Network(NetworkError::Bind {
            addr: addr.to_string(),
            reason: reason.to_string(),
        })
    }
}

impl ErrorClassification for ServiceError {
    fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::Network(e) => e.category(),
            ServiceError::Serve(_) => ErrorCategory::Transient,
            ServiceError::AlreadyServing(_) => ErrorCategory::Internal,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A listener-backed service with separate construction, bind and stop
#[async_trait]
pub trait RpcService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bind `addr` and serve in the background; returns the bound address
    async fn serve(&self, addr: SocketAddr) -> ServiceResult<SocketAddr>;

    /// Stop accepting and wait for in-flight requests
    async fn graceful_stop(&self);

    /// Stop immediately, dropping open connections
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_is_configuration() {
        let err = ServiceError::bind("127.0.0.1:80".parse().unwrap(), "permission denied");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1:80"));
    }
}
