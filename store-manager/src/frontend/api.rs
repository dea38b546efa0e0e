//! Query/write RPC
//!
//! Requests are JSON objects `{"method": ..., "params": ...}` posted to the
//! API listener or to `/rpc` on the primary listener. Both paths share one
//! [`RpcEndpoint`], which refuses traffic while the readiness gate is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::body::HttpBody;
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RpcService, ServiceError, ServiceResult};
use crate::lifecycle::ReadinessGate;
use crate::metrics::QUERIES_REJECTED;
use crate::schema::{Row, TimeBucketKey, WriteEvent};
use crate::storage::StorageEngine;

const DEFAULT_QUERY_LIMIT: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum ApiRequest {
    ListSymbols,
    Query {
        key: TimeBucketKey,
        #[serde(default = "default_query_limit")]
        limit: usize,
    },
    Write(WriteEvent),
}

fn default_query_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiResponse {
    Symbols(Vec<String>),
    Rows(Vec<Row>),
    Written(usize),
    Error(String),
}

#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle(&self, request: ApiRequest) -> ApiResponse;
}

/// Query/write handler backed by the storage engine
pub struct StoreApi {
    storage: Arc<dyn StorageEngine>,
}

impl StoreApi {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ApiHandler for StoreApi {
    async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::ListSymbols => {
                let mut symbols: Vec<String> = self
                    .storage
                    .catalog()
                    .iter()
                    .map(|key| key.symbol().to_string())
                    .collect();
                symbols.dedup();
                ApiResponse::Symbols(symbols)
            }
            ApiRequest::Query { key, limit } => match self.storage.query(&key, limit).await {
                Ok(rows) => ApiResponse::Rows(rows),
                Err(e) => ApiResponse::Error(e.to_string()),
            },
            ApiRequest::Write(event) => {
                let rows = event.rows.len();
                match self.storage.write(event).await {
                    Ok(()) => ApiResponse::Written(rows),
                    Err(e) => ApiResponse::Error(e.to_string()),
                }
            }
        }
    }
}

/// Per-service message size limits, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_send: usize,
    pub max_recv: usize,
}

/// Readiness-gated request decoding and dispatch
pub struct RpcEndpoint {
    limits: MessageLimits,
    gate: ReadinessGate,
    handler: RwLock<Option<Arc<dyn ApiHandler>>>,
}

impl RpcEndpoint {
    pub fn new(limits: MessageLimits, gate: ReadinessGate) -> Self {
        Self {
            limits,
            gate,
            handler: RwLock::new(None),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn ApiHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn limits(&self) -> MessageLimits {
        self.limits
    }

    pub async fn respond(&self, req: Request<Body>) -> Response<Body> {
        if req.method() != Method::POST {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "POST only");
        }
        if !self.gate.is_open() {
            QUERIES_REJECTED.inc();
            return plain(StatusCode::SERVICE_UNAVAILABLE, "server is not queryable");
        }
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            QUERIES_REJECTED.inc();
            return plain(StatusCode::SERVICE_UNAVAILABLE, "no handler registered");
        };

        let body = match read_limited(req.into_body(), self.limits.max_recv).await {
            Ok(body) => body,
            Err(status) => return plain(status, "request body rejected"),
        };
        let request: ApiRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return plain(StatusCode::BAD_REQUEST, &format!("invalid request: {}", e)),
        };
        debug!(?request, "RPC request");

        let response = handler.handle(request).await;
        let encoded = match serde_json::to_vec(&response) {
            Ok(encoded) => encoded,
            Err(e) => return plain(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        };
        if encoded.len() > self.limits.max_send {
            warn!(size = encoded.len(), limit = self.limits.max_send, "RPC response too large");
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "response exceeds max send size");
        }
        Response::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(encoded))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Collect a body, failing with 413 past `limit` bytes
async fn read_limited(mut body: Body, limit: usize) -> Result<Vec<u8>, StatusCode> {
    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|_| StatusCode::BAD_REQUEST)?;
        if buffer.len() + chunk.len() > limit {
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

pub(crate) fn plain(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
}

/// Dedicated listener for the query/write RPC
pub struct ApiService {
    endpoint: Arc<RpcEndpoint>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl ApiService {
    pub fn new(limits: MessageLimits, gate: ReadinessGate) -> Self {
        Self {
            endpoint: Arc::new(RpcEndpoint::new(limits, gate)),
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> Arc<RpcEndpoint> {
        Arc::clone(&self.endpoint)
    }
}

#[async_trait]
impl RpcService for ApiService {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn serve(&self, addr: SocketAddr) -> ServiceResult<SocketAddr> {
        if self.server.lock().is_some() {
            return Err(ServiceError::AlreadyServing(self.name()));
        }
        let builder = Server::try_bind(&addr).map_err(|e| ServiceError::bind(addr, e))?;

        let endpoint = Arc::clone(&self.endpoint);
        let make_svc = make_service_fn(move |_conn| {
            let endpoint = Arc::clone(&endpoint);
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let endpoint = Arc::clone(&endpoint);
                    async move { Ok::<_, hyper::Error>(endpoint.respond(req).await) }
                }))
            }
        });
        let server = builder.serve(make_svc);
        let bound = server.local_addr();
        let shutdown = self.shutdown.clone();
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });

        info!(addr = %bound, "API service listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                warn!(error = %e, "API service stopped with error");
            }
        });
        *self.server.lock() = Some(handle);
        Ok(bound)
    }

    async fn graceful_stop(&self) {
        self.shutdown.cancel();
        let handle = self.server.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("API service stopped");
    }

    fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.server.lock().take() {
            handle.abort();
        }
    }
}
