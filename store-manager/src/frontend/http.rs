//! Primary HTTP listener
//!
//! Exact-path router. Handlers are registered during startup, before the
//! listener binds.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::api::{plain, RpcEndpoint};
use super::{ServiceError, ServiceResult};
use crate::metrics;

pub type RouteHandler =
    Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Response<Body>> + Send + Sync>;

#[derive(Default)]
pub struct HttpMux {
    routes: RwLock<HashMap<String, RouteHandler>>,
}

impl HttpMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, path: &str, handler: RouteHandler) {
        info!(path, "Registered HTTP handler");
        self.routes.write().insert(path.to_string(), handler);
    }

    /// Route `/rpc` to a shared RPC endpoint
    pub fn handle_rpc(&self, path: &str, endpoint: Arc<RpcEndpoint>) {
        self.handle(
            path,
            Arc::new(move |req| {
                let endpoint = Arc::clone(&endpoint);
                async move { endpoint.respond(req).await }.boxed()
            }),
        );
    }

    /// Prometheus text exposition
    pub fn handle_metrics(&self, path: &str) {
        self.handle(
            path,
            Arc::new(|_req| {
                async {
                    match metrics::render() {
                        Ok(buffer) => Response::builder()
                            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Body::from(buffer))
                            .unwrap_or_else(|_| Response::new(Body::empty())),
                        Err(e) => {
                            error!(error = %e, "Failed to encode metrics");
                            plain(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                        }
                    }
                }
                .boxed()
            }),
        );
    }

    pub fn routes(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let handler = self.routes.read().get(req.uri().path()).cloned();
        match handler {
            Some(handler) => handler(req).await,
            None => plain(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

pub type ServeFuture = Pin<Box<dyn Future<Output = ServiceResult<()>> + Send>>;

/// Bind the primary listener. The returned future serves until `shutdown`
/// fires; a bind failure is returned immediately.
pub fn serve_http(
    addr: SocketAddr,
    mux: Arc<HttpMux>,
    shutdown: CancellationToken,
) -> ServiceResult<(SocketAddr, ServeFuture)> {
    let builder = Server::try_bind(&addr).map_err(|e| ServiceError::bind(addr, e))?;
    let make_svc = make_service_fn(move |_conn| {
        let mux = Arc::clone(&mux);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let mux = Arc::clone(&mux);
                async move { Ok::<_, Infallible>(mux.dispatch(req).await) }
            }))
        }
    });
    let server = builder.serve(make_svc);
    let bound = server.local_addr();
    info!(addr = %bound, "HTTP listener bound");

    let serving = server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .map(|result| result.map_err(|e| ServiceError::Serve(e.to_string())));
    Ok((bound, Box::pin(serving)))
}
