use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::http::{serve_http, HttpMux};
use super::ServiceResult;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Heartbeat {
    pub status: &'static str,
    pub uptime: String,
    pub start_time: DateTime<Utc>,
}

impl Heartbeat {
    pub fn since(start_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let seconds = (now - start_time).num_seconds().max(0) as u64;
        Self {
            status: "running",
            uptime: crate::config::duration::format_duration(std::time::Duration::from_secs(
                seconds,
            )),
            start_time,
        }
    }
}

/// Optional side listener exposing `/heartbeat`
pub struct UtilitiesServer {
    start_time: DateTime<Utc>,
}

impl UtilitiesServer {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self { start_time }
    }

    pub fn mux(&self) -> Arc<HttpMux> {
        let mux = HttpMux::new();
        let start_time = self.start_time;
        mux.handle(
            "/heartbeat",
            Arc::new(move |_req| {
                async move {
                    let body = serde_json::to_vec(&Heartbeat::since(start_time, Utc::now()))
                        .unwrap_or_default();
                    Response::builder()
                        .header(CONTENT_TYPE, "application/json")
                        .body(Body::from(body))
                        .unwrap_or_else(|_| Response::new(Body::empty()))
                }
                .boxed()
            }),
        );
        Arc::new(mux)
    }

    /// Bind and serve in the background until `shutdown`
    pub fn start(&self, addr: SocketAddr, shutdown: CancellationToken) -> ServiceResult<SocketAddr> {
        let (bound, serving) = serve_http(addr, self.mux(), shutdown)?;
        info!(addr = %bound, "Utilities endpoint listening");
        tokio::spawn(async move {
            if let Err(e) = serving.await {
                warn!(error = %e, "Utilities endpoint stopped with error");
            }
        });
        Ok(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hyper::{Request, StatusCode};

    #[test]
    fn test_heartbeat_uptime() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 10, 30, 0).unwrap();
        let beat = Heartbeat::since(start, now);
        assert_eq!(beat.status, "running");
        assert_eq!(beat.uptime, "1h30m");
    }

    #[tokio::test]
    async fn test_heartbeat_route() {
        let server = UtilitiesServer::new(Utc::now());
        let response = server
            .mux()
            .dispatch(Request::get("/heartbeat").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "running");
    }
}
