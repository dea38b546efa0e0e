//! Websocket streaming of write events at `/ws`
//!
//! Clients may pass `?streams=<glob>` to receive only matching keys.

use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Body, Request, Response, StatusCode};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::api::plain;
use super::http::RouteHandler;
use crate::glob::GlobPattern;
use crate::storage::StorageEngine;

pub fn stream_route(storage: Arc<dyn StorageEngine>) -> RouteHandler {
    Arc::new(move |req| {
        let storage = Arc::clone(&storage);
        async move { upgrade(req, storage) }.boxed()
    })
}

fn streams_filter(req: &Request<Body>) -> Result<GlobPattern, String> {
    let pattern = req
        .uri()
        .query()
        .and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(name, _)| *name == "streams")
                .map(|(_, value)| value.to_string())
        })
        .unwrap_or_else(|| "*".to_string());
    GlobPattern::compile(&pattern).map_err(|e| e.to_string())
}

fn upgrade(mut req: Request<Body>, storage: Arc<dyn StorageEngine>) -> Response<Body> {
    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return plain(StatusCode::BAD_REQUEST, "expected websocket upgrade"),
    };
    let filter = match streams_filter(&req) {
        Ok(filter) => filter,
        Err(e) => return plain(StatusCode::BAD_REQUEST, &e),
    };

    // Subscribe before answering so no event between handshake and pump is lost
    let events = storage.subscribe();
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                pump(socket, events, filter).await;
            }
            Err(e) => warn!(error = %e, "Websocket upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, key)
        .body(Body::empty())
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "handshake failed"))
}

async fn pump<S>(
    socket: WebSocketStream<S>,
    mut events: tokio::sync::broadcast::Receiver<crate::schema::WriteEvent>,
    filter: GlobPattern,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    info!(streams = %filter, "Stream client connected");
    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if !filter.matches(event.key.as_str()) {
                        continue;
                    }
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode write event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Stream client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_streams_filter_defaults_to_everything() {
        let filter = streams_filter(&request("/ws")).unwrap();
        assert!(filter.matches_everything());
    }

    #[test]
    fn test_streams_filter_from_query() {
        let filter = streams_filter(&request("/ws?x=1&streams=AAPL/*")).unwrap();
        assert!(filter.matches("AAPL/1Min/OHLCV"));
        assert!(!filter.matches("MSFT/1Min/OHLCV"));
    }

    #[test]
    fn test_bad_filter_rejected() {
        assert!(streams_filter(&request("/ws?streams=[AB")).is_err());
    }
}
