//! Shared helpers: an in-process WebSocket server and client builders.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use ws_resilient_client::{
    BackoffPolicy, ClientConfig, ClientConfigBuilder, ConnectionManager, MessageChannel,
};

pub type ServerStream = WebSocketStream<TcpStream>;

/// What the client put on the upgrade request
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub authorization: Option<String>,
    pub query: Option<String>,
}

impl Handshake {
    fn from_request(request: &Request) -> Self {
        Self {
            authorization: request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            query: request.uri().query().map(str::to_string),
        }
    }
}

/// A mock server bound to an available port.
pub struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let addr = listener.local_addr().expect("no local addr");
        Self { listener, addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Accept one connection and complete the upgrade.
    pub async fn accept(&self) -> (ServerStream, Handshake) {
        let (stream, _) = self.listener.accept().await.expect("accept failed");
        let mut seen = Handshake::default();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            seen = Handshake::from_request(request);
            Ok(response)
        };
        let ws = accept_hdr_async(stream, callback)
            .await
            .expect("upgrade failed");
        (ws, seen)
    }

    /// Accept one connection and reject the upgrade with `status`.
    pub async fn reject(&self, status: StatusCode) {
        let (stream, _) = self.listener.accept().await.expect("accept failed");
        let callback = move |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            let mut error = ErrorResponse::new(Some("rejected".to_string()));
            *error.status_mut() = status;
            Err(error)
        };
        let result = accept_hdr_async(stream, callback).await;
        assert!(result.is_err());
    }
}

/// Next text frame from the client, skipping control frames.
pub async fn next_text(ws: &mut ServerStream) -> String {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client stream ended")
            .expect("client stream error");
        match frame {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next text frame parsed as JSON.
pub async fn next_json(ws: &mut ServerStream) -> Value {
    let text = next_text(ws).await;
    serde_json::from_str(&text).expect("client sent invalid JSON")
}

/// Next JSON text frame, or `None` once the client went away.
pub async fn try_next_json(ws: &mut ServerStream) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Read until the client goes away.
pub async fn drain(mut ws: ServerStream) {
    while let Some(Ok(_)) = ws.next().await {}
}

/// Builder with short timeouts and fast backoff.
pub fn fast_config(url: &str) -> ClientConfigBuilder {
    ClientConfig::builder(url)
        .connect_timeout(Duration::from_secs(2))
        .io_timeout(Duration::from_secs(2))
        .max_retries(3)
        .backoff(BackoffPolicy::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
        ))
}

pub fn manager(config: ClientConfig) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(config))
}

pub fn channel(manager: &Arc<ConnectionManager>) -> MessageChannel {
    MessageChannel::new(Arc::clone(manager))
}

/// A port nothing listens on.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
    listener.local_addr().expect("no local addr").port()
}

/// Poll `condition` until it holds or `limit` expires.
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
