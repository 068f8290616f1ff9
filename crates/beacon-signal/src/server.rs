//! WebSocket signal server adapter
//!
//! Thin shell around the signaling core: accepts connections, frames
//! messages, and implements the `Transport` callbacks. Plain HTTP GETs for
//! `/health` and `/stats` are answered on the same listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
};
use tracing::{debug, info, warn};

use crate::messages::SignalMessage;
use crate::rate_limit::{RateLimiter, RateLimiterConfig};
use crate::router::{MessageRouter, Stats};
use crate::transport::{ConnId, Transport, CLOSE_RATE_LIMITED};

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// How long a pending session waits for fresh ICE servers before
    /// falling back to the cached ones
    pub fallback_timeout: Duration,
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            fallback_timeout: Duration::from_secs(crate::FALLBACK_TIMEOUT_SECS),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// What the core may queue onto a connection
enum Outbound {
    Message(String),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Transport backed by one unbounded queue per WebSocket connection
struct WsTransport {
    next_id: AtomicU64,
    peers: DashMap<ConnId, mpsc::UnboundedSender<Outbound>>,
}

impl WsTransport {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            peers: DashMap::new(),
        }
    }

    fn register(&self, tx: mpsc::UnboundedSender<Outbound>) -> ConnId {
        let conn = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.insert(conn, tx);
        conn
    }

    fn unregister(&self, conn: ConnId) {
        self.peers.remove(&conn);
    }
}

impl Transport for WsTransport {
    fn send(&self, conn: ConnId, msg: &SignalMessage) {
        let Some(tx) = self.peers.get(&conn) else {
            debug!("dropping message for vanished connection #{}", conn);
            return;
        };
        match serde_json::to_string(msg) {
            Ok(json) => {
                let _ = tx.send(Outbound::Message(json));
            }
            Err(e) => warn!("failed to serialize message for #{}: {}", conn, e),
        }
    }

    fn close(&self, conn: ConnId, code: u16, reason: &str) {
        if let Some(tx) = self.peers.get(&conn) {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

/// Signal server: listener plus the core it feeds
pub struct SignalServer {
    router: Arc<MessageRouter>,
    transport: Arc<WsTransport>,
    limiter: Arc<RateLimiter>,
}

impl SignalServer {
    pub fn new(config: ServerConfig) -> Self {
        let transport = Arc::new(WsTransport::new());
        let limiter = Arc::new(RateLimiter::new(config.rate_limiter));
        let router = Arc::new(MessageRouter::new(
            transport.clone(),
            limiter.clone(),
            config.fallback_timeout,
        ));
        Self {
            router,
            transport,
            limiter,
        }
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        self.limiter.start();
        let listener = TcpListener::bind(addr).await?;
        info!("signal server listening on {}", addr);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let router = self.router.clone();
            let transport = self.transport.clone();
            let limiter = self.limiter.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, router, transport, limiter).await
                {
                    debug!("connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Registration check for surrounding status endpoints
    pub fn is_online(&self, remote_id: &str) -> bool {
        self.router.is_online(remote_id)
    }

    pub fn stats(&self) -> Stats {
        self.router.stats()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

/// Handle a single connection (HTTP status query or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<MessageRouter>,
    transport: Arc<WsTransport>,
    limiter: Arc<RateLimiter>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the request line: status paths are answered as plain HTTP,
    // everything else goes through the WebSocket upgrade
    let mut peek_buf = [0u8; 1024];
    let n = stream.peek(&mut peek_buf).await?;
    if let Some(path) = http_request_path(&peek_buf[..n]) {
        if path == "/health" || path == "/stats" {
            let path = path.to_string();
            return handle_http_request(&mut stream, &path, &router).await;
        }
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Refuse blocked addresses before doing any signaling work
    let addr = peer_addr.ip().to_string();
    if let Err(retry) = limiter.check(&addr) {
        debug!("refusing blocked address {}", addr);
        let frame = CloseFrame {
            code: CloseCode::from(CLOSE_RATE_LIMITED),
            reason: format!("rate limited, retry in {}s", retry.as_secs()).into(),
        };
        let _ = ws_sender.send(Message::Close(Some(frame))).await;
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pong_tx = tx.clone();
    let conn = transport.register(tx);
    router.set_client_address(conn, addr);
    debug!("new connection from {} as #{}", peer_addr, conn);

    // Writer task drains the outbound queue for this connection
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                Outbound::Message(json) => ws_sender.send(Message::Text(json)).await,
                Outbound::Pong(data) => ws_sender.send(Message::Pong(data)).await,
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                let _ = pong_tx.send(Outbound::Pong(data));
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("websocket error on #{}: {:?}", conn, e);
                break;
            }
        };

        match SignalMessage::from_json(&text) {
            Ok(msg) => router.handle_message(conn, msg),
            Err(e) => {
                warn!("unrecognized message from #{}: {}", conn, e);
                transport.send(
                    conn,
                    &SignalMessage::error(format!("unrecognized message: {}", e)),
                );
            }
        }
    }

    // Cascading cleanup runs exactly once, when the reader ends
    router.handle_disconnect(conn);
    transport.unregister(conn);
    drop(pong_tx);
    let _ = writer.await;

    debug!("connection #{} closed", conn);
    Ok(())
}

/// Extract the path from a peeked HTTP GET request line
fn http_request_path(buf: &[u8]) -> Option<&str> {
    if !buf.starts_with(b"GET ") {
        return None;
    }
    let line = std::str::from_utf8(buf).ok()?.lines().next()?;
    line.split_whitespace().nth(1)
}

/// Answer a health or stats query
async fn handle_http_request(
    stream: &mut TcpStream,
    path: &str,
    router: &MessageRouter,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Consume the request before replying
    let mut buf = vec![0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let stats = router.stats();
    let (status, body) = match path {
        "/health" => (
            "200 OK",
            format!(
                r#"{{"status":"healthy","servers":{},"sessions":{}}}"#,
                stats.server_count, stats.active_session_count
            ),
        ),
        "/stats" => ("200 OK", serde_json::to_string(&stats)?),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
