// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: token minting, mock endpoints, and an
//! in-memory connector.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol;
use crate::transport::{CloseInfo, Connector, Handshake, Link, LinkEvent, OpenError};

const WAIT: Duration = Duration::from_secs(3);

/// Mint an unsigned JWT with an optional `exp` claim.
pub fn mint_token(exp: Option<u64>) -> String {
    let mut claims = serde_json::json!({ "sub": "user-1" });
    if let Some(exp) = exp {
        claims["exp"] = serde_json::json!(exp);
    }
    mint_token_with_claims(&claims)
}

/// Mint an unsigned JWT carrying exactly `claims`.
pub fn mint_token_with_claims(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

/// Token endpoint response body.
pub fn token_body(id_token: &str, refresh_token: Option<&str>) -> String {
    let mut body = serde_json::json!({ "id_token": id_token });
    if let Some(refresh) = refresh_token {
        body["refresh_token"] = serde_json::json!(refresh);
    }
    body.to_string()
}

/// A canned token endpoint.
pub struct MockTokenServer {
    pub addr: SocketAddr,
    pub calls: Arc<AtomicU32>,
    pub bodies: Arc<Mutex<Vec<String>>>,
}

impl MockTokenServer {
    pub fn url(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Form body of the `n`th request.
    pub fn body(&self, n: usize) -> Option<String> {
        self.bodies.lock().get(n).cloned()
    }
}

/// Serve `responses` in order from `POST /token`, repeating the last one.
pub async fn mock_token_server(responses: Vec<(u16, String)>) -> anyhow::Result<MockTokenServer> {
    mock_token_server_with_delay(responses, Duration::ZERO).await
}

/// [`mock_token_server`] that sleeps `delay` before answering.
pub async fn mock_token_server_with_delay(
    responses: Vec<(u16, String)>,
    delay: Duration,
) -> anyhow::Result<MockTokenServer> {
    let calls = Arc::new(AtomicU32::new(0));
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(responses);

    let app = Router::new().route(
        "/token",
        post({
            let calls = Arc::clone(&calls);
            let bodies = Arc::clone(&bodies);
            move |body: String| {
                let idx = calls.fetch_add(1, Ordering::Relaxed) as usize;
                bodies.lock().push(body);
                let (status, body) = responses
                    .get(idx)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or((500, "{}".to_owned()));
                async move {
                    tokio::time::sleep(delay).await;
                    (
                        axum::http::StatusCode::from_u16(status)
                            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
                        body,
                    )
                }
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(MockTokenServer { addr, calls, bodies })
}

/// Poll `condition` until it holds or a few seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Receive from a broadcast channel until `pick` matches, or time out.
pub async fn next_matching<T: Clone, R>(
    rx: &mut tokio::sync::broadcast::Receiver<T>,
    mut pick: impl FnMut(&T) -> Option<R>,
) -> anyhow::Result<R> {
    let fut = async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return Ok(found);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(anyhow::anyhow!("event channel closed: {e}")),
            }
        }
    };
    tokio::time::timeout(WAIT, fut).await.map_err(|_| anyhow::anyhow!("timed out waiting for event"))?
}

/// Server side of one in-memory link.
pub struct MemoryPeer {
    pub handshake: Handshake,
    frames: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    closer: CancellationToken,
}

impl MemoryPeer {
    /// Next frame the client sent, split into event and payload.
    pub async fn next_frame(&mut self) -> anyhow::Result<(String, Value)> {
        let text = tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for frame"))?
            .ok_or_else(|| anyhow::anyhow!("link closed"))?;
        protocol::decode(&text).ok_or_else(|| anyhow::anyhow!("untagged frame: {text}"))
    }

    /// Skip frames until one tagged `event` arrives.
    pub async fn expect(&mut self, event: &str) -> anyhow::Result<Value> {
        loop {
            let (name, payload) = self.next_frame().await?;
            if name == event {
                return Ok(payload);
            }
        }
    }

    /// Whether any frame is waiting right now.
    pub fn try_frame(&mut self) -> Option<(String, Value)> {
        self.frames.try_recv().ok().and_then(|text| protocol::decode(&text))
    }

    pub fn send(&self, event: &str, payload: Value) {
        let _ = self.inbound.send(LinkEvent::Text(protocol::encode(event, &payload)));
    }

    pub fn close(&self, code: Option<u16>, reason: &str) {
        let _ = self.inbound.send(LinkEvent::Closed(CloseInfo { code, reason: reason.to_owned() }));
    }

    /// Whether the client closed this link.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    pub fn bearer(&self) -> Option<&str> {
        self.handshake.header("authorization").and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Connector that hands each opened link to the test as a [`MemoryPeer`].
pub struct MemoryConnector {
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
    rejections: Mutex<VecDeque<OpenError>>,
    stalls: Mutex<u32>,
    handshakes: Mutex<Vec<Handshake>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
            rejections: Mutex::new(VecDeque::new()),
            stalls: Mutex::new(0),
            handshakes: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next open with `error`.
    pub fn reject_next(&self, error: OpenError) {
        self.rejections.lock().push_back(error);
    }

    /// Make the next open hang until its caller gives up on it.
    pub fn stall_next(&self) {
        *self.stalls.lock() += 1;
    }

    /// Every handshake attempted so far, including rejected ones.
    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.handshakes.lock().len()
    }

    /// Wait for the next successfully opened link.
    pub async fn accept(&self) -> anyhow::Result<MemoryPeer> {
        let mut rx = self.peers_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for connection"))?
            .ok_or_else(|| anyhow::anyhow!("connector dropped"))
    }
}

impl Connector for MemoryConnector {
    fn open(&self, handshake: Handshake) -> Pin<Box<dyn Future<Output = Result<Link, OpenError>> + Send + '_>> {
        Box::pin(async move {
            self.handshakes.lock().push(handshake.clone());
            if let Some(error) = self.rejections.lock().pop_front() {
                return Err(error);
            }
            let stall = {
                let mut stalls = self.stalls.lock();
                let stall = *stalls > 0;
                *stalls = stalls.saturating_sub(1);
                stall
            };
            if stall {
                return std::future::pending().await;
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let closer = CancellationToken::new();
            let peer = MemoryPeer { handshake, frames: out_rx, inbound: in_tx, closer: closer.clone() };
            let _ = self.peers_tx.send(peer);
            Ok(Link { outbound: out_tx, inbound: in_rx, closer })
        })
    }
}
