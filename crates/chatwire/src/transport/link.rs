// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Close code a backend uses to reject the presented credential.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Everything needed to open one link.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Why the remote end closed the link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    /// Whether the close means the credential was refused.
    pub fn is_auth_rejection(&self) -> bool {
        self.code == Some(CLOSE_UNAUTHORIZED) || self.reason.to_ascii_lowercase().contains("unauthorized")
    }
}

/// Inbound traffic from an open link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Text(String),
    Closed(CloseInfo),
}

/// One open channel. Cancelling `closer` asks the connector to close it.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    pub closer: CancellationToken,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OpenError {
    #[error("handshake rejected with status {status}")]
    Rejected { status: u16 },
    #[error("connection failed: {0}")]
    Failed(String),
}

impl OpenError {
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Rejected { status: 401 | 403 })
    }
}

/// Opens links. The production implementation is [`super::ws::WsConnector`].
pub trait Connector: Send + Sync + 'static {
    fn open(&self, handshake: Handshake) -> Pin<Box<dyn Future<Output = Result<Link, OpenError>> + Send + '_>>;
}
