// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The real-time channel to the chat backend.
//!
//! [`Transport`] owns exactly one link at a time. Subscriptions are collected
//! by [`TransportBuilder`] before any link exists, and every replacement link is
//! opened only after the previous one has been torn down and its task joined.

pub mod link;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ChatError, ErrorCode};
use crate::protocol::{self, AuthPayload};
use crate::token::Credential;

pub use link::{CloseInfo, Connector, Handshake, Link, LinkEvent, OpenError, CLOSE_UNAUTHORIZED};
pub use ws::WsConnector;

/// Header carrying the page the widget is embedded in.
pub const PAGE_URL_HEADER: &str = "x-page-url";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a new credential reaches the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    /// Re-authenticate the live link and use the credential for future handshakes.
    InPlace,
    /// Tear the link down, settle, and reopen with the new credential.
    Reconnect,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { reconnect: bool },
    Disconnected { reason: String, auth_rejected: bool, will_reconnect: bool },
    ConnectError { error: String, auth_rejected: bool, will_retry: bool },
    Message { event: String, payload: Value },
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub page_url: String,
    pub settle_delay: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_attempts: u32,
    /// Upper bound on a single link open, handshake included.
    pub open_timeout: Duration,
}

impl TransportConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.socket_url.clone(),
            page_url: config.page_url.clone(),
            settle_delay: config.settle_delay(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
            reconnect_attempts: config.reconnect_attempts,
            open_timeout: config.request_timeout(),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&OpenError) + Send + Sync>;

/// Collects subscriptions before the channel exists.
pub struct TransportBuilder {
    config: TransportConfig,
    connector: Option<Arc<dyn Connector>>,
    handlers: Vec<(String, EventHandler)>,
    on_error: Option<ErrorHandler>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig) -> Self {
        Self { config, connector: None, handlers: Vec::new(), on_error: None }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register a handler for inbound frames tagged `event`.
    pub fn on(mut self, event: impl Into<String>, handler: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.handlers.push((event.into(), Arc::new(handler)));
        self
    }

    pub(crate) fn on_shared(mut self, event: String, handler: EventHandler) -> Self {
        self.handlers.push((event, handler));
        self
    }

    /// Called on every failed link open.
    pub fn on_error(mut self, handler: impl Fn(&OpenError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Arc<Transport> {
        let mut handlers: HashMap<String, Vec<EventHandler>> = HashMap::new();
        for (event, handler) in self.handlers {
            handlers.entry(event).or_default().push(handler);
        }
        let (events, _) = broadcast::channel(256);
        let (epoch, _) = watch::channel(0);
        Arc::new(Transport {
            config: self.config,
            connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            handlers,
            on_error: self.on_error,
            handle: Mutex::new(ConnectionHandle::default()),
            events,
            epoch,
        })
    }
}

struct ConnectionHandle {
    state: ConnectionState,
    is_connecting: bool,
    /// Depth of in-flight teardown sequences (reconnect or disconnect).
    disconnecting: u32,
    /// Cleared by `disconnect()`; reopen paths bail when it is false.
    wanted: bool,
    credential: Option<Credential>,
    session_hint: Option<String>,
    pending_credential_swap: Option<(Credential, RotationStrategy)>,
    outbound: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            is_connecting: false,
            disconnecting: 0,
            wanted: false,
            credential: None,
            session_hint: None,
            pending_credential_swap: None,
            outbound: None,
            cancel: None,
            task: None,
        }
    }
}

/// Clears the disconnecting flag on every exit path, including cancellation.
struct DisconnectingGuard<'a>(&'a Transport);

impl Drop for DisconnectingGuard<'_> {
    fn drop(&mut self) {
        let mut h = self.0.handle.lock();
        h.disconnecting = h.disconnecting.saturating_sub(1);
    }
}

struct ConnectingGuard<'a>(&'a Transport);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.handle.lock().is_connecting = false;
    }
}

pub struct Transport {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    handlers: HashMap<String, Vec<EventHandler>>,
    on_error: Option<ErrorHandler>,
    handle: Mutex<ConnectionHandle>,
    events: broadcast::Sender<TransportEvent>,
    /// Bumped on every credential change; parked reconnects wait on it.
    epoch: watch::Sender<u64>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("url", &self.config.url).field("state", &self.state()).finish()
    }
}

impl Transport {
    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder::new(config)
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Credential presented on the next handshake.
    pub fn credential(&self) -> Option<Credential> {
        self.handle.lock().credential.clone()
    }

    /// True while a credential rotation is tearing down or reopening the link.
    pub fn is_rotating(&self) -> bool {
        self.handle.lock().disconnecting > 0
    }

    pub fn has_pending_swap(&self) -> bool {
        self.handle.lock().pending_credential_swap.is_some()
    }

    /// Session id announced in the auth frame of future handshakes.
    pub fn set_session_hint(&self, session_id: Option<String>) {
        self.handle.lock().session_hint = session_id;
    }

    /// Open the channel. Failures are reported through the error callback and
    /// a `ConnectError` event; this call never retries.
    pub async fn connect(self: &Arc<Self>, credential: Credential, session_hint: Option<String>) -> ConnectionState {
        {
            let mut h = self.handle.lock();
            if h.state != ConnectionState::Disconnected || h.is_connecting {
                debug!(state = %h.state, "connect ignored, channel already active");
                return h.state;
            }
            if h.disconnecting > 0 {
                // The running rotation reopens the link itself.
                debug!(state = %h.state, "connect ignored, rotation in progress");
                return h.state;
            }
            h.credential = Some(credential);
            h.session_hint = session_hint;
            h.wanted = true;
            h.is_connecting = true;
            h.state = ConnectionState::Connecting;
        }
        self.epoch.send_modify(|e| *e += 1);
        let _connecting = ConnectingGuard(self);

        match self.open_link().await {
            Ok(link) => self.install(link, false),
            Err(e) => {
                self.handle.lock().state = ConnectionState::Disconnected;
                self.report_open_error(&e, false);
            }
        }
        self.state()
    }

    /// Send a frame. Only attempted while connected; never queued.
    pub fn emit(&self, event: &str, payload: &Value) -> Result<(), ChatError> {
        let h = self.handle.lock();
        let outbound = match (&h.state, &h.outbound) {
            (ConnectionState::Connected, Some(tx)) => tx,
            _ => {
                warn!(event, code = %ErrorCode::NotConnected, state = %h.state, "dropping frame, channel not connected");
                return Err(ChatError::NotConnected);
            }
        };
        outbound.send(protocol::encode(event, payload)).map_err(|_| {
            warn!(event, code = %ErrorCode::NotConnected, "dropping frame, link closed");
            ChatError::NotConnected
        })
    }

    /// Apply a new credential. A swap that arrives while a teardown sequence
    /// is running is held and applied once that sequence finishes.
    pub async fn rotate_credential(self: &Arc<Self>, credential: Credential, strategy: RotationStrategy) {
        {
            let mut h = self.handle.lock();
            if h.disconnecting > 0 {
                debug!(?strategy, "credential swap deferred until reconnect completes");
                h.pending_credential_swap = Some((credential, strategy));
                return;
            }
            if strategy == RotationStrategy::InPlace || h.state == ConnectionState::Disconnected {
                drop(h);
                self.patch_in_place(credential);
                debug!(?strategy, "credential patched in place");
                return;
            }
            h.credential = Some(credential);
            h.disconnecting += 1;
        }
        self.epoch.send_modify(|e| *e += 1);
        let _guard = DisconnectingGuard(self);

        loop {
            self.teardown("credential rotation", true).await;
            tokio::time::sleep(self.config.settle_delay).await;

            if !self.handle.lock().wanted {
                debug!("reconnect abandoned, transport disconnected meanwhile");
                return;
            }
            {
                let mut h = self.handle.lock();
                h.state = ConnectionState::Connecting;
                h.is_connecting = true;
            }
            let connecting = ConnectingGuard(self);
            match self.open_link().await {
                Ok(link) => self.install(link, true),
                Err(e) => {
                    self.handle.lock().state = ConnectionState::Disconnected;
                    self.report_open_error(&e, false);
                }
            }
            drop(connecting);

            let pending = self.handle.lock().pending_credential_swap.take();
            match pending {
                Some((cred, RotationStrategy::Reconnect)) => {
                    self.handle.lock().credential = Some(cred);
                    self.epoch.send_modify(|e| *e += 1);
                    debug!("applying deferred credential swap with reconnect");
                }
                Some((cred, RotationStrategy::InPlace)) => {
                    self.patch_in_place(cred);
                    debug!("applied deferred credential swap in place");
                    return;
                }
                None => return,
            }
        }
    }

    /// Re-authenticate the live link, if any; future handshakes pick it up too.
    fn patch_in_place(&self, credential: Credential) {
        {
            let mut h = self.handle.lock();
            if let (ConnectionState::Connected, Some(tx)) = (h.state, &h.outbound) {
                let auth =
                    AuthPayload { token: credential.access_token().to_owned(), session_id: h.session_hint.clone() };
                let _ = tx.send(protocol::encode_typed(protocol::AUTH, &auth));
            }
            h.credential = Some(credential);
        }
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Close the channel and stop any automatic reconnection.
    pub async fn disconnect(&self) {
        {
            let mut h = self.handle.lock();
            h.wanted = false;
            h.disconnecting += 1;
        }
        let _guard = DisconnectingGuard(self);
        if self.teardown("client disconnect", false).await {
            info!("transport disconnected");
        }
    }

    /// Stop the current link task and wait for it. Returns whether a link
    /// was active.
    async fn teardown(&self, reason: &str, will_reconnect: bool) -> bool {
        let (cancel, task) = {
            let mut h = self.handle.lock();
            if h.state != ConnectionState::Disconnected {
                h.state = ConnectionState::Disconnecting;
            }
            h.outbound = None;
            (h.cancel.take(), h.task.take())
        };
        let active = cancel.is_some();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        self.handle.lock().state = ConnectionState::Disconnected;
        if active {
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: reason.to_owned(),
                auth_rejected: false,
                will_reconnect,
            });
        }
        active
    }

    fn handshake(&self) -> (Handshake, Option<AuthPayload>, u64) {
        let h = self.handle.lock();
        let epoch = *self.epoch.borrow();
        let mut headers = vec![(PAGE_URL_HEADER.to_owned(), self.config.page_url.clone())];
        let auth = h.credential.as_ref().map(|cred| {
            headers.push(("authorization".to_owned(), format!("Bearer {}", cred.access_token())));
            AuthPayload { token: cred.access_token().to_owned(), session_id: h.session_hint.clone() }
        });
        (Handshake { url: self.config.url.clone(), headers }, auth, epoch)
    }

    async fn open_link(&self) -> Result<(Link, Option<AuthPayload>, u64), OpenError> {
        let (handshake, auth, epoch) = self.handshake();
        let link = self.open_bounded(handshake).await?;
        Ok((link, auth, epoch))
    }

    async fn open_bounded(&self, handshake: Handshake) -> Result<Link, OpenError> {
        match tokio::time::timeout(self.config.open_timeout, self.connector.open(handshake)).await {
            Ok(result) => result,
            Err(_) => Err(OpenError::Failed(format!("handshake timed out after {:?}", self.config.open_timeout))),
        }
    }

    fn report_open_error(&self, error: &OpenError, will_retry: bool) {
        let auth_rejected = error.is_auth_rejection();
        warn!(err = %error, auth_rejected, will_retry, "transport connect failed");
        if let Some(ref on_error) = self.on_error {
            on_error(error);
        }
        let _ = self.events.send(TransportEvent::ConnectError { error: error.to_string(), auth_rejected, will_retry });
    }

    /// Make `link` the live link and start its task.
    fn install(self: &Arc<Self>, (link, auth, epoch): (Link, Option<AuthPayload>, u64), reconnect: bool) {
        let cancel = CancellationToken::new();
        {
            let mut h = self.handle.lock();
            if !h.wanted {
                link.closer.cancel();
                h.state = ConnectionState::Disconnected;
                return;
            }
            h.state = ConnectionState::Connected;
            h.outbound = Some(link.outbound.clone());
            if let Some(previous) = h.cancel.replace(cancel.clone()) {
                warn!("replacing a live link, closing the previous one");
                previous.cancel();
            }
        }
        if let Some(auth) = auth {
            let _ = link.outbound.send(protocol::encode_typed(protocol::AUTH, &auth));
        }
        info!(url = %self.config.url, reconnect, "transport connected");
        let _ = self.events.send(TransportEvent::Connected { reconnect });

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_link(link, epoch, cancel).await });
        self.handle.lock().task = Some(task);
    }

    /// Pump one link, and its automatic replacements, until cancelled or
    /// reconnection gives up.
    async fn run_link(self: Arc<Self>, mut link: Link, mut epoch: u64, cancel: CancellationToken) {
        loop {
            let close = tokio::select! {
                _ = cancel.cancelled() => {
                    link.closer.cancel();
                    return;
                }
                event = link.inbound.recv() => match event {
                    Some(LinkEvent::Text(text)) => {
                        self.dispatch(&text);
                        continue;
                    }
                    Some(LinkEvent::Closed(info)) => info,
                    None => CloseInfo::default(),
                },
            };
            link.closer.cancel();
            if cancel.is_cancelled() {
                return;
            }

            let auth_rejected = close.is_auth_rejection();
            let will_reconnect = self.config.reconnect_attempts > 0;
            {
                let mut h = self.handle.lock();
                h.outbound = None;
                h.state = if will_reconnect { ConnectionState::Connecting } else { ConnectionState::Disconnected };
            }
            warn!(code = ?close.code, reason = %close.reason, auth_rejected, "transport closed by peer");
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: close.reason.clone(),
                auth_rejected,
                will_reconnect,
            });
            if !will_reconnect {
                return;
            }

            match self.reconnect(auth_rejected, epoch, &cancel).await {
                Some((next, next_epoch)) => {
                    link = next;
                    epoch = next_epoch;
                }
                None => return,
            }
        }
    }

    /// Automatic reconnection with exponential backoff. A refused credential
    /// parks the loop until a new one is rotated in.
    async fn reconnect(&self, mut auth_blocked: bool, mut epoch: u64, cancel: &CancellationToken) -> Option<(Link, u64)> {
        let mut backoff = self.config.reconnect_initial;
        let mut attempt = 0u32;
        let mut epochs = self.epoch.subscribe();

        loop {
            if auth_blocked {
                debug!("reconnect parked until credential rotation");
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    rotated = async { epochs.wait_for(|e| *e != epoch).await.is_ok() } => {
                        if !rotated {
                            return None;
                        }
                    }
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            attempt += 1;
            let (handshake, auth, used_epoch) = self.handshake();
            self.handle.lock().is_connecting = true;
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.open_bounded(handshake) => Some(result),
            };
            self.handle.lock().is_connecting = false;
            let Some(result) = result else { return None };

            match result {
                Ok(link) => {
                    if cancel.is_cancelled() {
                        link.closer.cancel();
                        return None;
                    }
                    {
                        let mut h = self.handle.lock();
                        h.state = ConnectionState::Connected;
                        h.outbound = Some(link.outbound.clone());
                    }
                    if let Some(auth) = auth {
                        let _ = link.outbound.send(protocol::encode_typed(protocol::AUTH, &auth));
                    }
                    info!(attempt, "transport reconnected");
                    let _ = self.events.send(TransportEvent::Connected { reconnect: true });
                    return Some((link, used_epoch));
                }
                Err(e) => {
                    let will_retry = attempt < self.config.reconnect_attempts;
                    auth_blocked = e.is_auth_rejection();
                    epoch = used_epoch;
                    self.report_open_error(&e, will_retry);
                    if !will_retry {
                        warn!(attempt, "giving up on automatic reconnection");
                        self.handle.lock().state = ConnectionState::Disconnected;
                        return None;
                    }
                    backoff = (backoff * 2).min(self.config.reconnect_max);
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let Some((event, payload)) = protocol::decode(text) else {
            debug!(len = text.len(), "ignoring untagged frame");
            return;
        };
        if let Some(handlers) = self.handlers.get(&event) {
            for handler in handlers {
                handler(&payload);
            }
        }
        let _ = self.events.send(TransportEvent::Message { event, payload });
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
