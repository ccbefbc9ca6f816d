// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level controller tying credentials, the transport, and the session
//! together.
//!
//! Every external trigger (mount, login, timer, rejection, manual restart,
//! unmount) enters here. It is also the only place that flips the
//! authentication state back to [`AuthState::Unauthenticated`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ChatError;
use crate::oauth::{AuthorizationRequest, CallbackGuard, PopupMessage};
use crate::protocol::{self, BotUttered, SessionConfirm, UserUttered};
use crate::refresh::TokenRefresher;
use crate::schedule::{RefreshScheduler, SchedulerEvent};
use crate::session::{SessionCoordinator, SessionIdentity};
use crate::store::TokenStore;
use crate::token::Credential;
use crate::transport::{
    Connector, EventHandler, RotationStrategy, Transport, TransportBuilder, TransportConfig, TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    /// Authenticated, but the channel is down and not coming back on its own.
    Disconnected,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What asked for a refresh. Logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Startup,
    Manual,
    Rejected,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    AuthStateChanged { prev: AuthState, next: AuthState },
    LoginRequired { reason: String },
    SessionStarted(SessionIdentity),
    BotUttered(BotUttered),
    SendDropped { message: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

struct PendingLogin {
    request: AuthorizationRequest,
    guard: CallbackGuard,
}

struct LifecycleState {
    auth: AuthState,
    outbound: VecDeque<String>,
    login: Option<PendingLogin>,
    listener: Option<(CancellationToken, JoinHandle<()>)>,
    /// A rejection already cost one refresh since the last established link.
    rejection_refreshed: bool,
}

pub struct LifecycleBuilder {
    config: Config,
    store: Option<TokenStore>,
    connector: Option<Arc<dyn Connector>>,
    handlers: Vec<(String, EventHandler)>,
}

impl LifecycleBuilder {
    pub fn store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Subscribe to inbound frames tagged `event` before the channel exists.
    pub fn on(mut self, event: impl Into<String>, handler: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.handlers.push((event.into(), Arc::new(handler)));
        self
    }

    pub fn build(self) -> Result<Arc<Lifecycle>, ChatError> {
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => TokenStore::open(config.storage, &config.storage_file())?,
        };
        let custom_data = config.custom_data_value().unwrap_or_else(|e| {
            warn!("ignoring custom data: {e:#}");
            serde_json::json!({})
        });

        let refresher = Arc::new(TokenRefresher::new(&config, store.clone())?);
        let scheduler =
            RefreshScheduler::new(Arc::clone(&refresher), config.refresh_margin(), config.min_refresh_delay());

        let mut transport = TransportBuilder::new(TransportConfig::from_config(&config));
        if let Some(connector) = self.connector {
            transport = transport.connector(connector);
        }
        for (event, handler) in self.handlers {
            transport = transport.on_shared(event, handler);
        }
        let transport = transport.build();

        let (events, _) = broadcast::channel(64);
        Ok(Arc::new(Lifecycle {
            sessions: SessionCoordinator::new(store.clone(), custom_data.clone()),
            custom_data,
            config,
            store,
            refresher,
            scheduler,
            transport,
            state: Mutex::new(LifecycleState {
                auth: AuthState::Unauthenticated,
                outbound: VecDeque::new(),
                login: None,
                listener: None,
                rejection_refreshed: false,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            events,
        }))
    }
}

pub struct Lifecycle {
    config: Config,
    custom_data: Value,
    store: TokenStore,
    refresher: Arc<TokenRefresher>,
    scheduler: Arc<RefreshScheduler>,
    transport: Arc<Transport>,
    sessions: SessionCoordinator,
    state: Mutex<LifecycleState>,
    /// Serializes refreshes across triggers.
    refresh_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Lifecycle {
    pub fn builder(config: Config) -> LifecycleBuilder {
        LifecycleBuilder { config, store: None, connector: None, handlers: Vec::new() }
    }

    pub fn state(&self) -> AuthState {
        self.state.lock().auth
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Unauthenticated with no login flow running. A `LoginRequired` event
    /// seen when this is false has already been acted on.
    pub fn needs_login(&self) -> bool {
        let st = self.state.lock();
        st.auth == AuthState::Unauthenticated && st.login.is_none()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().outbound.len()
    }

    /// Seed authentication from storage and open the channel when possible.
    pub async fn mount(self: &Arc<Self>) -> AuthState {
        self.start_listener();

        match self.store.credential() {
            Some(cred) if cred.is_valid() => {
                info!(expires_in = cred.expires_in_secs(), "mounting with stored credential");
                self.set_auth(AuthState::Authenticated);
                self.start(cred).await;
            }
            _ if self.store.refresh_token().is_some() => {
                info!("stored access token unusable, refreshing");
                match self.refresh_now(RefreshTrigger::Startup).await {
                    Ok(cred) => {
                        self.set_auth(AuthState::Authenticated);
                        self.start(cred).await;
                    }
                    Err(e) => self.logout(&e).await,
                }
            }
            _ => {
                info!("no stored credential, login required");
                self.set_auth(AuthState::Unauthenticated);
                let _ = self.events.send(LifecycleEvent::LoginRequired { reason: "no stored credential".to_owned() });
            }
        }
        self.state()
    }

    /// Stop the timer, stop reacting to events, and close the channel.
    pub async fn unmount(&self) {
        self.scheduler.cancel();
        let listener = self.state.lock().listener.take();
        if let Some((cancel, task)) = listener {
            cancel.cancel();
            // The listener may be parked inside a link open; do not wait on it.
            task.abort();
            let _ = task.await;
        }
        self.transport.disconnect().await;
        self.sessions.end_transport_lifetime();
        info!("unmounted");
    }

    /// Start an interactive login. Returns the URL to open, or `None` when no
    /// authorization endpoint is configured.
    pub fn begin_login(&self) -> Option<String> {
        let auth_url = self.config.auth_url.as_deref()?;
        let request = AuthorizationRequest::new(&self.config, auth_url);
        let url = request.url.clone();
        let guard = CallbackGuard::new(request.state.clone());
        self.state.lock().login = Some(PendingLogin { request, guard });
        self.set_auth(AuthState::Authenticating);
        Some(url)
    }

    /// Handle a message from the login window. `Ok(true)` when it completed
    /// the login, `Ok(false)` when it was ignored.
    pub async fn complete_login(self: &Arc<Self>, message: &PopupMessage) -> Result<bool, ChatError> {
        let (verifier, state) = {
            let mut st = self.state.lock();
            let Some(login) = st.login.as_mut() else {
                debug!("login message without a pending login");
                return Ok(false);
            };
            if !login.guard.check(message)? {
                return Ok(false);
            }
            (login.request.pkce.verifier.clone(), login.request.state.clone())
        };

        match self.refresher.exchange_code(&message.code, &verifier, &state).await {
            Ok(cred) => {
                self.state.lock().login = None;
                info!("login complete");
                self.set_auth(AuthState::Authenticated);
                self.start(cred).await;
                Ok(true)
            }
            Err(e) => {
                warn!(code = %e.code(), "authorization code exchange failed: {e}");
                self.set_auth(AuthState::Unauthenticated);
                let _ = self.events.send(LifecycleEvent::LoginRequired { reason: e.to_string() });
                Err(e)
            }
        }
    }

    /// Refresh now, patch the live channel in place, then restart the
    /// conversation on it.
    pub async fn refresh_and_restart(self: &Arc<Self>) -> Result<SessionRestart, ChatError> {
        let prev = self.state();
        let cred = match self.refresh_now(RefreshTrigger::Manual).await {
            Ok(cred) => cred,
            Err(e) if e.code().is_auth_failure() => {
                self.logout(&e).await;
                return Err(e);
            }
            Err(e) => {
                warn!(code = %e.code(), "manual refresh failed: {e}");
                self.set_auth(prev);
                if let Some(current) = self.store.credential().filter(Credential::is_valid) {
                    self.scheduler.schedule(&current);
                }
                return Err(e);
            }
        };

        self.transport.rotate_credential(cred.clone(), RotationStrategy::InPlace).await;
        self.scheduler.schedule(&cred);
        self.set_auth(AuthState::Authenticated);
        self.restart_session(cred).await
    }

    /// Send a user message, or queue it until a session is confirmed.
    pub fn send_message(&self, text: &str) -> SendOutcome {
        if let Some(session) = self.sessions.active() {
            if self.transport.is_connected() && self.emit_utterance(text, &session.session_id).is_ok() {
                return SendOutcome::Sent;
            }
        }
        self.enqueue(text.to_owned());
        SendOutcome::Queued
    }

    /// Serialize a refresh behind any other in flight. A caller that waited
    /// reuses a fresher valid credential instead of hitting the network again.
    pub async fn refresh_now(&self, trigger: RefreshTrigger) -> Result<Credential, ChatError> {
        self.scheduler.cancel();
        let before = self.store.credential();
        let _gate = self.refresh_gate.lock().await;

        if let Some(stored) = self.store.credential() {
            if stored.is_valid() && Some(&stored) != before.as_ref() {
                debug!(?trigger, "reusing credential refreshed by another trigger");
                return Ok(stored);
            }
        }

        self.set_auth(AuthState::Refreshing);
        info!(?trigger, "refreshing credential");
        self.refresher.refresh_stored().await
    }

    async fn start(self: &Arc<Self>, cred: Credential) {
        self.scheduler.schedule(&cred);
        self.transport.connect(cred, self.sessions.hint()).await;
    }

    async fn restart_session(self: &Arc<Self>, cred: Credential) -> Result<SessionRestart, ChatError> {
        self.sessions.reset()?;
        self.transport.set_session_hint(None);
        if self.transport.is_connected() {
            self.sessions.request_session(&self.transport, None)?;
            Ok(SessionRestart::Requested)
        } else if self.transport.is_rotating() {
            debug!("restart rides on the rotation already reopening the link");
            Ok(SessionRestart::Reconnecting)
        } else {
            // The Connected handler requests the session.
            self.transport.connect(cred, None).await;
            Ok(SessionRestart::Reconnecting)
        }
    }

    async fn logout(&self, error: &ChatError) {
        warn!(code = %error.code(), "authentication lost: {error}");
        self.scheduler.cancel();
        self.transport.disconnect().await;
        if let Err(e) = self.store.clear_credential() {
            warn!("failed to clear stored credential: {e}");
        }
        self.state.lock().rejection_refreshed = false;
        self.set_auth(AuthState::Unauthenticated);
        let _ = self.events.send(LifecycleEvent::LoginRequired { reason: error.to_string() });
    }

    fn set_auth(&self, next: AuthState) {
        self.change_auth(|_| true, next);
    }

    /// Move to `from -> to` only when currently in `from`. Returns whether
    /// the state changed.
    fn transition(&self, from: AuthState, to: AuthState) -> bool {
        self.change_auth(|current| current == from, to)
    }

    fn change_auth(&self, allowed: impl FnOnce(AuthState) -> bool, next: AuthState) -> bool {
        let prev = {
            let mut st = self.state.lock();
            if st.auth == next || !allowed(st.auth) {
                return false;
            }
            std::mem::replace(&mut st.auth, next)
        };
        debug!(%prev, %next, "auth state changed");
        let _ = self.events.send(LifecycleEvent::AuthStateChanged { prev, next });
        true
    }

    fn enqueue(&self, message: String) {
        let limit = self.config.outbound_queue_limit;
        let dropped = {
            let mut st = self.state.lock();
            st.outbound.push_back(message);
            let mut dropped = Vec::new();
            while st.outbound.len() > limit {
                if let Some(oldest) = st.outbound.pop_front() {
                    dropped.push(oldest);
                }
            }
            dropped
        };
        for message in dropped {
            warn!(limit, "outbound queue full, dropping oldest message");
            let _ = self.events.send(LifecycleEvent::SendDropped { message, reason: "outbound queue full".to_owned() });
        }
    }

    fn emit_utterance(&self, text: &str, session_id: &str) -> Result<(), ChatError> {
        let utterance = UserUttered {
            message: text.to_owned(),
            custom_data: self.custom_data.clone(),
            session_id: session_id.to_owned(),
        };
        let payload = serde_json::to_value(&utterance).map_err(|e| ChatError::Storage(e.to_string()))?;
        self.transport.emit(protocol::USER_UTTERED, &payload)
    }

    fn flush_outbound(&self, session_id: &str) {
        loop {
            let Some(next) = self.state.lock().outbound.pop_front() else { return };
            if self.emit_utterance(&next, session_id).is_err() {
                self.state.lock().outbound.push_front(next);
                return;
            }
        }
    }

    fn start_listener(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.listener.is_some() {
            return;
        }
        let transport_rx = self.transport.subscribe();
        let scheduler_rx = self.scheduler.subscribe();
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let task = tokio::spawn(this.listen(transport_rx, scheduler_rx, cancel.clone()));
        st.listener = Some((cancel, task));
    }

    async fn listen(
        self: Arc<Self>,
        mut transport_rx: broadcast::Receiver<TransportEvent>,
        mut scheduler_rx: broadcast::Receiver<SchedulerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = transport_rx.recv() => match event {
                    Ok(event) => self.on_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!(n, "lifecycle lagged on transport events"),
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                event = scheduler_rx.recv() => match event {
                    Ok(event) => self.on_scheduler_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!(n, "lifecycle lagged on scheduler events"),
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { reconnect } => {
                self.state.lock().rejection_refreshed = false;
                self.transition(AuthState::Disconnected, AuthState::Authenticated);
                self.sessions.end_transport_lifetime();
                if let Err(e) = self.sessions.request_session(&self.transport, None) {
                    warn!(reconnect, code = %e.code(), "session request failed: {e}");
                }
            }
            TransportEvent::Message { event, payload } => self.on_message(&event, payload),
            TransportEvent::Disconnected { auth_rejected: true, will_reconnect, .. } => {
                self.sessions.end_transport_lifetime();
                self.handle_rejection(!will_reconnect).await;
            }
            TransportEvent::ConnectError { auth_rejected: true, will_retry, .. } => {
                self.handle_rejection(!will_retry).await;
            }
            TransportEvent::Disconnected { will_reconnect, .. } => {
                self.sessions.end_transport_lifetime();
                if !will_reconnect {
                    self.transition(AuthState::Authenticated, AuthState::Disconnected);
                }
            }
            TransportEvent::ConnectError { will_retry, .. } => {
                if !will_retry {
                    self.transition(AuthState::Authenticated, AuthState::Disconnected);
                }
            }
        }
    }

    fn on_message(&self, event: &str, payload: Value) {
        match event {
            protocol::SESSION_CONFIRM => {
                let confirm: SessionConfirm = match serde_json::from_value(payload) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("malformed session_confirm: {e}");
                        return;
                    }
                };
                let identity = match self.sessions.on_session_confirmed(&confirm.session_id) {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!(code = %e.code(), "failed to record session: {e}");
                        return;
                    }
                };
                self.transport.set_session_hint(Some(identity.session_id.clone()));
                let _ = self.events.send(LifecycleEvent::SessionStarted(identity.clone()));

                if identity.origin.is_new() {
                    if let Some(ref init) = self.config.init_payload {
                        debug!(session_id = %identity.session_id, "sending init payload");
                        if let Err(e) = self.emit_utterance(init, &identity.session_id) {
                            warn!(code = %e.code(), "init payload not sent: {e}");
                        }
                    }
                }
                self.flush_outbound(&identity.session_id);
            }
            protocol::BOT_UTTERED => match serde_json::from_value::<BotUttered>(payload) {
                Ok(msg) => {
                    let _ = self.events.send(LifecycleEvent::BotUttered(msg));
                }
                Err(e) => debug!("malformed bot_uttered: {e}"),
            },
            _ => {}
        }
    }

    async fn on_scheduler_event(self: &Arc<Self>, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Refreshed(cred) => {
                if let Some(active) = self.sessions.active() {
                    self.sessions.preserve(active.session_id);
                }
                self.transport.rotate_credential(cred, RotationStrategy::Reconnect).await;
            }
            SchedulerEvent::Failed { error, code } => {
                let expired = !self.store.credential().is_some_and(|c| c.is_valid());
                warn!(%code, expired, "scheduled refresh failed: {error}");
                if expired {
                    self.logout(&ChatError::Network(error)).await;
                }
            }
        }
    }

    /// The backend refused the credential: refresh, then let the transport
    /// reconnect with the result (or reconnect explicitly if it will not).
    /// At most one refresh per established link; a second refusal logs out.
    async fn handle_rejection(self: &Arc<Self>, reconnect: bool) {
        let already = std::mem::replace(&mut self.state.lock().rejection_refreshed, true);
        if already {
            warn!("refreshed credential rejected as well, giving up");
            self.logout(&ChatError::CredentialRejected).await;
            return;
        }
        match self.refresh_now(RefreshTrigger::Rejected).await {
            Ok(cred) => {
                self.transport.rotate_credential(cred.clone(), RotationStrategy::InPlace).await;
                self.scheduler.schedule(&cred);
                self.set_auth(AuthState::Authenticated);
                if reconnect {
                    self.transport.connect(cred, self.sessions.hint()).await;
                }
            }
            Err(e) => self.logout(&e).await,
        }
    }
}

/// How [`Lifecycle::refresh_and_restart`] re-established the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRestart {
    /// A session request went out on the live channel.
    Requested,
    /// The channel was down; it is reconnecting and will request a session.
    Reconnecting,
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
