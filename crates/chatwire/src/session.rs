// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conversation session id reconciliation.
//!
//! Precedence when the server confirms a session: an explicitly preserved id
//! (carried across a credential-rotation reconnect), then the id in durable
//! storage, then the id the server just issued.

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ChatError, ErrorCode};
use crate::protocol::{self, SessionRequest};
use crate::store::TokenStore;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// The server-issued id was adopted; send the init payload.
    New,
    /// A stored id from an earlier run was resumed.
    Continued,
    /// An id carried across a deliberate reconnect was reused.
    Preserved,
}

impl SessionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Continued => "continued",
            Self::Preserved => "preserved",
        }
    }

    /// Whether downstream should send the init payload.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New)
    }
}

impl std::fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub origin: SessionOrigin,
}

#[derive(Debug, Default)]
struct SessionState {
    active: Option<SessionIdentity>,
    preserved: Option<String>,
}

#[derive(Debug)]
pub struct SessionCoordinator {
    store: TokenStore,
    custom_data: Value,
    state: Mutex<SessionState>,
}

impl SessionCoordinator {
    pub fn new(store: TokenStore, custom_data: Value) -> Self {
        Self { store, custom_data, state: Mutex::new(SessionState::default()) }
    }

    /// Carry `session_id` across the next reconnect.
    pub fn preserve(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        debug!(session_id = %session_id, "session id preserved for reconnect");
        self.state.lock().preserved = Some(session_id);
    }

    pub fn preserved_id(&self) -> Option<String> {
        self.state.lock().preserved.clone()
    }

    pub fn active(&self) -> Option<SessionIdentity> {
        self.state.lock().active.clone()
    }

    /// The id the next handshake should announce.
    pub fn hint(&self) -> Option<String> {
        self.preserved_id().or_else(|| self.store.session_id())
    }

    /// Ask the server for a session. Returns without waiting for the confirm.
    pub fn request_session(&self, transport: &Transport, preserved_id: Option<String>) -> Result<(), ChatError> {
        if let Some(id) = preserved_id {
            self.preserve(id);
        }
        let request = SessionRequest { session_id: self.hint(), custom_data: self.custom_data.clone() };
        debug!(session_id = ?request.session_id, "requesting session");
        let payload = serde_json::to_value(&request).map_err(|e| ChatError::Storage(e.to_string()))?;
        transport.emit(protocol::SESSION_REQUEST, &payload)
    }

    /// Reconcile the server's confirmation with what we already know.
    ///
    /// The resolved id is persisted before this returns, and the preserved id
    /// is consumed.
    pub fn on_session_confirmed(&self, server_id: &str) -> Result<SessionIdentity, ChatError> {
        let stored = self.store.session_id();
        let preserved = self.state.lock().preserved.clone();

        if let (Some(p), Some(s)) = (&preserved, &stored) {
            if p != s {
                let conflict = ChatError::SessionIdConflict { preserved: p.clone(), stored: s.clone() };
                warn!(code = %ErrorCode::SessionIdConflict, "{conflict}");
            }
        }

        let identity = match (preserved, stored) {
            (Some(id), _) => SessionIdentity { session_id: id, origin: SessionOrigin::Preserved },
            (None, Some(id)) => SessionIdentity { session_id: id, origin: SessionOrigin::Continued },
            (None, None) => SessionIdentity { session_id: server_id.to_owned(), origin: SessionOrigin::New },
        };

        self.store.set_session_id(&identity.session_id)?;
        {
            let mut state = self.state.lock();
            state.preserved = None;
            state.active = Some(identity.clone());
        }
        info!(
            session_id = %identity.session_id,
            server_id,
            origin = %identity.origin,
            "session confirmed"
        );
        Ok(identity)
    }

    /// Forget the current session so the next request starts a new one.
    pub fn reset(&self) -> Result<(), ChatError> {
        {
            let mut state = self.state.lock();
            state.active = None;
            state.preserved = None;
        }
        self.store.clear_session_id()?;
        info!("session reset");
        Ok(())
    }

    /// The transport lifetime ended; the next confirm makes a new active id.
    pub fn end_transport_lifetime(&self) {
        self.state.lock().active = None;
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
