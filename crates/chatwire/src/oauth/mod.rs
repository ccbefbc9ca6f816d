// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interactive login: PKCE authorization requests and validation of the
//! authorization code handed back by the login window.

pub mod callback;
pub mod pkce;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ChatError, ErrorCode};

pub use callback::{spawn_callback_listener, CallbackListener};
pub use pkce::Pkce;

/// `type` of the message carrying an authorization code.
pub const OAUTH_CODE: &str = "oauth-code";

/// Message posted by the login window back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    #[serde(rename = "popupState")]
    pub popup_state: String,
}

impl PopupMessage {
    pub fn code(code: impl Into<String>, popup_state: impl Into<String>) -> Self {
        Self { kind: OAUTH_CODE.to_owned(), code: code.into(), popup_state: popup_state.into() }
    }
}

/// A pending login: where to send the user and what to expect back.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub pkce: Pkce,
}

impl AuthorizationRequest {
    /// Build a request against `auth_url` with a fresh state and verifier.
    pub fn new(config: &Config, auth_url: &str) -> Self {
        let pkce = Pkce::generate();
        let state = pkce::random_token();
        let url = pkce::AuthUrlParams {
            auth_url,
            client_id: &config.client_id,
            redirect_uri: &config.redirect_uri,
            scope: &config.scope,
            code_challenge: &pkce.challenge,
            state: &state,
        }
        .to_url();
        Self { url, state, pkce }
    }
}

/// Validates login-window messages against the locally generated state and
/// drops repeated deliveries of the same code.
#[derive(Debug)]
pub struct CallbackGuard {
    expected_state: String,
    processed: HashSet<String>,
}

impl CallbackGuard {
    pub fn new(expected_state: impl Into<String>) -> Self {
        Self { expected_state: expected_state.into(), processed: HashSet::new() }
    }

    /// `Ok(true)` when `message` carries a fresh code that should be
    /// exchanged, `Ok(false)` when it should be ignored.
    pub fn check(&mut self, message: &PopupMessage) -> Result<bool, ChatError> {
        if message.kind != OAUTH_CODE {
            debug!(kind = %message.kind, "ignoring unrelated login message");
            return Ok(false);
        }
        if !constant_time_eq(&message.popup_state, &self.expected_state) {
            warn!(code = %ErrorCode::StateMismatch, "login message state does not match");
            return Err(ChatError::StateMismatch);
        }
        if !self.processed.insert(message.code.clone()) {
            debug!("ignoring duplicate authorization code");
            return Ok(false);
        }
        Ok(true)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
