// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Where tokens and the session id live between runs.
///
/// - `Persistent`: JSON file under the state directory, survives restarts.
/// - `Session`: in-memory only, gone when the process exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Persistent,
    Session,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistent => f.write_str("persistent"),
            Self::Session => f.write_str("session"),
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "persistent" | "local" => Ok(Self::Persistent),
            "session" | "memory" => Ok(Self::Session),
            other => anyhow::bail!("invalid storage kind: {other}"),
        }
    }
}

/// Headless chat client for a conversational backend with OAuth sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "chatwire", version, about)]
pub struct Config {
    /// WebSocket URL of the chat backend.
    #[arg(long, env = "CHATWIRE_SOCKET_URL")]
    pub socket_url: String,

    /// OAuth token endpoint.
    #[arg(long, env = "CHATWIRE_TOKEN_URL")]
    pub token_url: String,

    /// OAuth authorization endpoint. Required for interactive login.
    #[arg(long, env = "CHATWIRE_AUTH_URL")]
    pub auth_url: Option<String>,

    /// OAuth client id.
    #[arg(long, env = "CHATWIRE_CLIENT_ID")]
    pub client_id: String,

    /// Redirect URI registered for the client (served by the loopback listener).
    #[arg(long, env = "CHATWIRE_REDIRECT_URI", default_value = "http://127.0.0.1:8765/callback")]
    pub redirect_uri: String,

    /// OAuth scopes requested at login.
    #[arg(long, env = "CHATWIRE_SCOPE", default_value = "openid profile offline_access")]
    pub scope: String,

    /// Address the OAuth loopback listener binds to.
    #[arg(long, env = "CHATWIRE_CALLBACK_BIND", default_value = "127.0.0.1:8765")]
    pub callback_bind: String,

    /// Page URL reported to the backend in the handshake.
    #[arg(long, env = "CHATWIRE_PAGE_URL", default_value = "chatwire://terminal")]
    pub page_url: String,

    /// Token storage backend: persistent or session.
    #[arg(long, env = "CHATWIRE_STORAGE", default_value_t = StorageKind::Persistent)]
    pub storage: StorageKind,

    /// Override the persistent storage file.
    #[arg(long, env = "CHATWIRE_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Message sent when the backend starts a new session.
    #[arg(long, env = "CHATWIRE_INIT_PAYLOAD")]
    pub init_payload: Option<String>,

    /// JSON object attached to session requests and utterances as `customData`.
    #[arg(long, env = "CHATWIRE_CUSTOM_DATA")]
    pub custom_data: Option<String>,

    /// Seconds before expiry at which the proactive refresh fires.
    #[arg(long, env = "CHATWIRE_REFRESH_MARGIN_SECS", default_value_t = 60)]
    pub refresh_margin_secs: u64,

    /// Lower bound on the proactive refresh delay in milliseconds.
    #[arg(long, env = "CHATWIRE_MIN_REFRESH_DELAY_MS", default_value_t = 1000)]
    pub min_refresh_delay_ms: u64,

    /// Pause between tearing down and reopening the connection, in milliseconds.
    #[arg(long, env = "CHATWIRE_SETTLE_DELAY_MS", default_value_t = 100)]
    pub settle_delay_ms: u64,

    /// Token endpoint request timeout in milliseconds.
    #[arg(long, env = "CHATWIRE_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Initial automatic reconnect backoff in milliseconds.
    #[arg(long, env = "CHATWIRE_RECONNECT_INITIAL_MS", default_value_t = 500)]
    pub reconnect_initial_ms: u64,

    /// Maximum automatic reconnect backoff in milliseconds.
    #[arg(long, env = "CHATWIRE_RECONNECT_MAX_MS", default_value_t = 5_000)]
    pub reconnect_max_ms: u64,

    /// Automatic reconnect attempts before giving up.
    #[arg(long, env = "CHATWIRE_RECONNECT_ATTEMPTS", default_value_t = 10)]
    pub reconnect_attempts: u32,

    /// Outbound messages held while no session is confirmed.
    #[arg(long, env = "CHATWIRE_OUTBOUND_QUEUE_LIMIT", default_value_t = 16)]
    pub outbound_queue_limit: usize,

    /// Log format (json or text).
    #[arg(long, env = "CHATWIRE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CHATWIRE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

macro_rules! duration_ms {
    ($method:ident, $field:ident) => {
        pub fn $method(&self) -> Duration {
            Duration::from_millis(self.$field)
        }
    };
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (flag, url) in [("--socket-url", &self.socket_url), ("--token-url", &self.token_url)] {
            if url.trim().is_empty() {
                anyhow::bail!("{flag} must not be empty");
            }
        }
        if !(self.socket_url.starts_with("ws://") || self.socket_url.starts_with("wss://")) {
            anyhow::bail!("--socket-url must be a ws:// or wss:// URL");
        }
        if self.client_id.trim().is_empty() {
            anyhow::bail!("--client-id must not be empty");
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            anyhow::bail!("--reconnect-initial-ms cannot exceed --reconnect-max-ms");
        }
        self.custom_data_value()?;
        Ok(())
    }

    duration_ms!(min_refresh_delay, min_refresh_delay_ms);
    duration_ms!(settle_delay, settle_delay_ms);
    duration_ms!(request_timeout, request_timeout_ms);
    duration_ms!(reconnect_initial, reconnect_initial_ms);
    duration_ms!(reconnect_max, reconnect_max_ms);

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    /// Parsed `customData`; an empty object when unset.
    pub fn custom_data_value(&self) -> anyhow::Result<serde_json::Value> {
        let Some(ref raw) = self.custom_data else {
            return Ok(serde_json::json!({}));
        };
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--custom-data is not valid JSON: {e}"))?;
        if !value.is_object() {
            anyhow::bail!("--custom-data must be a JSON object");
        }
        Ok(value)
    }

    /// File backing persistent storage.
    pub fn storage_file(&self) -> PathBuf {
        self.storage_path.clone().unwrap_or_else(|| state_dir().join("tokens.json"))
    }

    /// Build a `Config` for tests with fast timings and session storage.
    #[doc(hidden)]
    pub fn test(socket_url: &str, token_url: &str) -> Self {
        Self {
            socket_url: socket_url.to_owned(),
            token_url: token_url.to_owned(),
            auth_url: Some("http://127.0.0.1:1/authorize".to_owned()),
            client_id: "test-client".to_owned(),
            redirect_uri: "http://127.0.0.1:8765/callback".to_owned(),
            scope: "openid".to_owned(),
            callback_bind: "127.0.0.1:0".to_owned(),
            page_url: "chatwire://test".to_owned(),
            storage: StorageKind::Session,
            storage_path: None,
            init_payload: None,
            custom_data: None,
            refresh_margin_secs: 60,
            min_refresh_delay_ms: 20,
            settle_delay_ms: 10,
            request_timeout_ms: 2_000,
            reconnect_initial_ms: 10,
            reconnect_max_ms: 50,
            reconnect_attempts: 5,
            outbound_queue_limit: 4,
            log_format: "text".to_owned(),
            log_level: "debug".to_owned(),
        }
    }
}

/// Resolve the state directory for persisted tokens.
///
/// Checks `CHATWIRE_STATE_DIR`, then `$XDG_STATE_HOME/chatwire`,
/// then `$HOME/.local/state/chatwire`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHATWIRE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("chatwire");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/chatwire");
    }
    PathBuf::from(".chatwire")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
