// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes shared by every component and surfaced in logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoRefreshToken,
    NetworkError,
    MissingAccessToken,
    CredentialRejected,
    NotConnected,
    StateMismatch,
    SessionIdConflict,
    Storage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRefreshToken => "NO_REFRESH_TOKEN",
            Self::NetworkError => "NETWORK_ERROR",
            Self::MissingAccessToken => "MISSING_ACCESS_TOKEN",
            Self::CredentialRejected => "CREDENTIAL_REJECTED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::StateMismatch => "STATE_MISMATCH",
            Self::SessionIdConflict => "SESSION_ID_CONFLICT",
            Self::Storage => "STORAGE",
        }
    }

    /// Whether the error means the credential chain is unusable and the
    /// user has to log in again.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::MissingAccessToken | Self::CredentialRejected | Self::StateMismatch)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the lifecycle components.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("network error: {0}")]
    Network(String),
    #[error("token response is missing a usable access token")]
    MissingAccessToken,
    #[error("backend rejected a freshly refreshed credential")]
    CredentialRejected,
    #[error("transport is not connected")]
    NotConnected,
    #[error("oauth state mismatch")]
    StateMismatch,
    #[error("session id conflict: preserved {preserved}, stored {stored}")]
    SessionIdConflict { preserved: String, stored: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoRefreshToken => ErrorCode::NoRefreshToken,
            Self::Network(_) => ErrorCode::NetworkError,
            Self::MissingAccessToken => ErrorCode::MissingAccessToken,
            Self::CredentialRejected => ErrorCode::CredentialRejected,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::StateMismatch => ErrorCode::StateMismatch,
            Self::SessionIdConflict { .. } => ErrorCode::SessionIdConflict,
            Self::Storage(_) => ErrorCode::Storage,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
