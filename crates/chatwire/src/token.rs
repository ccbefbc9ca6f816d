// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Access token inspection and the [`Credential`] value type.
//!
//! Tokens are compact JWTs. Only the payload's `exp` claim is read; the
//! signature is the backend's business. Every decode failure is treated as
//! an invalid token rather than an error.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

/// Current time as epoch seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Current time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Absolute expiry (epoch seconds) from the token's `exp` claim.
///
/// Returns `None` for anything that is not a three-segment token with a
/// JSON object payload carrying a non-negative numeric `exp`.
pub fn expiration_time(token: &str) -> Option<u64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }

    let trimmed = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD.decode(trimmed).or_else(|_| STANDARD_NO_PAD.decode(trimmed)).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.as_object()?.get("exp")?;

    exp.as_u64().or_else(|| {
        exp.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f.floor() as u64)
    })
}

/// Whether the token carries an `exp` claim that is still in the future.
pub fn is_valid(token: &str) -> bool {
    is_valid_at(token, epoch_secs())
}

/// [`is_valid`] against an explicit clock.
pub fn is_valid_at(token: &str, now: u64) -> bool {
    expiration_time(token).is_some_and(|exp| exp > now)
}

/// An access/refresh token pair with the expiry derived from the access token.
///
/// Immutable: a refresh produces a new `Credential` rather than editing one.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: u64,
}

impl Credential {
    /// Build a credential, or `None` when the access token has no decodable expiry.
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Option<Self> {
        let access_token = access_token.into();
        let expires_at = expiration_time(&access_token)?;
        let refresh_token = refresh_token.filter(|t| !t.is_empty());
        Some(Self { access_token, refresh_token, expires_at })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Expiry as epoch seconds, taken from the access token's `exp` claim.
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(epoch_secs())
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Seconds until expiry, zero once expired.
    pub fn expires_in_secs(&self) -> u64 {
        self.expires_at.saturating_sub(epoch_secs())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
