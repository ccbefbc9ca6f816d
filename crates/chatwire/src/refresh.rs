// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token endpoint exchanges.
//!
//! Every path that needs a fresh credential (startup, timer, reconnect after
//! rejection, manual restart) goes through [`TokenRefresher::refresh`].

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ChatError;
use crate::store::TokenStore;
use crate::token::Credential;

/// Token endpoint response body.
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Exchanges refresh tokens and authorization codes for credentials and
/// persists the result.
pub struct TokenRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    redirect_uri: String,
    store: TokenStore,
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher").field("token_url", &self.token_url).finish_non_exhaustive()
    }
}

impl TokenRefresher {
    pub fn new(config: &Config, store: TokenStore) -> Result<Self, ChatError> {
        crate::install_crypto_provider();
        let http = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            store,
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Exchange `refresh_token` for a new credential.
    ///
    /// An absent or empty token fails with `NoRefreshToken` before any request
    /// or storage write. When the server does not rotate the refresh token the
    /// one presented here is kept.
    pub async fn refresh(&self, refresh_token: Option<&str>) -> Result<Credential, ChatError> {
        let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) else {
            return Err(ChatError::NoRefreshToken);
        };

        let resp = self
            .post(&[
                ("grant_type", "refresh_token"),
                ("client_id", &self.client_id),
                ("refresh_token", refresh_token),
            ])
            .await?;

        let cred = credential_from(resp, Some(refresh_token))?;
        self.store.save_credential(&cred)?;
        info!(expires_in = cred.expires_in_secs(), "access token refreshed");
        Ok(cred)
    }

    /// [`refresh`](Self::refresh) with whatever refresh token is stored right now.
    pub async fn refresh_stored(&self) -> Result<Credential, ChatError> {
        let refresh_token = self.store.refresh_token();
        self.refresh(refresh_token.as_deref()).await
    }

    /// Exchange an authorization code from the login redirect.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str, state: &str) -> Result<Credential, ChatError> {
        let resp = self
            .post(&[
                ("grant_type", "authorization_code"),
                ("client_id", &self.client_id),
                ("code", code),
                ("redirect_uri", &self.redirect_uri),
                ("code_verifier", code_verifier),
                ("state", state),
            ])
            .await?;

        let cred = credential_from(resp, None)?;
        self.store.save_credential(&cred)?;
        info!(expires_in = cred.expires_in_secs(), "authorization code exchanged");
        Ok(cred)
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ChatError> {
        let resp = self.http.post(&self.token_url).form(form).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, "token endpoint rejected request");
            return Err(ChatError::Network(format!("token endpoint returned {status}: {text}")));
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            debug!("unparseable token response: {e}");
            ChatError::MissingAccessToken
        })
    }
}

fn credential_from(resp: TokenResponse, previous_refresh: Option<&str>) -> Result<Credential, ChatError> {
    let access = resp.id_token.filter(|t| !t.is_empty()).ok_or(ChatError::MissingAccessToken)?;
    let refresh = resp.refresh_token.filter(|t| !t.is_empty()).or_else(|| previous_refresh.map(str::to_owned));
    Credential::new(access, refresh).ok_or(ChatError::MissingAccessToken)
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
