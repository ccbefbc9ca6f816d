// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loopback HTTP listener that receives the OAuth redirect and turns it into
//! a [`PopupMessage`].

use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::PopupMessage;

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// A running callback listener. Dropping it stops the server.
#[derive(Debug)]
pub struct CallbackListener {
    pub addr: SocketAddr,
    pub messages: mpsc::UnboundedReceiver<PopupMessage>,
    shutdown: CancellationToken,
}

impl CallbackListener {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind `bind` and serve `GET /callback?code=&state=` until shut down.
pub async fn spawn_callback_listener(bind: &str) -> anyhow::Result<CallbackListener> {
    let (tx, messages) = mpsc::unbounded_channel();
    let router = Router::new()
        .route("/callback", get(handle_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(tx);

    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let sd = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await {
            tracing::warn!("callback listener error: {e}");
        }
    });
    tracing::info!(%addr, "oauth callback listener started");

    Ok(CallbackListener { addr, messages, shutdown })
}

async fn handle_callback(
    State(tx): State<mpsc::UnboundedSender<PopupMessage>>,
    Query(q): Query<CallbackQuery>,
) -> (StatusCode, Html<&'static str>) {
    if let Some(error) = q.error {
        tracing::warn!(%error, "authorization server returned an error");
        return (StatusCode::BAD_REQUEST, Html("<p>Login failed. You can close this window.</p>"));
    }
    let (Some(code), Some(state)) = (q.code, q.state) else {
        return (StatusCode::BAD_REQUEST, Html("<p>Missing code or state.</p>"));
    };
    let _ = tx.send(PopupMessage::code(code, state));
    (StatusCode::OK, Html("<p>Login complete. You can close this window.</p>"))
}

#[cfg(test)]
#[path = "callback_tests.rs"]
mod tests;
