// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chatwire::config::Config;
use chatwire::lifecycle::{Lifecycle, LifecycleEvent};
use chatwire::oauth::spawn_callback_listener;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);
    chatwire::install_crypto_provider();

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_format.as_str() {
        "json" => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
        }
        _ => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let callback_bind = config.callback_bind.clone();

    let lifecycle = Lifecycle::builder(config).build()?;
    let mut events = lifecycle.subscribe();

    // An unauthenticated mount announces LoginRequired; the loop below answers it.
    lifecycle.mount().await;

    // Spawn signal handler
    {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM"),
            }
            sd.cancel();
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(LifecycleEvent::BotUttered(msg)) => {
                    if let Some(text) = msg.text {
                        println!("bot> {text}");
                    }
                }
                Ok(LifecycleEvent::SessionStarted(identity)) => {
                    println!("-- session {} ({})", identity.session_id, identity.origin);
                }
                Ok(LifecycleEvent::SendDropped { message, reason }) => {
                    println!("-- dropped {message:?}: {reason}");
                }
                Ok(LifecycleEvent::LoginRequired { reason }) => {
                    if lifecycle.needs_login() {
                        println!("-- login required: {reason}");
                        login(&lifecycle, &callback_bind).await?;
                    } else {
                        debug!(%reason, "login already handled");
                    }
                }
                Ok(LifecycleEvent::AuthStateChanged { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => warn!(n, "event stream lagged"),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                None => break,
                Some(line) => match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/refresh" => match lifecycle.refresh_and_restart().await {
                        Ok(restart) => info!(?restart, "session restarted"),
                        Err(e) => warn!(code = %e.code(), "restart failed: {e}"),
                    },
                    text => {
                        lifecycle.send_message(text);
                    }
                },
            },
        }
    }

    lifecycle.unmount().await;
    Ok(())
}

/// Run the interactive login through a loopback redirect listener.
async fn login(lifecycle: &Arc<Lifecycle>, bind: &str) -> anyhow::Result<()> {
    let Some(url) = lifecycle.begin_login() else {
        anyhow::bail!("not logged in and no authorization endpoint configured");
    };
    let mut listener = spawn_callback_listener(bind).await?;
    println!("Open this URL to log in:\n  {url}");

    while let Some(message) = listener.messages.recv().await {
        match lifecycle.complete_login(&message).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => warn!(code = %e.code(), "login attempt failed: {e}"),
        }
    }
    anyhow::bail!("callback listener stopped before login completed")
}
