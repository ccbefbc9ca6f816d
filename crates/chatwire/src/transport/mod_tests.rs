// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;

use super::*;
use crate::test_support::{mint_token_with_claims, next_matching, wait_for, MemoryConnector};
use crate::token::epoch_secs;

fn config() -> TransportConfig {
    TransportConfig {
        url: "ws://chat.test/ws".to_owned(),
        page_url: "https://shop.test/help".to_owned(),
        settle_delay: Duration::from_millis(20),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(40),
        reconnect_attempts: 3,
        open_timeout: Duration::from_secs(2),
    }
}

fn credential(label: &str) -> Credential {
    let token = mint_token_with_claims(&json!({ "sub": label, "exp": epoch_secs() + 600 }));
    Credential::new(token, Some(format!("refresh-{label}"))).unwrap_or_else(|| unreachable!("token has exp"))
}

fn transport(connector: &Arc<MemoryConnector>) -> Arc<Transport> {
    TransportBuilder::new(config()).connector(Arc::clone(connector) as Arc<dyn Connector>).build()
}

#[tokio::test]
async fn emit_while_disconnected_is_not_queued() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);

    let result = transport.emit("user_uttered", &json!({ "message": "hi" }));
    assert!(matches!(result, Err(ChatError::NotConnected)));
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    // Connecting afterwards must not flush anything sent earlier.
    transport.connect(credential("a"), None).await;
    let mut peer = connector.accept().await?;
    peer.expect("auth").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(peer.try_frame().is_none());
    Ok(())
}

#[tokio::test]
async fn connect_attaches_credential_to_handshake_and_auth_frame() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    let mut events = transport.subscribe();
    let cred = credential("a");

    let state = transport.connect(cred.clone(), Some("sess-9".to_owned())).await;
    assert_eq!(state, ConnectionState::Connected);

    let mut peer = connector.accept().await?;
    assert_eq!(peer.bearer(), Some(cred.access_token()));
    assert_eq!(peer.handshake.header(PAGE_URL_HEADER), Some("https://shop.test/help"));

    let auth = peer.expect("auth").await?;
    assert_eq!(auth["token"], cred.access_token());
    assert_eq!(auth["session_id"], "sess-9");

    let reconnect = next_matching(&mut events, |e| match e {
        TransportEvent::Connected { reconnect } => Some(*reconnect),
        _ => None,
    })
    .await?;
    assert!(!reconnect);
    Ok(())
}

#[tokio::test]
async fn second_connect_is_ignored_while_connected() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    transport.connect(credential("a"), None).await;
    let _peer = connector.accept().await?;

    let state = transport.connect(credential("b"), None).await;
    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(connector.open_count(), 1);
    Ok(())
}

#[tokio::test]
async fn inbound_frames_reach_handlers_and_subscribers() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let seen = Arc::new(AtomicU32::new(0));
    let transport = TransportBuilder::new(config())
        .connector(Arc::clone(&connector) as Arc<dyn Connector>)
        .on("bot_uttered", {
            let seen = Arc::clone(&seen);
            move |payload| {
                if payload["text"] == "hello" {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .build();
    let mut events = transport.subscribe();

    transport.connect(credential("a"), None).await;
    let peer = connector.accept().await?;
    peer.send("bot_uttered", json!({ "text": "hello" }));

    let payload = next_matching(&mut events, |e| match e {
        TransportEvent::Message { event, payload } if event == "bot_uttered" => Some(payload.clone()),
        _ => None,
    })
    .await?;
    assert_eq!(payload["text"], "hello");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn failed_connect_reports_and_does_not_retry() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    connector.reject_next(OpenError::Rejected { status: 401 });
    let errors = Arc::new(AtomicU32::new(0));
    let transport = TransportBuilder::new(config())
        .connector(Arc::clone(&connector) as Arc<dyn Connector>)
        .on_error({
            let errors = Arc::clone(&errors);
            move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    let mut events = transport.subscribe();

    let state = transport.connect(credential("a"), None).await;
    assert_eq!(state, ConnectionState::Disconnected);

    let (auth_rejected, will_retry) = next_matching(&mut events, |e| match e {
        TransportEvent::ConnectError { auth_rejected, will_retry, .. } => Some((*auth_rejected, *will_retry)),
        _ => None,
    })
    .await?;
    assert!(auth_rejected);
    assert!(!will_retry);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.open_count(), 1);
    Ok(())
}

#[tokio::test]
async fn in_place_rotation_keeps_the_link() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    transport.connect(credential("a"), None).await;
    let mut peer = connector.accept().await?;
    peer.expect("auth").await?;

    let fresh = credential("b");
    transport.rotate_credential(fresh.clone(), RotationStrategy::InPlace).await;

    // The live link is re-authenticated without a reconnect.
    assert_eq!(peer.expect("auth").await?["token"], fresh.access_token());
    assert!(!peer.is_closed());
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.credential(), Some(fresh.clone()));

    // The next automatic reconnect presents the patched credential.
    peer.close(None, "going away");
    let next = connector.accept().await?;
    assert_eq!(next.bearer(), Some(fresh.access_token()));
    Ok(())
}

#[tokio::test]
async fn full_rotation_tears_down_before_reopening() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    let mut events = transport.subscribe();
    transport.connect(credential("a"), None).await;
    let old = connector.accept().await?;

    let fresh = credential("b");
    transport.rotate_credential(fresh.clone(), RotationStrategy::Reconnect).await;

    assert!(old.is_closed());
    let mut new = connector.accept().await?;
    assert_eq!(new.bearer(), Some(fresh.access_token()));
    assert_eq!(new.expect("auth").await?["token"], fresh.access_token());
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(connector.open_count(), 2);

    let will_reconnect = next_matching(&mut events, |e| match e {
        TransportEvent::Disconnected { will_reconnect, .. } => Some(*will_reconnect),
        _ => None,
    })
    .await?;
    assert!(will_reconnect);
    let reconnect = next_matching(&mut events, |e| match e {
        TransportEvent::Connected { reconnect } => Some(*reconnect),
        _ => None,
    })
    .await?;
    assert!(reconnect);
    Ok(())
}

#[tokio::test]
async fn swap_during_reconnect_is_applied_afterwards() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    transport.connect(credential("a"), None).await;
    let _first = connector.accept().await?;

    let rotating = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.rotate_credential(credential("b"), RotationStrategy::Reconnect).await })
    };
    assert!(wait_for(|| transport.state() != ConnectionState::Connected).await);

    let last = credential("c");
    transport.rotate_credential(last.clone(), RotationStrategy::Reconnect).await;
    assert!(transport.has_pending_swap());

    rotating.await?;
    assert!(!transport.has_pending_swap());
    assert_eq!(transport.credential(), Some(last.clone()));

    let second = connector.accept().await?;
    let third = connector.accept().await?;
    assert!(second.is_closed());
    assert_eq!(third.bearer(), Some(last.access_token()));
    Ok(())
}

#[tokio::test]
async fn connect_during_rotation_settle_is_refused() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = TransportBuilder::new(TransportConfig { settle_delay: Duration::from_millis(150), ..config() })
        .connector(Arc::clone(&connector) as Arc<dyn Connector>)
        .build();
    transport.connect(credential("a"), None).await;
    let first = connector.accept().await?;

    let fresh = credential("b");
    let rotating = {
        let transport = Arc::clone(&transport);
        let fresh = fresh.clone();
        tokio::spawn(async move { transport.rotate_credential(fresh, RotationStrategy::Reconnect).await })
    };
    assert!(wait_for(|| first.is_closed()).await);
    assert!(transport.is_rotating());

    let state = transport.connect(credential("c"), None).await;
    assert_ne!(state, ConnectionState::Connected);
    assert_eq!(connector.open_count(), 1);

    rotating.await?;
    let second = connector.accept().await?;
    assert_eq!(second.bearer(), Some(fresh.access_token()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.open_count(), 2);
    assert!(!second.is_closed());
    assert!(!transport.is_rotating());
    Ok(())
}

#[tokio::test]
async fn stalled_handshake_times_out() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    connector.stall_next();
    let transport = TransportBuilder::new(TransportConfig { open_timeout: Duration::from_millis(50), ..config() })
        .connector(Arc::clone(&connector) as Arc<dyn Connector>)
        .build();
    let mut events = transport.subscribe();

    let state = tokio::time::timeout(Duration::from_secs(1), transport.connect(credential("a"), None)).await?;
    assert_eq!(state, ConnectionState::Disconnected);
    let (auth_rejected, will_retry) = next_matching(&mut events, |e| match e {
        TransportEvent::ConnectError { auth_rejected, will_retry, .. } => Some((*auth_rejected, *will_retry)),
        _ => None,
    })
    .await?;
    assert!(!auth_rejected);
    assert!(!will_retry);

    // The guard is released, so the next attempt goes through.
    transport.connect(credential("b"), None).await;
    let _peer = connector.accept().await?;
    assert!(transport.is_connected());
    Ok(())
}

#[tokio::test]
async fn peer_close_triggers_backoff_reconnect() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    let mut events = transport.subscribe();
    transport.connect(credential("a"), None).await;
    let peer = connector.accept().await?;

    peer.close(Some(1011), "server restart");
    let (auth_rejected, will_reconnect) = next_matching(&mut events, |e| match e {
        TransportEvent::Disconnected { auth_rejected, will_reconnect, .. } => Some((*auth_rejected, *will_reconnect)),
        _ => None,
    })
    .await?;
    assert!(!auth_rejected);
    assert!(will_reconnect);

    let _next = connector.accept().await?;
    assert!(wait_for(|| transport.is_connected()).await);
    Ok(())
}

#[tokio::test]
async fn auth_rejection_parks_reconnect_until_rotation() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    let mut events = transport.subscribe();
    transport.connect(credential("a"), None).await;
    let peer = connector.accept().await?;

    peer.close(Some(link::CLOSE_UNAUTHORIZED), "token expired");
    let auth_rejected = next_matching(&mut events, |e| match e {
        TransportEvent::Disconnected { auth_rejected, .. } => Some(*auth_rejected),
        _ => None,
    })
    .await?;
    assert!(auth_rejected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.open_count(), 1, "must not retry with the rejected credential");

    let fresh = credential("b");
    transport.rotate_credential(fresh.clone(), RotationStrategy::InPlace).await;
    let next = connector.accept().await?;
    assert_eq!(next.bearer(), Some(fresh.access_token()));
    Ok(())
}

#[tokio::test]
async fn reconnect_gives_up_after_bounded_attempts() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    let mut events = transport.subscribe();
    transport.connect(credential("a"), None).await;
    let peer = connector.accept().await?;

    for _ in 0..3 {
        connector.reject_next(OpenError::Failed("refused".to_owned()));
    }
    peer.close(None, "");

    let will_retry = next_matching(&mut events, |e| match e {
        TransportEvent::ConnectError { will_retry: false, .. } => Some(false),
        _ => None,
    })
    .await?;
    assert!(!will_retry);
    assert!(wait_for(|| transport.state() == ConnectionState::Disconnected).await);
    assert_eq!(connector.open_count(), 4);
    Ok(())
}

#[tokio::test]
async fn disconnect_closes_link_and_stops_reconnection() -> anyhow::Result<()> {
    let connector = MemoryConnector::new();
    let transport = transport(&connector);
    transport.connect(credential("a"), None).await;
    let peer = connector.accept().await?;

    transport.disconnect().await;
    assert!(peer.is_closed());
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.open_count(), 1);

    // Guard is released: a later connect works.
    transport.connect(credential("b"), None).await;
    let _again = connector.accept().await?;
    assert!(transport.is_connected());
    Ok(())
}

#[test]
fn close_info_detects_auth_rejection() {
    assert!(CloseInfo { code: Some(4401), reason: String::new() }.is_auth_rejection());
    assert!(CloseInfo { code: Some(1008), reason: "Unauthorized".to_owned() }.is_auth_rejection());
    assert!(!CloseInfo { code: Some(1000), reason: "bye".to_owned() }.is_auth_rejection());
    assert!(OpenError::Rejected { status: 403 }.is_auth_rejection());
    assert!(!OpenError::Rejected { status: 500 }.is_auth_rejection());
}
