// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

#[tokio::test]
async fn redirect_becomes_popup_message() -> anyhow::Result<()> {
    crate::install_crypto_provider();
    let mut listener = spawn_callback_listener("127.0.0.1:0").await?;
    let url = format!("http://{}/callback?code=abc&state=s%2F1", listener.addr);

    let resp = reqwest::get(&url).await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let message = tokio::time::timeout(Duration::from_secs(3), listener.messages.recv()).await?;
    assert_eq!(message, Some(PopupMessage::code("abc", "s/1")));
    Ok(())
}

#[yare::parameterized(
    missing_state = { "code=abc" },
    missing_code = { "state=s1" },
    provider_error = { "error=access_denied&state=s1" },
)]
#[test_macro(tokio::test)]
async fn incomplete_redirect_is_rejected(query: &str) {
    crate::install_crypto_provider();
    let Ok(mut listener) = spawn_callback_listener("127.0.0.1:0").await else { unreachable!("listener binds") };
    let url = format!("http://{}/callback?{query}", listener.addr);

    let status = reqwest::get(&url).await.map(|r| r.status()).ok();
    assert_eq!(status, Some(reqwest::StatusCode::BAD_REQUEST));
    assert!(listener.messages.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_stops_accepting() -> anyhow::Result<()> {
    crate::install_crypto_provider();
    let listener = spawn_callback_listener("127.0.0.1:0").await?;
    let addr = listener.addr;
    listener.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = reqwest::get(format!("http://{addr}/callback?code=a&state=b")).await;
    assert!(result.is_err());
    Ok(())
}
