// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket connector built on tokio-tungstenite.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::link::{CloseInfo, Connector, Handshake, Link, LinkEvent, OpenError};

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, handshake: Handshake) -> Pin<Box<dyn Future<Output = Result<Link, OpenError>> + Send + '_>> {
        Box::pin(open(handshake))
    }
}

async fn open(handshake: Handshake) -> Result<Link, OpenError> {
    let mut request =
        handshake.url.as_str().into_client_request().map_err(|e| OpenError::Failed(e.to_string()))?;
    for (name, value) in &handshake.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| OpenError::Failed(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| OpenError::Failed(e.to_string()))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| match e {
        tungstenite::Error::Http(resp) => OpenError::Rejected { status: resp.status().as_u16() },
        other => OpenError::Failed(other.to_string()),
    })?;

    let conn_id = uuid::Uuid::new_v4();
    tracing::debug!(%conn_id, url = %handshake.url, "websocket connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let closer = CancellationToken::new();
    let cancel = closer.clone();

    tokio::spawn(async move {
        let (mut write, mut read) = stream.split();
        let close = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let frame = CloseFrame { code: CloseCode::Normal, reason: "client disconnect".into() };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break None;
                }
                text = out_rx.recv() => {
                    let Some(text) = text else { break None };
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        tracing::debug!(%conn_id, err = %e, "websocket write failed");
                        break Some(CloseInfo { code: None, reason: e.to_string() });
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = in_tx.send(LinkEvent::Text(text.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(frame.map_or_else(CloseInfo::default, |f| CloseInfo {
                            code: Some(u16::from(f.code)),
                            reason: f.reason.to_string(),
                        }));
                    }
                    Some(Err(e)) => break Some(CloseInfo { code: None, reason: e.to_string() }),
                    None => break Some(CloseInfo::default()),
                    _ => {} // ping/pong/binary ignored
                },
            }
        };
        if let Some(info) = close {
            tracing::debug!(%conn_id, code = ?info.code, reason = %info.reason, "websocket closed by peer");
            let _ = in_tx.send(LinkEvent::Closed(info));
        }
    });

    Ok(Link { outbound: out_tx, inbound: in_rx, closer })
}
