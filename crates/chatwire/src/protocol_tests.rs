// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[test]
fn object_payload_is_flattened_beside_event() -> anyhow::Result<()> {
    let frame = encode(SESSION_REQUEST, &json!({ "session_id": "abc", "customData": {} }));
    let value: Value = serde_json::from_str(&frame)?;
    assert_eq!(value["event"], "session_request");
    assert_eq!(value["session_id"], "abc");
    Ok(())
}

#[test]
fn payload_cannot_override_event_name() -> anyhow::Result<()> {
    let frame = encode(USER_UTTERED, &json!({ "event": "spoofed", "message": "hi" }));
    let value: Value = serde_json::from_str(&frame)?;
    assert_eq!(value["event"], "user_uttered");
    Ok(())
}

#[test]
fn scalar_payload_is_wrapped() -> anyhow::Result<()> {
    let frame = encode("ping", &json!(42));
    let value: Value = serde_json::from_str(&frame)?;
    assert_eq!(value["data"], 42);
    Ok(())
}

#[test]
fn typed_auth_omits_missing_session() -> anyhow::Result<()> {
    let frame = encode_typed(AUTH, &AuthPayload { token: "t".to_owned(), session_id: None });
    let value: Value = serde_json::from_str(&frame)?;
    assert_eq!(value, json!({ "event": "auth", "token": "t" }));
    Ok(())
}

#[test]
fn decode_splits_event_and_payload() {
    let decoded = decode(r#"{"event":"session_confirm","session_id":"abc"}"#);
    let Some((event, payload)) = decoded else {
        unreachable!("frame should decode");
    };
    assert_eq!(event, SESSION_CONFIRM);
    assert_eq!(payload, json!({ "session_id": "abc" }));
}

#[yare::parameterized(
    not_json = { "hello" },
    array = { "[1,2]" },
    missing_event = { r#"{"text":"hi"}"# },
    numeric_event = { r#"{"event":7}"# },
)]
fn decode_rejects_untagged_frames(text: &str) {
    assert!(decode(text).is_none());
}

#[test]
fn bot_uttered_tolerates_missing_fields() -> anyhow::Result<()> {
    let msg: BotUttered = serde_json::from_value(json!({ "text": "hello" }))?;
    assert_eq!(msg.text.as_deref(), Some("hello"));
    assert!(msg.metadata.is_null());
    Ok(())
}
