// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire messages exchanged over the real-time channel.
//!
//! Every frame is a JSON text frame whose `event` field names the message.
//! Payload fields sit beside `event` at the top level.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AUTH: &str = "auth";
pub const SESSION_REQUEST: &str = "session_request";
pub const SESSION_CONFIRM: &str = "session_confirm";
pub const USER_UTTERED: &str = "user_uttered";
pub const BOT_UTTERED: &str = "bot_uttered";

/// First frame after the upgrade, carrying the credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "customData", default)]
    pub custom_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfirm {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserUttered {
    pub message: String,
    #[serde(rename = "customData", default)]
    pub custom_data: Value,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotUttered {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Encode a frame. Object payloads are flattened beside `event`; anything
/// else is carried under `data`.
pub fn encode(event: &str, payload: &Value) -> String {
    let mut frame = serde_json::Map::new();
    frame.insert("event".to_owned(), Value::String(event.to_owned()));
    match payload {
        Value::Object(fields) => {
            for (k, v) in fields {
                if k != "event" {
                    frame.insert(k.clone(), v.clone());
                }
            }
        }
        Value::Null => {}
        other => {
            frame.insert("data".to_owned(), other.clone());
        }
    }
    Value::Object(frame).to_string()
}

/// Encode a typed payload.
pub fn encode_typed<T: Serialize>(event: &str, payload: &T) -> String {
    let value = serde_json::to_value(payload).unwrap_or(Value::Null);
    encode(event, &value)
}

/// Split a frame into its event name and the remaining payload.
///
/// Returns `None` for frames that are not JSON objects with a string `event`.
pub fn decode(text: &str) -> Option<(String, Value)> {
    let Value::Object(mut fields) = serde_json::from_str::<Value>(text).ok()? else {
        return None;
    };
    let event = match fields.remove("event")? {
        Value::String(s) => s,
        _ => return None,
    };
    Some((event, Value::Object(fields)))
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
