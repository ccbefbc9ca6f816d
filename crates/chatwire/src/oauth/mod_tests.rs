// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn duplicate_code_is_ignored() -> anyhow::Result<()> {
    let mut guard = CallbackGuard::new("s1");
    let message = PopupMessage::code("code-1", "s1");
    assert!(guard.check(&message)?);
    assert!(!guard.check(&message)?);

    // A different code is still accepted.
    assert!(guard.check(&PopupMessage::code("code-2", "s1"))?);
    Ok(())
}

#[test]
fn state_mismatch_is_rejected() {
    let mut guard = CallbackGuard::new("expected");
    let err = guard.check(&PopupMessage::code("code-1", "forged")).err();
    assert!(matches!(err, Some(ChatError::StateMismatch)));

    // A rejected message does not mark its code as processed.
    assert!(matches!(guard.check(&PopupMessage::code("code-1", "expected")), Ok(true)));
}

#[test]
fn unrelated_messages_are_ignored() -> anyhow::Result<()> {
    let mut guard = CallbackGuard::new("s1");
    let message = PopupMessage { kind: "resize".to_owned(), code: "c".to_owned(), popup_state: "other".to_owned() };
    assert!(!guard.check(&message)?);
    Ok(())
}

#[test]
fn popup_message_uses_wire_field_names() -> anyhow::Result<()> {
    let parsed: PopupMessage =
        serde_json::from_str(r#"{"type":"oauth-code","code":"abc","popupState":"st"}"#)?;
    assert_eq!(parsed, PopupMessage::code("abc", "st"));
    Ok(())
}

#[test]
fn authorization_request_embeds_state_and_challenge() {
    let config = Config::test("ws://127.0.0.1:1/ws", "http://127.0.0.1:1/token");
    let request = AuthorizationRequest::new(&config, "https://id.test/authorize");
    assert!(request.url.contains(&format!("state={}", request.state)));
    assert!(request.url.contains(&format!("code_challenge={}", request.pkce.challenge)));
    assert!(request.url.contains("client_id=test-client"));

    let other = AuthorizationRequest::new(&config, "https://id.test/authorize");
    assert_ne!(request.state, other.state);
    assert_ne!(request.pkce.verifier, other.pkce.verifier);
}

#[yare::parameterized(
    equal = { "abc", "abc", true },
    differ = { "abc", "abd", false },
    length = { "abc", "abcd", false },
    empty = { "", "", true },
)]
fn constant_time_comparison(a: &str, b: &str, expected: bool) {
    assert_eq!(constant_time_eq(a, b), expected);
}
