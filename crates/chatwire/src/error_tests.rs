// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[yare::parameterized(
    no_refresh_token = { ChatError::NoRefreshToken, ErrorCode::NoRefreshToken },
    network = { ChatError::Network("refused".to_owned()), ErrorCode::NetworkError },
    missing_access_token = { ChatError::MissingAccessToken, ErrorCode::MissingAccessToken },
    credential_rejected = { ChatError::CredentialRejected, ErrorCode::CredentialRejected },
    not_connected = { ChatError::NotConnected, ErrorCode::NotConnected },
    state_mismatch = { ChatError::StateMismatch, ErrorCode::StateMismatch },
    storage = { ChatError::Storage("disk full".to_owned()), ErrorCode::Storage },
)]
fn error_maps_to_code(error: ChatError, expected: ErrorCode) {
    assert_eq!(error.code(), expected);
}

#[test]
fn session_conflict_message_names_both_ids() {
    let err = ChatError::SessionIdConflict { preserved: "xyz".to_owned(), stored: "abc".to_owned() };
    assert_eq!(err.code(), ErrorCode::SessionIdConflict);
    let msg = err.to_string();
    assert!(msg.contains("xyz"));
    assert!(msg.contains("abc"));
}

#[test]
fn network_errors_are_not_auth_failures() {
    assert!(!ErrorCode::NetworkError.is_auth_failure());
    assert!(!ErrorCode::NotConnected.is_auth_failure());
    assert!(ErrorCode::NoRefreshToken.is_auth_failure());
    assert!(ErrorCode::MissingAccessToken.is_auth_failure());
    assert!(ErrorCode::CredentialRejected.is_auth_failure());
}

#[test]
fn display_matches_as_str() {
    assert_eq!(ErrorCode::NotConnected.to_string(), "NOT_CONNECTED");
    assert_eq!(ErrorCode::SessionIdConflict.to_string(), "SESSION_ID_CONFLICT");
}
