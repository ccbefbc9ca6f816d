// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn verifier_length_is_within_rfc_bounds() {
    let pkce = Pkce::generate();
    assert!((43..=128).contains(&pkce.verifier.len()), "verifier length {}", pkce.verifier.len());
    assert_eq!(pkce.challenge, challenge_for(&pkce.verifier));
}

#[test]
fn challenge_matches_rfc_example() {
    // RFC 7636 appendix B.
    let challenge = challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
    assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
}

#[test]
fn random_tokens_differ() {
    assert_ne!(random_token(), random_token());
}

#[test]
fn auth_url_encodes_every_parameter() {
    let url = AuthUrlParams {
        auth_url: "https://id.test/authorize",
        client_id: "widget",
        redirect_uri: "http://127.0.0.1:8765/callback",
        scope: "openid offline_access",
        code_challenge: "chal",
        state: "st/ate",
    }
    .to_url();
    assert!(url.starts_with("https://id.test/authorize?response_type=code&"));
    assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A8765%2Fcallback"));
    assert!(url.contains("scope=openid+offline_access"));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.ends_with("state=st%2Fate"));
}

#[test]
fn auth_url_appends_to_existing_query() {
    let url = AuthUrlParams {
        auth_url: "https://id.test/authorize?tenant=a",
        client_id: "c",
        redirect_uri: "r",
        scope: "s",
        code_challenge: "x",
        state: "y",
    }
    .to_url();
    assert!(url.starts_with("https://id.test/authorize?tenant=a&response_type=code"));
}
