// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Once;

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod oauth;
pub mod protocol;
pub mod refresh;
pub mod schedule;
pub mod session;
pub mod store;
pub mod test_support;
pub mod token;
pub mod transport;

static CRYPTO: Once = Once::new();

/// Install the rustls crypto provider (needed for reqwest even on plain HTTP).
pub fn install_crypto_provider() {
    CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
