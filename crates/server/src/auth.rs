// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token validation and in-place token rotation.
//!
//! The identity provider is external; the server only checks presented
//! tokens against its accepted set. Rotation pushes `token:refresh` to
//! connected clients and keeps the previous token valid for one grace
//! period so in-flight reconnects don't race the swap.

use axum::http::HeaderMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Token comparison that always walks the full length, so response timing
/// does not reveal how long a matching prefix was.
fn tokens_match(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |diff, (p, e)| diff | (p ^ e))
        == 0
}

/// Accepted bearer tokens. `None` current token disables auth entirely.
pub struct TokenState {
    current: RwLock<Option<String>>,
    previous: RwLock<Option<String>>,
}

impl TokenState {
    pub fn new(token: Option<String>) -> Self {
        Self { current: RwLock::new(token), previous: RwLock::new(None) }
    }

    /// Whether authentication is enabled at all.
    pub async fn enabled(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Validate a presented token against the accepted set.
    pub async fn validate(&self, presented: &str) -> bool {
        let current = self.current.read().await;
        let Some(ref tok) = *current else {
            return true;
        };
        if tokens_match(presented, tok) {
            return true;
        }
        match *self.previous.read().await {
            Some(ref prev) => tokens_match(presented, prev),
            None => false,
        }
    }

    /// Install a fresh token, retaining the old one for the grace window.
    /// Returns the new token.
    pub async fn rotate(&self) -> String {
        let fresh = Uuid::new_v4().simple().to_string();
        let mut current = self.current.write().await;
        *self.previous.write().await = current.take();
        *current = Some(fresh.clone());
        fresh
    }

    /// Drop the grace-window token after rotation settles.
    pub async fn expire_previous(&self) {
        *self.previous.write().await = None;
    }
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
