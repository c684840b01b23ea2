// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-name cache.
//!
//! Modern API keys are scoped to an environment, resolved by asking the
//! upstream auth endpoint. The answer almost never changes, the key space is
//! small, and a thundering herd against the auth endpoint is worse than a
//! moment of contention, so the cache holds its write lock across the remote
//! lookup: for any key there is at most one lookup in flight, and every
//! waiter observes the result of the first one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AuthError;
use crate::types::AuthInfo;
use refinery_otlp::API_KEY_HEADER;

/// Resolves an API key to an environment name. The production
/// implementation probes the upstream auth endpoint; tests substitute
/// counting fakes.
#[async_trait]
pub trait EnvironmentLookup: Send + Sync {
    async fn lookup_environment(&self, api_key: &str) -> Result<String, AuthError>;
}

struct CacheItem {
    value: String,
    expires_at: Instant,
}

/// TTL map from API key to environment name with single-flight lookups.
pub struct EnvironmentCache<L> {
    items: RwLock<HashMap<String, CacheItem>>,
    ttl: Duration,
    lookup: L,
}

impl<L: EnvironmentLookup> EnvironmentCache<L> {
    pub fn new(ttl: Duration, lookup: L) -> Self {
        EnvironmentCache {
            items: RwLock::new(HashMap::new()),
            ttl,
            lookup,
        }
    }

    /// Returns the cached environment name for `key`, performing the remote
    /// lookup on miss or expiry. Empty names are cached like any other
    /// value; lookup errors are returned to the caller and never cached.
    pub async fn get(&self, key: &str) -> Result<String, AuthError> {
        {
            let items = self.items.read().await;
            if let Some(item) = items.get(key) {
                if Instant::now() < item.expires_at {
                    return Ok(item.value.clone());
                }
            }
        }

        // Take the write lock before the lookup so concurrent misses on the
        // same key collapse into a single remote call; the re-check below
        // catches the waiters once the first caller has filled the entry.
        let mut items = self.items.write().await;
        if let Some(item) = items.get(key) {
            if Instant::now() < item.expires_at {
                return Ok(item.value.clone());
            }
        }

        let value = self.lookup.lookup_environment(key).await?;
        items.insert(
            key.to_string(),
            CacheItem {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(value)
    }

    /// Seeds an entry directly, bypassing the lookup. Not part of the
    /// production surface; `get` is the only way entries appear there.
    #[cfg(test)]
    pub(crate) async fn add_item(&self, key: &str, value: &str, ttl: Duration) {
        let mut items = self.items.write().await;
        items.insert(
            key.to_string(),
            CacheItem {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Environment lookup against the upstream auth endpoint.
pub struct AuthClient {
    client: reqwest::Client,
    api_host: String,
}

impl AuthClient {
    pub fn new(client: reqwest::Client, api_host: String) -> Self {
        AuthClient { client, api_host }
    }
}

#[async_trait]
impl EnvironmentLookup for AuthClient {
    async fn lookup_environment(&self, api_key: &str) -> Result<String, AuthError> {
        let url = format!("{}/1/auth", self.api_host.trim_end_matches('/'));
        debug!(endpoint = %url, "resolving environment name for API key");

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::Unauthorized);
        }
        if status.as_u16() > 299 {
            return Err(AuthError::UpstreamStatus(status.as_u16()));
        }

        let info: AuthInfo = response.json().await.map_err(|_| AuthError::Decode)?;
        debug!(environment = %info.environment.name, "resolved environment");
        Ok(info.environment.name)
    }
}
