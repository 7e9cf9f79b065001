// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tenant session handling.
//!
//! The platform authenticates with an API key that is obfuscated against the
//! current timestamp, plus username and password. A successful login sets a
//! `JSESSIONID` cookie which the session's HTTP client replays on every later
//! request.
//!
//! # Key Obfuscation
//!
//! ```text
//! now = epoch millis          n = last 6 digits of now
//! r   = (n >> 1), zero-padded to 6 digits
//! key = key[n0] key[n1] .. key[n5]  key[r0+2] key[r1+2] .. key[r5+2]
//! ```
//!
//! The API key therefore needs at least 12 characters.

use crate::config::{ConnectConfig, TenantConfig};
use crate::error::{ReplicationError, Result};
use crate::gateway::BoxFuture;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Cookie the platform uses to carry the session.
pub const SESSION_COOKIE: &str = "JSESSIONID";

/// Minimum API key length supported by the obfuscation scheme.
pub const MIN_API_KEY_LEN: usize = 12;

/// Obfuscate `api_key` against `now_millis`.
pub fn obfuscate_api_key(api_key: &str, now_millis: u64) -> Result<String> {
    let seed: Vec<char> = api_key.chars().collect();
    if seed.len() < MIN_API_KEY_LEN {
        return Err(ReplicationError::Config(format!(
            "API key must be at least {} characters",
            MIN_API_KEY_LEN
        )));
    }

    let n = now_millis % 1_000_000;
    let high = format!("{:06}", n);
    let low = format!("{:06}", n >> 1);

    let mut key = String::with_capacity(12);
    for digit in high.chars().filter_map(|c| c.to_digit(10)) {
        key.push(seed[digit as usize]);
    }
    for digit in low.chars().filter_map(|c| c.to_digit(10)) {
        key.push(seed[digit as usize + 2]);
    }
    Ok(key)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    api_key: String,
    username: &'a str,
    password: &'a str,
    timestamp: u64,
}

/// An authenticated channel to one tenant.
#[derive(Clone)]
pub struct Session {
    tenant_id: String,
    api_base: String,
    client: reqwest::Client,
    established_at: DateTime<Utc>,
}

impl Session {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Base URL for API calls, ending in `/`.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// HTTP client carrying the session cookie.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Absolute URL for an API path such as `firewallFilteringRules`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tenant_id", &self.tenant_id)
            .field("api_base", &self.api_base)
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Produces an authenticated [`Session`] per tenant.
pub trait SessionProvider: Send + Sync + 'static {
    fn authenticate<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, Session>;
}

/// Cookie-session login over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSessionProvider {
    request_timeout: std::time::Duration,
}

impl HttpSessionProvider {
    pub fn new(config: &ConnectConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
        }
    }

    #[instrument(skip_all, fields(tenant_id = %tenant.tenant_id))]
    async fn login(&self, tenant: &TenantConfig) -> Result<Session> {
        let tenant_id = tenant.tenant_id.as_str();
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ReplicationError::gateway(tenant_id, "authenticate", e))?;

        let now = Utc::now().timestamp_millis().max(0) as u64;
        let body = LoginRequest {
            api_key: obfuscate_api_key(&tenant.api_key, now)?,
            username: &tenant.username,
            password: &tenant.password,
            timestamp: now,
        };

        let api_base = tenant.api_base();
        let url = format!("{}authenticatedSession", api_base);
        debug!(url = %url, "Authenticating");

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReplicationError::gateway(tenant_id, "authenticate", e))?;

        let status = response.status();
        let has_cookie = response.cookies().any(|c| c.name() == SESSION_COOKIE);
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            metrics::record_session(tenant_id, false);
            return Err(ReplicationError::gateway_msg(
                tenant_id,
                "authenticate",
                format!("{}: {}", status, text),
            ));
        }
        if !has_cookie {
            metrics::record_session(tenant_id, false);
            warn!("Login succeeded without a session cookie");
            return Err(ReplicationError::gateway_msg(
                tenant_id,
                "authenticate",
                format!("response did not set {}", SESSION_COOKIE),
            ));
        }

        metrics::record_session(tenant_id, true);
        info!(username = %tenant.username, "Session established");

        Ok(Session {
            tenant_id: tenant_id.to_string(),
            api_base,
            client,
            established_at: Utc::now(),
        })
    }
}

impl SessionProvider for HttpSessionProvider {
    fn authenticate<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, Session> {
        Box::pin(async move { self.login(tenant).await })
    }
}
