// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP implementation of the policy gateway.
//!
//! # Endpoint Map
//!
//! | Operation | Method | Path |
//! |-----------|--------|------|
//! | `list_firewall_rules` | GET | `firewallFilteringRules` |
//! | `create_firewall_rule` | POST | `firewallFilteringRules` |
//! | `activate_pending_changes` | POST | `status/activate` |
//! | `list_network_services` | GET | `networkServices` |
//! | `list_rule_labels` | GET | `ruleLabels` |
//! | `create_rule_label` | POST | `ruleLabels` |
//! | `list_blocked_urls` | GET | `security/advanced` |
//! | `apply_blocked_urls` | PUT | `security/advanced` |
//! | `request_audit_report` | POST | `auditlogEntryReport` |
//! | `poll_audit_report` | GET | `auditlogEntryReport` |
//! | `download_audit_report` | GET | `auditlogEntryReport/download` |
//!
//! The platform reports refused writes as a JSON body with `code` and
//! `message`, sometimes alongside a success status. Both shapes map to
//! [`ReplicationError::RemoteRejected`].

use super::{BoxFuture, PolicyGateway, TenantConnector};
use crate::config::{ConnectConfig, TenantConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{AuditReportStatus, PolicyRule, ReferenceEntity, ReportHandle};
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::session::{HttpSessionProvider, Session, SessionProvider};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

/// Longest response excerpt carried into an error message.
const ERROR_BODY_EXCERPT: usize = 512;

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReportStatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct CreatedEntity {
    id: i64,
}

fn remote_error(body: &str) -> Option<RemoteError> {
    serde_json::from_str::<RemoteError>(body).ok()
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_EXCERPT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Gateway bound to one authenticated session.
#[derive(Debug, Clone)]
pub struct HttpPolicyGateway {
    session: Session,
}

impl HttpPolicyGateway {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.session
            .client()
            .request(method, self.session.url(path))
            .header("cache-control", "no-cache")
    }

    /// Send a request and return the raw body of a successful response.
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<String> {
        let tenant = self.session.tenant_id();
        let started = Instant::now();

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_gateway_request(tenant, operation, false, started.elapsed());
                return Err(ReplicationError::gateway(tenant, operation, e));
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ReplicationError::gateway(tenant, operation, e))?;
        let success = status.is_success();
        metrics::record_gateway_request(tenant, operation, success, started.elapsed());

        if success {
            debug!(tenant_id = %tenant, operation, status = status.as_u16(), "Gateway call succeeded");
            return Ok(body);
        }

        if let Some(err) = remote_error(&body) {
            if status.is_client_error() {
                return Err(ReplicationError::RemoteRejected {
                    tenant: tenant.to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
        }

        Err(ReplicationError::gateway_msg(
            tenant,
            operation,
            format!("{}: {}", status, excerpt(&body)),
        ))
    }

    async fn fetch<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<T> {
        let body = self.send(operation, self.request(Method::GET, path)).await?;
        self.decode(operation, &body)
    }

    fn decode<T: DeserializeOwned>(&self, operation: &str, body: &str) -> Result<T> {
        serde_json::from_str(body).map_err(|e| {
            ReplicationError::gateway_msg(
                self.session.tenant_id(),
                operation,
                format!("unexpected response body: {}", e),
            )
        })
    }

    /// Decode a write response, surfacing an embedded `code`/`message`.
    fn decode_write<T: DeserializeOwned>(&self, operation: &str, body: &str) -> Result<T> {
        if let Some(err) = remote_error(body) {
            return Err(ReplicationError::RemoteRejected {
                tenant: self.session.tenant_id().to_string(),
                code: err.code,
                message: err.message,
            });
        }
        self.decode(operation, body)
    }

    async fn advanced_settings(&self) -> Result<Value> {
        self.fetch("list_blocked_urls", "security/advanced").await
    }
}

impl PolicyGateway for HttpPolicyGateway {
    fn tenant_id(&self) -> &str {
        self.session.tenant_id()
    }

    fn list_firewall_rules(&self) -> BoxFuture<'_, Vec<PolicyRule>> {
        Box::pin(async move {
            self.fetch("list_firewall_rules", "firewallFilteringRules")
                .await
        })
    }

    fn create_firewall_rule<'a>(&'a self, rule: &'a PolicyRule) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let operation = "create_firewall_rule";
            let request = self
                .request(Method::POST, "firewallFilteringRules")
                .json(rule);
            let body = self.send(operation, request).await?;
            let created: CreatedEntity = self.decode_write(operation, &body)?;
            Ok(created.id)
        })
    }

    fn activate_pending_changes(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let body = self
                .send("activate_pending_changes", self.request(Method::POST, "status/activate"))
                .await?;
            if let Some(err) = remote_error(&body) {
                return Err(ReplicationError::RemoteRejected {
                    tenant: self.session.tenant_id().to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
            Ok(())
        })
    }

    fn list_network_services(&self) -> BoxFuture<'_, Vec<ReferenceEntity>> {
        Box::pin(async move { self.fetch("list_network_services", "networkServices").await })
    }

    fn list_rule_labels(&self) -> BoxFuture<'_, Vec<ReferenceEntity>> {
        Box::pin(async move { self.fetch("list_rule_labels", "ruleLabels").await })
    }

    fn create_rule_label<'a>(
        &'a self,
        name: &'a str,
        description: &'a str,
    ) -> BoxFuture<'a, ReferenceEntity> {
        Box::pin(async move {
            let operation = "create_rule_label";
            let request = self
                .request(Method::POST, "ruleLabels")
                .json(&json!({ "name": name, "description": description }));
            let body = self.send(operation, request).await?;
            self.decode_write(operation, &body)
        })
    }

    fn list_blocked_urls(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            let settings = self.advanced_settings().await?;
            let urls = match settings.get("blacklistUrls") {
                Some(value) => serde_json::from_value(value.clone())?,
                None => Vec::new(),
            };
            Ok(urls)
        })
    }

    fn apply_blocked_urls<'a>(&'a self, urls: &'a [String]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // PUT replaces the whole settings object; keep the other fields.
            let mut settings = self.advanced_settings().await?;
            match settings.as_object_mut() {
                Some(map) => {
                    map.insert("blacklistUrls".to_string(), json!(urls));
                }
                None => {
                    warn!(tenant_id = %self.tenant_id(), "Advanced settings were not an object, sending block list only");
                    settings = json!({ "blacklistUrls": urls });
                }
            }
            let request = self.request(Method::PUT, "security/advanced").json(&settings);
            let body = self.send("apply_blocked_urls", request).await?;
            if let Some(err) = remote_error(&body) {
                return Err(ReplicationError::RemoteRejected {
                    tenant: self.session.tenant_id().to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
            Ok(())
        })
    }

    fn request_audit_report<'a>(
        &'a self,
        start_ms: i64,
        end_ms: i64,
        action_types: &'a [String],
    ) -> BoxFuture<'a, ReportHandle> {
        Box::pin(async move {
            let request = self.request(Method::POST, "auditlogEntryReport").json(&json!({
                "startTime": start_ms,
                "endTime": end_ms,
                "actionTypes": action_types,
            }));
            self.send("request_audit_report", request).await?;
            Ok(ReportHandle {
                tenant_id: self.session.tenant_id().to_string(),
                requested_at: end_ms,
            })
        })
    }

    fn poll_audit_report<'a>(&'a self, _handle: &'a ReportHandle) -> BoxFuture<'a, AuditReportStatus> {
        Box::pin(async move {
            // The platform keeps a single report per admin session.
            let body: ReportStatusBody = self
                .fetch("poll_audit_report", "auditlogEntryReport")
                .await?;
            Ok(AuditReportStatus::from_remote(&body.status))
        })
    }

    fn download_audit_report<'a>(&'a self, _handle: &'a ReportHandle) -> BoxFuture<'a, String> {
        Box::pin(async move {
            self.send(
                "download_audit_report",
                self.request(Method::GET, "auditlogEntryReport/download"),
            )
            .await
        })
    }
}

/// Connects to tenants over HTTP, retrying login with backoff.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    provider: HttpSessionProvider,
    retry: RetryConfig,
}

impl HttpConnector {
    pub fn new(config: &ConnectConfig) -> Self {
        Self {
            provider: HttpSessionProvider::new(config),
            retry: RetryConfig::tenant_connect(config.max_attempts),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl TenantConnector for HttpConnector {
    type Gateway = HttpPolicyGateway;

    fn connect<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, HttpPolicyGateway> {
        Box::pin(async move {
            let session = retry_with_backoff(&self.retry, "authenticate", || {
                self.provider.authenticate(tenant)
            })
            .await?;
            Ok(HttpPolicyGateway::new(session))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_parsing() {
        let err = remote_error(r#"{"code":"DUPLICATE_ITEM","message":"name in use"}"#).unwrap();
        assert_eq!(err.code, "DUPLICATE_ITEM");
        assert_eq!(err.message, "name in use");

        assert!(remote_error(r#"{"id": 12, "name": "x"}"#).is_none());
        assert!(remote_error("not json").is_none());
        assert!(remote_error("").is_none());
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(ERROR_BODY_EXCERPT + 10);
        assert_eq!(excerpt(&long).chars().count(), ERROR_BODY_EXCERPT);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn test_connector_retry_from_config() {
        let connector = HttpConnector::new(&ConnectConfig::default());
        assert_eq!(connector.retry.max_attempts, 3);
        let connector = connector.with_retry(RetryConfig::testing());
        assert_eq!(connector.retry.initial_delay, std::time::Duration::from_millis(10));
    }
}
