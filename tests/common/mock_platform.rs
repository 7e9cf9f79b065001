//! A tenant served by wiremock.
//!
//! Mounts the login endpoint on start; tests mount whatever other endpoints
//! they exercise.

use policy_replication::config::ConnectConfig;
use policy_replication::resilience::RetryConfig;
use policy_replication::{HttpConnector, PolicyRule, TenantConfig};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Audit export with the platform's 5-line preamble and `rows` data rows.
pub fn audit_export(rows: usize) -> String {
    let mut out = String::from(
        "Audit Logs Report\nReport Created:,2026-01-01\nTime Range:,6m\nAction Types:,UPDATE;CREATE\n\n",
    );
    out.push_str("No.,Time,User,Action,Category,Resource,Result\n");
    for i in 1..=rows {
        out.push_str(&format!(
            "{},2026-01-01 00:00:0{},admin@parent,UPDATE,Firewall Filtering,Rule {},SUCCESS\n",
            i,
            i % 10,
            i
        ));
    }
    out
}

/// Connector that gives up after one login attempt.
pub fn single_attempt_connector() -> HttpConnector {
    HttpConnector::new(&ConnectConfig::default()).with_retry(RetryConfig {
        max_attempts: 1,
        ..RetryConfig::testing()
    })
}

pub struct MockTenant {
    pub tenant_id: String,
    pub server: MockServer,
}

impl MockTenant {
    /// Start a tenant whose login succeeds.
    pub async fn start(tenant_id: &str) -> Self {
        let tenant = Self::start_without_login(tenant_id).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/authenticatedSession"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "JSESSIONID=0123456789ABCDEF; Path=/")
                    .set_body_json(json!({"authType": "ADMIN_LOGIN"})),
            )
            .mount(&tenant.server)
            .await;
        tenant
    }

    pub async fn start_without_login(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            server: MockServer::start().await,
        }
    }

    pub fn config(&self) -> TenantConfig {
        TenantConfig::for_testing(&self.tenant_id, &self.server.uri())
    }

    /// Mount a JSON response for `GET /api/v1/{endpoint}`.
    pub async fn mount_get(&self, endpoint: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/{}", endpoint)))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Mount the three audit report endpoints, completing immediately.
    pub async fn mount_audit_report(&self, rows: usize) {
        Mock::given(method("POST"))
            .and(path("/api/v1/auditlogEntryReport"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&self.server)
            .await;
        self.mount_get("auditlogEntryReport", json!({"status": "COMPLETE"}))
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/auditlogEntryReport/download"))
            .respond_with(ResponseTemplate::new(200).set_body_string(audit_export(rows)))
            .mount(&self.server)
            .await;
    }

    /// Requests received for `METHOD /api/v1/{endpoint}`.
    pub async fn requests_to(&self, http_method: &str, endpoint: &str) -> Vec<wiremock::Request> {
        let wanted = format!("/api/v1/{}", endpoint);
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == http_method && r.url.path() == wanted)
            .collect()
    }
}

/// Rule fixture in the platform's JSON shape.
pub fn rule_json(id: i64, name: &str, order: i64) -> Value {
    json!({
        "id": id,
        "name": name,
        "order": order,
        "rank": 7,
        "action": "ALLOW",
        "state": "ENABLED",
        "accessControl": "READ_WRITE",
        "enableFullLogging": false,
        "predefined": false,
        "defaultRule": false,
    })
}

pub fn rule(name: &str, order: i64) -> PolicyRule {
    PolicyRule::new(name, order).with_action("ALLOW")
}
