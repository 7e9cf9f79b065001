//! Connector wrapper with connect-failure injection.
//!
//! Wraps an [`InMemoryConnector`] and fails the first `n` connects to a
//! tenant with a gateway error, as a tenant whose login endpoint is briefly
//! down would.

use policy_replication::gateway::BoxFuture;
use policy_replication::{
    InMemoryConnector, InMemoryGateway, ReplicationError, TenantConfig, TenantConnector,
};
use std::collections::HashMap;
use std::sync::Mutex;

pub struct FlakyConnector {
    inner: InMemoryConnector,
    /// Remaining injected failures per tenant
    failures: Mutex<HashMap<String, usize>>,
    /// Connect attempts per tenant, failed or not
    attempts: Mutex<HashMap<String, usize>>,
}

impl FlakyConnector {
    pub fn new(inner: InMemoryConnector) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` connects to `tenant_id`.
    pub fn fail_connects(self, tenant_id: &str, count: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), count);
        self
    }

    pub fn attempts(&self, tenant_id: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }
}

impl TenantConnector for FlakyConnector {
    type Gateway = InMemoryGateway;

    fn connect<'a>(&'a self, tenant: &'a TenantConfig) -> BoxFuture<'a, InMemoryGateway> {
        Box::pin(async move {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(tenant.tenant_id.clone())
                .or_default() += 1;

            let should_fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&tenant.tenant_id) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(ReplicationError::gateway_msg(
                    &tenant.tenant_id,
                    "authenticate",
                    "503 Service Unavailable",
                ));
            }

            self.inner.connect(tenant).await
        })
    }
}
