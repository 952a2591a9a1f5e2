//! Per-tenant dedup of inbound message ids.
//!
//! Keyed by (tenant, message id) so ids are never compared across tenants.
//! Checked before any side-effecting processing; a repeat inside the TTL
//! short-circuits with no downstream work and no second outbound reply.

use crate::cache::{Clock, ExpiringMap};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    tenant_id: String,
    message_id: String,
}

impl DedupKey {
    fn new(tenant_id: &str, message_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            message_id: message_id.to_string(),
        }
    }
}

/// TTL-bounded record of processed message ids, partitioned by tenant.
pub struct DedupCache {
    seen: ExpiringMap<DedupKey, DateTime<Utc>>,
}

impl DedupCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: ExpiringMap::new(ttl, clock),
        }
    }

    /// True when this (tenant, message id) was already processed inside the TTL.
    pub async fn is_duplicate(&self, tenant_id: &str, message_id: &str) -> bool {
        self.seen
            .contains(&DedupKey::new(tenant_id, message_id))
            .await
    }

    /// Record the id as processed (refreshes the TTL when already present).
    pub async fn mark_processed(&self, tenant_id: &str, message_id: &str) {
        self.seen
            .insert(DedupKey::new(tenant_id, message_id), Utc::now())
            .await;
    }

    /// Atomic check-and-mark: returns true when the id is new and was marked,
    /// false when it was already processed. Concurrent deliveries of the same
    /// id resolve to exactly one true.
    pub async fn check_and_mark(&self, tenant_id: &str, message_id: &str) -> bool {
        self.seen
            .insert_if_absent(DedupKey::new(tenant_id, message_id), Utc::now())
            .await
    }

    /// Drop expired entries; called from the background sweep.
    pub async fn purge_expired(&self) {
        self.seen.purge_expired().await;
    }

    pub async fn len(&self) -> usize {
        self.seen.len().await
    }
}
