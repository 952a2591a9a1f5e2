//! Per-tenant channel handle cache: selects the configured backend and reuses one
//! handle per tenant instead of re-constructing it on every call.

use crate::channels::backend::ChannelBackend;
use crate::channels::hosted::HostedChannel;
use crate::channels::local::LocalBridgeChannel;
use crate::config::{ChannelBackendKind, ChannelsConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Lookup/eviction seam between the session manager and the backend handles.
/// Eviction must be visible to the next lookup immediately (no stale handle
/// reuse after disconnect).
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Arc<dyn ChannelBackend>;
    async fn evict(&self, tenant_id: &str);
}

/// Builds and caches one backend handle per tenant, per the configured backend kind.
pub struct ChannelFactory {
    config: ChannelsConfig,
    api_key: Option<String>,
    request_timeout: Duration,
    handles: RwLock<HashMap<String, Arc<dyn ChannelBackend>>>,
}

impl ChannelFactory {
    pub fn new(config: ChannelsConfig, api_key: Option<String>, request_timeout: Duration) -> Self {
        Self {
            config,
            api_key,
            request_timeout,
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn build(&self) -> Arc<dyn ChannelBackend> {
        match self.config.backend {
            ChannelBackendKind::Local => Arc::new(LocalBridgeChannel::new(
                &self.config.local.base_url,
                self.request_timeout,
            )),
            ChannelBackendKind::Hosted => {
                let base_url = self
                    .config
                    .hosted
                    .base_url
                    .as_deref()
                    .unwrap_or(&self.config.local.base_url);
                if self.config.hosted.base_url.is_none() {
                    log::warn!("hosted channel backend selected but no base url configured");
                }
                Arc::new(HostedChannel::new(
                    base_url,
                    self.api_key.clone(),
                    self.request_timeout,
                ))
            }
        }
    }
}

#[async_trait]
impl ChannelProvider for ChannelFactory {
    async fn get(&self, tenant_id: &str) -> Arc<dyn ChannelBackend> {
        if let Some(handle) = self.handles.read().await.get(tenant_id) {
            return handle.clone();
        }
        let mut handles = self.handles.write().await;
        // Re-check: another task may have built the handle while we waited.
        if let Some(handle) = handles.get(tenant_id) {
            return handle.clone();
        }
        let handle = self.build();
        handles.insert(tenant_id.to_string(), handle.clone());
        log::debug!(
            "channel factory: built {} handle for tenant {}",
            handle.id(),
            tenant_id
        );
        handle
    }

    async fn evict(&self, tenant_id: &str) {
        if self.handles.write().await.remove(tenant_id).is_some() {
            log::debug!("channel factory: evicted handle for tenant {}", tenant_id);
        }
    }
}
