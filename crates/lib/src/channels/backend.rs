//! Uniform channel backend interface: the session manager and the outbound path
//! are agnostic to whether a tenant session lives on the local bridge or the
//! hosted microservice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel api error: {0}")]
    Api(String),
}

/// Normalized connection state reported by a channel backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Raw backend state label (e.g. "open", "connecting", "qr").
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Outstanding pairing code (QR payload), when the backend is waiting for a scan.
    #[serde(default)]
    pub pairing_code: Option<String>,
}

/// Result of starting a pairing attempt. Either the session reconnected from a
/// stored credential (connected) or a pairing code is (or will become) available.
#[derive(Debug, Clone, Default)]
pub struct PairingStart {
    pub connected: bool,
    pub pairing_code: Option<String>,
}

/// One tenant-scoped channel backend handle.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// Backend id ("local" or "hosted").
    fn id(&self) -> &str;

    /// Start (or resume) pairing for the tenant's session.
    async fn initialize_session(&self, tenant_id: &str) -> Result<PairingStart, ChannelError>;

    /// Current connection state for the tenant's session.
    async fn connection_status(&self, tenant_id: &str) -> Result<ConnectionStatus, ChannelError>;

    /// Tear down the tenant's session.
    async fn disconnect(&self, tenant_id: &str) -> Result<(), ChannelError>;

    /// Send a text message to a client; returns the channel message id.
    async fn send_message(
        &self,
        tenant_id: &str,
        to: &str,
        text: &str,
    ) -> Result<String, ChannelError>;
}
