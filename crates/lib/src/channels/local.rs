//! Local channel bridge client: per-tenant instances hosted by a bridge process
//! on this machine (`/instances/{tenant}/...`).

use crate::channels::backend::{ChannelBackend, ChannelError, ConnectionStatus, PairingStart};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    #[serde(default)]
    connected: bool,
    #[serde(default, alias = "qrCode")]
    pairing_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceStatus {
    /// Bridge state label: "open", "connecting", "qr", "close".
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    profile_name: Option<String>,
    #[serde(default, alias = "qrCode")]
    pairing_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    /// Absent on older bridge builds; a local id is minted instead.
    #[serde(default)]
    message_id: Option<String>,
}

/// Client for the local channel bridge HTTP API.
#[derive(Clone)]
pub struct LocalBridgeChannel {
    base_url: String,
    client: reqwest::Client,
}

impl LocalBridgeChannel {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn instance_url(&self, tenant_id: &str, suffix: &str) -> String {
        format!("{}/instances/{}{}", self.base_url, tenant_id, suffix)
    }
}

async fn api_error(res: reqwest::Response) -> ChannelError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    ChannelError::Api(format!("{} {}", status, body))
}

#[async_trait]
impl ChannelBackend for LocalBridgeChannel {
    fn id(&self) -> &str {
        "local"
    }

    async fn initialize_session(&self, tenant_id: &str) -> Result<PairingStart, ChannelError> {
        let url = self.instance_url(tenant_id, "/connect");
        let res = self.client.post(&url).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: ConnectResponse = res.json().await?;
        Ok(PairingStart {
            connected: data.connected,
            pairing_code: data.pairing_code,
        })
    }

    async fn connection_status(&self, tenant_id: &str) -> Result<ConnectionStatus, ChannelError> {
        let url = self.instance_url(tenant_id, "/status");
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: InstanceStatus = res.json().await?;
        let connected = data.state.as_deref() == Some("open");
        Ok(ConnectionStatus {
            connected,
            state: data.state,
            phone_number: data.phone_number,
            display_name: data.profile_name,
            pairing_code: data.pairing_code,
        })
    }

    async fn disconnect(&self, tenant_id: &str) -> Result<(), ChannelError> {
        let url = self.instance_url(tenant_id, "");
        let res = self.client.delete(&url).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        Ok(())
    }

    async fn send_message(
        &self,
        tenant_id: &str,
        to: &str,
        text: &str,
    ) -> Result<String, ChannelError> {
        let url = self.instance_url(tenant_id, "/messages");
        let body = serde_json::json!({ "to": to, "text": text });
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: SendResponse = res.json().await?;
        Ok(data
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }
}
