//! Hosted channel microservice client: multi-tenant session API with API-key auth.

use crate::channels::backend::{ChannelBackend, ChannelError, ConnectionStatus, PairingStart};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const API_KEY_HEADER: &str = "apikey";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionResponse {
    #[serde(default)]
    connected: bool,
    #[serde(default, alias = "qrCode")]
    pairing_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatusResponse {
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, alias = "qrCode")]
    pairing_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// Client for the hosted channel microservice HTTP API.
#[derive(Clone)]
pub struct HostedChannel {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HostedChannel {
    pub fn new(base_url: &str, api_key: Option<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }
}

async fn api_error(res: reqwest::Response) -> ChannelError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    ChannelError::Api(format!("{} {}", status, body))
}

#[async_trait]
impl ChannelBackend for HostedChannel {
    fn id(&self) -> &str {
        "hosted"
    }

    async fn initialize_session(&self, tenant_id: &str) -> Result<PairingStart, ChannelError> {
        let url = format!("{}/session/start", self.base_url);
        let body = serde_json::json!({ "tenantId": tenant_id });
        let res = self.request(self.client.post(&url)).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: StartSessionResponse = res.json().await?;
        Ok(PairingStart {
            connected: data.connected,
            pairing_code: data.pairing_code,
        })
    }

    async fn connection_status(&self, tenant_id: &str) -> Result<ConnectionStatus, ChannelError> {
        let url = format!("{}/session/status", self.base_url);
        let res = self
            .request(self.client.get(&url))
            .query(&[("tenantId", tenant_id)])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: SessionStatusResponse = res.json().await?;
        Ok(ConnectionStatus {
            connected: data.connected,
            state: data.status,
            phone_number: data.phone_number,
            display_name: data.display_name,
            pairing_code: data.pairing_code,
        })
    }

    async fn disconnect(&self, tenant_id: &str) -> Result<(), ChannelError> {
        let url = format!("{}/session", self.base_url);
        let res = self
            .request(self.client.delete(&url))
            .query(&[("tenantId", tenant_id)])
            .send()
            .await?;
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
        let url = format!("{}/messages", self.base_url);
        let body = serde_json::json!({ "tenantId": tenant_id, "to": to, "text": text });
        let res = self.request(self.client.post(&url)).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: SendResponse = res.json().await?;
        Ok(data
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }
}
