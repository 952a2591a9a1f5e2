//! Webhook event shapes and dashboard response envelopes.
//!
//! Raw payloads are a tagged union validated here at the boundary; anything that
//! does not match a known shape never reaches business logic. Message events are
//! additionally normalized into [`InboundMessageEvent`] or dropped as noise.

use crate::channels::ConnectionStatus;
use crate::session::StatusSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound webhook body: `{ "event": ..., "tenantId": ..., "data": {...} }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    Message(MessageEnvelope),
    StatusChange(StatusChangeEnvelope),
    PairingCode(PairingCodeEnvelope),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub tenant_id: String,
    #[serde(default)]
    pub data: MessagePayload,
}

/// Raw message payload; every field optional until validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default, alias = "text")]
    pub message: Option<String>,
    /// Channel timestamp (Unix seconds), when provided.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangeEnvelope {
    pub tenant_id: String,
    #[serde(default)]
    pub data: StatusChangePayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangePayload {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl StatusChangePayload {
    pub fn to_connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.connected,
            state: self.status.clone(),
            phone_number: self.phone_number.clone(),
            display_name: self.display_name.clone(),
            pairing_code: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeEnvelope {
    pub tenant_id: String,
    #[serde(default)]
    pub data: PairingCodePayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodePayload {
    #[serde(default, alias = "qrCode")]
    pub pairing_code: Option<String>,
}

/// Boundary-validated inbound message. Also the payload forwarded to the
/// workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessageEvent {
    pub tenant_id: String,
    pub message_id: String,
    pub from: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Validate and normalize. Missing id/sender or empty text returns None.
    /// That is intentional noise filtering, not a fault.
    pub fn normalize(&self) -> Option<InboundMessageEvent> {
        let message_id = self.data.message_id.as_deref()?.trim();
        let from = self.data.from.as_deref()?.trim();
        let text = self.data.message.as_deref()?.trim();
        if message_id.is_empty() || from.is_empty() || text.is_empty() {
            return None;
        }
        let received_at = self
            .data
            .timestamp
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);
        Some(InboundMessageEvent {
            tenant_id: self.tenant_id.clone(),
            message_id: message_id.to_string(),
            from: from.to_string(),
            text: text.to_string(),
            received_at,
        })
    }
}

/// Envelope for every webhook/session response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn with_status(data: StatusSnapshot) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
