//! Primary workflow engine client and the ordered dispatch strategy.
//!
//! Inbound messages go to the external workflow engine first (signed payload,
//! bounded timeout). On any failure (timeout, non-2xx, network, missing
//! configuration) the local agent runs synchronously as the fallback, under its
//! own shorter budget. The failure reason is recorded, never surfaced to the
//! inbound transport as an error.

use crate::agent::{AgentRuntime, TurnRequest};
use crate::gateway::auth::sign_body;
use crate::gateway::protocol::InboundMessageEvent;
use crate::session::SessionManager;
use std::sync::Arc;
use std::time::Duration;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow engine not configured")]
    NotConfigured,
    #[error("workflow request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("workflow request timed out after {0:?}")]
    Timeout(Duration),
    #[error("workflow engine returned {0}")]
    Status(reqwest::StatusCode),
    #[error("workflow payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Client for the external workflow engine. A 2xx response means the engine
/// accepted the event and will call back independently.
#[derive(Clone)]
pub struct WorkflowClient {
    url: String,
    secret: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WorkflowClient {
    /// None when url or secret is missing; the dispatcher then treats the
    /// engine as unavailable and goes straight to the fallback.
    pub fn from_parts(url: Option<String>, secret: Option<String>, timeout: Duration) -> Option<Self> {
        match (url, secret) {
            (Some(url), Some(secret)) => Some(Self {
                url,
                secret,
                timeout,
                client: reqwest::Client::new(),
            }),
            _ => None,
        }
    }

    /// Forward one normalized event with an HMAC-signed body.
    pub async fn forward(&self, event: &InboundMessageEvent) -> Result<(), WorkflowError> {
        let body = serde_json::to_vec(event)?;
        let signature = sign_body(&self.secret, &body);
        let send = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send();
        let res = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| WorkflowError::Timeout(self.timeout))??;
        if !res.status().is_success() {
            return Err(WorkflowError::Status(res.status()));
        }
        Ok(())
    }
}

/// How one inbound message was handled, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The primary workflow engine accepted the event.
    Forwarded,
    /// The fallback agent replied and the reply was sent.
    FallbackReplied { outbound_id: String },
    /// The fallback ran but nothing was sent (empty reply, send failure, timeout).
    FallbackDropped { reason: String },
}

/// Ordered strategy list: primary workflow engine, then the local agent.
pub struct Dispatcher {
    workflow: Option<WorkflowClient>,
    agent: Arc<AgentRuntime>,
    sessions: Arc<SessionManager>,
    fallback_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        workflow: Option<WorkflowClient>,
        agent: Arc<AgentRuntime>,
        sessions: Arc<SessionManager>,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            workflow,
            agent,
            sessions,
            fallback_timeout,
        }
    }

    /// Dispatch one already-deduped event. Never errors: every failure mode
    /// resolves to an outcome the webhook handler can acknowledge with 200.
    pub async fn dispatch(&self, event: InboundMessageEvent) -> DispatchOutcome {
        match &self.workflow {
            Some(workflow) => match workflow.forward(&event).await {
                Ok(()) => {
                    log::debug!(
                        "forwarded message {} for tenant {} to workflow engine",
                        event.message_id,
                        event.tenant_id
                    );
                    return DispatchOutcome::Forwarded;
                }
                Err(e) => {
                    log::warn!(
                        "workflow engine failed for tenant {} ({}), falling back to local agent",
                        event.tenant_id,
                        e
                    );
                }
            },
            None => {
                log::debug!("workflow engine not configured, using local agent");
            }
        }
        self.fallback(event).await
    }

    /// Run the agent under its own budget (never the primary's leftover
    /// deadline) and send a non-empty reply exactly once.
    async fn fallback(&self, event: InboundMessageEvent) -> DispatchOutcome {
        let request = TurnRequest {
            tenant_id: event.tenant_id.clone(),
            client_key: event.from.clone(),
            text: event.text.clone(),
            message_id: Some(event.message_id.clone()),
            already_deduped: true,
        };
        let turn =
            match tokio::time::timeout(self.fallback_timeout, self.agent.process_message(request))
                .await
            {
                Ok(turn) => turn,
                Err(_) => {
                    log::error!(
                        "fallback agent timed out for tenant {} message {}",
                        event.tenant_id,
                        event.message_id
                    );
                    return DispatchOutcome::FallbackDropped {
                        reason: "fallback timed out".to_string(),
                    };
                }
            };

        if turn.reply.trim().is_empty() {
            log::info!(
                "fallback produced no reply for tenant {} (intent: {}), dropping",
                event.tenant_id,
                turn.intent
            );
            return DispatchOutcome::FallbackDropped {
                reason: "empty reply".to_string(),
            };
        }

        match self
            .sessions
            .send(&event.tenant_id, &event.from, &turn.reply)
            .await
        {
            Ok(outbound_id) => DispatchOutcome::FallbackReplied { outbound_id },
            Err(e) => {
                log::warn!("fallback reply send failed for tenant {}: {}", event.tenant_id, e);
                DispatchOutcome::FallbackDropped {
                    reason: format!("send failed: {}", e),
                }
            }
        }
    }
}
