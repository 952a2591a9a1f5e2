//! Completion service client: classify (intent + function calls + slots) and
//! compose (final reply from function results).

use crate::agent::ConversationContext;
use crate::functions::FunctionOutcome;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("completion api error: {0}")]
    Api(String),
}

/// One function call selected by the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Classification of one inbound message against the conversation so far.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(default)]
    pub intent: String,
    /// Draft reply; used as-is when no functions were selected.
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default)]
    pub extracted_info: HashMap<String, String>,
    #[serde(default)]
    pub tokens_used: u32,
}

/// Final reply composed from function results.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub reply: String,
    #[serde(default)]
    pub tokens_used: u32,
}

/// Completion collaborator. Both calls receive the conversation context (the
/// last message is the inbound user message).
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn classify(&self, context: &ConversationContext)
        -> Result<Classification, CompletionError>;

    async fn compose(
        &self,
        context: &ConversationContext,
        intent: &str,
        results: &[FunctionOutcome],
    ) -> Result<Composition, CompletionError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    tenant_id: &'a str,
    client_key: &'a str,
    stage: &'a crate::agent::Stage,
    messages: Vec<WireMessage<'a>>,
    extracted_info: &'a HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComposeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    tenant_id: &'a str,
    client_key: &'a str,
    intent: &'a str,
    messages: Vec<WireMessage<'a>>,
    results: &'a [FunctionOutcome],
}

/// HTTP client for the completion service.
#[derive(Clone)]
pub struct CompletionClient {
    base_url: String,
    model: Option<String>,
    history_window: usize,
    client: reqwest::Client,
}

impl CompletionClient {
    pub fn new(base_url: &str, model: Option<String>, history_window: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            history_window,
            client: reqwest::Client::new(),
        }
    }

    fn recent_messages<'a>(&self, context: &'a ConversationContext) -> Vec<WireMessage<'a>> {
        let skip = context.messages.len().saturating_sub(self.history_window);
        context.messages[skip..]
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect()
    }
}

async fn api_error(res: reqwest::Response) -> CompletionError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    CompletionError::Api(format!("{} {}", status, body))
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn classify(
        &self,
        context: &ConversationContext,
    ) -> Result<Classification, CompletionError> {
        let url = format!("{}/v1/classify", self.base_url);
        let body = ClassifyRequest {
            model: self.model.as_deref(),
            tenant_id: &context.tenant_id,
            client_key: &context.client_key,
            stage: &context.stage,
            messages: self.recent_messages(context),
            extracted_info: &context.extracted_info,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: Classification = res.json().await?;
        Ok(data)
    }

    async fn compose(
        &self,
        context: &ConversationContext,
        intent: &str,
        results: &[FunctionOutcome],
    ) -> Result<Composition, CompletionError> {
        let url = format!("{}/v1/compose", self.base_url);
        let body = ComposeRequest {
            model: self.model.as_deref(),
            tenant_id: &context.tenant_id,
            client_key: &context.client_key,
            intent,
            messages: self.recent_messages(context),
            results,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(api_error(res).await);
        }
        let data: Composition = res.json().await?;
        Ok(data)
    }
}
