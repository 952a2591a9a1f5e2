//! Business-function dispatch: search, pricing, reservation and friends live in
//! the main application; the agent reaches them through this seam.

use async_trait::async_trait;
use serde::Serialize;

/// Structured result of one business-function invocation. Failures become error
/// notes in `output` rather than failing the turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionOutcome {
    pub name: String,
    pub ok: bool,
    pub output: serde_json::Value,
}

impl FunctionOutcome {
    pub fn success(name: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            ok: true,
            output,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            output: serde_json::json!({ "error": error.into() }),
        }
    }
}

/// Executes a business function by name and JSON arguments for one tenant.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn invoke(
        &self,
        tenant_id: &str,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

/// HTTP implementation posting to the main application's internal function endpoint.
#[derive(Clone)]
pub struct FunctionGateway {
    base_url: String,
    client: reqwest::Client,
}

impl FunctionGateway {
    pub fn new(base_url: &str, request_timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl FunctionExecutor for FunctionGateway {
    async fn invoke(
        &self,
        tenant_id: &str,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let url = format!("{}/internal/functions/{}", self.base_url, name);
        let body = serde_json::json!({ "tenantId": tenant_id, "arguments": args });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("function {} failed: {} {}", name, status, body));
        }
        res.json().await.map_err(|e| e.to_string())
    }
}
