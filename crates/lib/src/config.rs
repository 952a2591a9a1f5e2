//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.rentline/config.json`) and environment.
//! Covers the gateway, channel backends, the workflow engine, the agent, and cache TTLs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings (bind, port, webhook auth).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel backend selection and endpoints.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Primary workflow engine (external automation that handles inbound messages).
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Agent runtime settings (completion service, business functions, timeouts).
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session manager TTLs and pairing-poll bounds.
    #[serde(default)]
    pub session: SessionConfig,

    /// Inbound message dedup TTL.
    #[serde(default)]
    pub dedup: DedupConfig,
}

/// Gateway bind, port, and webhook auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// HTTP port (default 8787).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Webhook auth. When neither token nor secret is set, all deliveries are rejected.
    #[serde(default)]
    pub auth: WebhookAuthConfig,
}

/// Webhook auth: static bearer token and/or HMAC signing secret (dual-accept).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthConfig {
    /// Static bearer token compared against `Authorization: Bearer <token>`.
    /// Overridden by RENTLINE_WEBHOOK_TOKEN env.
    pub token: Option<String>,

    /// HMAC-SHA256 secret for `X-Webhook-Signature: sha256=<hex>` over the raw body.
    /// Overridden by RENTLINE_WEBHOOK_SECRET env.
    pub secret: Option<String>,
}

fn default_gateway_port() -> u16 {
    8787
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: WebhookAuthConfig::default(),
        }
    }
}

/// Which channel backend hosts tenant sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelBackendKind {
    /// Bridge process on this host; per-tenant instance endpoints.
    #[default]
    Local,

    /// Externally hosted multi-tenant channel microservice.
    Hosted,
}

/// Channel backend selection and per-backend endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    /// "local" (default) or "hosted".
    #[serde(default)]
    pub backend: ChannelBackendKind,

    #[serde(default)]
    pub local: LocalBridgeConfig,

    #[serde(default)]
    pub hosted: HostedChannelConfig,
}

/// Local channel bridge (per-tenant instances on this host).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBridgeConfig {
    /// Bridge base URL (default http://127.0.0.1:8599).
    #[serde(default = "default_local_bridge_url")]
    pub base_url: String,
}

fn default_local_bridge_url() -> String {
    "http://127.0.0.1:8599".to_string()
}

impl Default for LocalBridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_local_bridge_url(),
        }
    }
}

/// Hosted channel microservice (multi-tenant, API-key auth).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedChannelConfig {
    /// Service base URL. Required when backend is "hosted".
    pub base_url: Option<String>,

    /// API key sent in the `apikey` header. Overridden by RENTLINE_HOSTED_API_KEY env.
    pub api_key: Option<String>,
}

/// Primary workflow engine: inbound messages are forwarded here first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Engine webhook URL. When unset the local agent handles every message.
    /// Overridden by RENTLINE_WORKFLOW_URL env.
    pub url: Option<String>,

    /// Secret for signing forwarded payloads. Overridden by RENTLINE_WORKFLOW_SECRET env.
    pub secret: Option<String>,

    /// Forward timeout in seconds (default 30).
    #[serde(default = "default_workflow_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_workflow_timeout_secs() -> u64 {
    30
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

impl WorkflowConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Agent runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Completion service base URL (default http://127.0.0.1:8601).
    #[serde(default = "default_completion_url")]
    pub completion_url: String,

    /// Model id passed to the completion service. Service default when unset.
    pub model: Option<String>,

    /// Completion call timeout in seconds (default 20).
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,

    /// Business-function gateway base URL. When unset, function calls resolve to an error note.
    /// Overridden by RENTLINE_FUNCTIONS_URL env.
    pub functions_url: Option<String>,

    /// How many recent context messages are sent to the completion service (default 12).
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Fallback turn budget in seconds when the primary workflow failed (default 10).
    /// Deliberately shorter than the workflow timeout.
    #[serde(default = "default_fallback_timeout_secs")]
    pub fallback_timeout_secs: u64,

    /// Minutes a conversation context may sit idle before the sweep evicts it (default 120).
    #[serde(default = "default_context_idle_minutes")]
    pub context_idle_minutes: u64,

    /// Max conversation contexts held in memory; oldest evicted first (default 10000).
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,
}

fn default_completion_url() -> String {
    "http://127.0.0.1:8601".to_string()
}

fn default_completion_timeout_secs() -> u64 {
    20
}

fn default_history_window() -> usize {
    12
}

fn default_fallback_timeout_secs() -> u64 {
    10
}

fn default_context_idle_minutes() -> u64 {
    120
}

fn default_max_contexts() -> usize {
    10_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            completion_url: default_completion_url(),
            model: None,
            completion_timeout_secs: default_completion_timeout_secs(),
            functions_url: None,
            history_window: default_history_window(),
            fallback_timeout_secs: default_fallback_timeout_secs(),
            context_idle_minutes: default_context_idle_minutes(),
            max_contexts: default_max_contexts(),
        }
    }
}

impl AgentConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    pub fn context_idle(&self) -> Duration {
        Duration::from_secs(self.context_idle_minutes * 60)
    }
}

/// Session manager TTLs and pairing-poll bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Status cache TTL in seconds when no pairing code is outstanding (default 5).
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,

    /// Status cache TTL in seconds while a pairing code is outstanding (default 60).
    /// A code in flight must stay stable for the user to scan it.
    #[serde(default = "default_pairing_ttl_secs")]
    pub pairing_ttl_secs: u64,

    /// Init cooldown in seconds: a second init inside this window returns the cached
    /// status instead of starting another pairing attempt (default 30).
    #[serde(default = "default_init_cooldown_secs")]
    pub init_cooldown_secs: u64,

    /// Max pairing-code poll attempts after an init that returned no code (default 10).
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Delay between pairing-code polls in milliseconds (default 1500).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wall-clock ceiling for the whole pairing poll in seconds (default 20).
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,

    /// Per-call timeout for channel backend requests in seconds (default 15).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_status_ttl_secs() -> u64 {
    5
}

fn default_pairing_ttl_secs() -> u64 {
    60
}

fn default_init_cooldown_secs() -> u64 {
    30
}

fn default_poll_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_poll_deadline_secs() -> u64 {
    20
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: default_status_ttl_secs(),
            pairing_ttl_secs: default_pairing_ttl_secs(),
            init_cooldown_secs: default_init_cooldown_secs(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_deadline_secs: default_poll_deadline_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Dedup cache TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupConfig {
    /// Seconds a processed message id is remembered (default 300).
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_nonempty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the webhook bearer token: env RENTLINE_WEBHOOK_TOKEN overrides config.
pub fn resolve_webhook_token(config: &Config) -> Option<String> {
    env_nonempty("RENTLINE_WEBHOOK_TOKEN").or_else(|| config_nonempty(&config.gateway.auth.token))
}

/// Resolve the webhook HMAC secret: env RENTLINE_WEBHOOK_SECRET overrides config.
pub fn resolve_webhook_secret(config: &Config) -> Option<String> {
    env_nonempty("RENTLINE_WEBHOOK_SECRET").or_else(|| config_nonempty(&config.gateway.auth.secret))
}

/// Resolve the workflow engine URL: env RENTLINE_WORKFLOW_URL overrides config.
pub fn resolve_workflow_url(config: &Config) -> Option<String> {
    env_nonempty("RENTLINE_WORKFLOW_URL").or_else(|| config_nonempty(&config.workflow.url))
}

/// Resolve the workflow signing secret: env RENTLINE_WORKFLOW_SECRET overrides config.
pub fn resolve_workflow_secret(config: &Config) -> Option<String> {
    env_nonempty("RENTLINE_WORKFLOW_SECRET").or_else(|| config_nonempty(&config.workflow.secret))
}

/// Resolve the hosted channel API key: env RENTLINE_HOSTED_API_KEY overrides config.
pub fn resolve_hosted_api_key(config: &Config) -> Option<String> {
    env_nonempty("RENTLINE_HOSTED_API_KEY")
        .or_else(|| config_nonempty(&config.channels.hosted.api_key))
}

/// Resolve the business-function gateway URL: env RENTLINE_FUNCTIONS_URL overrides config.
pub fn resolve_functions_url(config: &Config) -> Option<String> {
    env_nonempty("RENTLINE_FUNCTIONS_URL").or_else(|| config_nonempty(&config.agent.functions_url))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RENTLINE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".rentline").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or RENTLINE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 8787);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn default_backend_is_local() {
        let c = ChannelsConfig::default();
        assert_eq!(c.backend, ChannelBackendKind::Local);
        assert_eq!(c.local.base_url, "http://127.0.0.1:8599");
    }

    #[test]
    fn session_ttls_default_short_and_extended() {
        let s = SessionConfig::default();
        assert!(s.status_ttl_secs < s.pairing_ttl_secs);
        assert_eq!(s.pairing_ttl_secs, 60);
        assert_eq!(s.init_cooldown_secs, 30);
    }

    #[test]
    fn parses_camel_case_sections() {
        let json = r#"{
            "gateway": { "port": 9000, "auth": { "token": "t", "secret": "s" } },
            "channels": { "backend": "hosted", "hosted": { "baseUrl": "https://ch.example" } },
            "workflow": { "url": "https://wf.example/hook", "timeoutSecs": 12 },
            "dedup": { "ttlSecs": 60 }
        }"#;
        let config: Config = serde_json::from_str(json).expect("parse");
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.channels.backend, ChannelBackendKind::Hosted);
        assert_eq!(
            config.channels.hosted.base_url.as_deref(),
            Some("https://ch.example")
        );
        assert_eq!(config.workflow.timeout(), Duration::from_secs(12));
        assert_eq!(config.dedup.ttl(), Duration::from_secs(60));
    }
}
