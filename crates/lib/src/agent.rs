//! Conversation agent runtime: per-(tenant, client) context, intent/function
//! dispatch, and reply production.
//!
//! One runtime instance per process holds the context map (constructed at startup
//! and injected into handlers; the map is the only process-wide mutable state).
//! Each context sits behind its own mutex, so turns for one client are serialized
//! in arrival order while unrelated clients proceed independently.

use crate::cache::Clock;
use crate::dedup::DedupCache;
use crate::functions::{FunctionExecutor, FunctionOutcome};
use crate::llm::{Classification, CompletionBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Reply used when the completion service is unavailable; a chat user never
/// sees a raw error.
const SAFE_REPLY: &str =
    "Thanks for your message! Give me a moment to check that and I'll get right back to you.";

/// Conversation stage, advanced monotonically by intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initial,
    Discovery,
    Qualifying,
    Negotiating,
    Closed,
}

/// One message in a conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ContextMessage {
    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            at: Utc::now(),
        }
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Accumulated conversation state for one client within one tenant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub tenant_id: String,
    pub client_key: String,
    pub stage: Stage,
    pub messages: Vec<ContextMessage>,
    pub extracted_info: HashMap<String, String>,
    pub last_message_at: DateTime<Utc>,
}

impl ConversationContext {
    fn new(tenant_id: &str, client_key: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_key: client_key.to_string(),
            stage: Stage::Initial,
            messages: Vec::new(),
            extracted_info: HashMap::new(),
            last_message_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContextKey {
    tenant_id: String,
    client_key: String,
}

/// One inbound turn for the runtime.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub tenant_id: String,
    pub client_key: String,
    pub text: String,
    /// Channel message id, when known; used for runtime-level dedup.
    pub message_id: Option<String>,
    /// Set by the webhook path: the ingress already deduped this id, skip the
    /// runtime's own check.
    pub already_deduped: bool,
}

/// Result of one turn. `reply` may be empty (duplicate turns), in which case the
/// caller drops it instead of sending.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub reply: String,
    pub tokens_used: u32,
    pub functions_executed: Vec<String>,
    pub intent: String,
}

impl TurnResult {
    fn silent(intent: &str) -> Self {
        Self {
            reply: String::new(),
            tokens_used: 0,
            functions_executed: Vec::new(),
            intent: intent.to_string(),
        }
    }
}

/// Runtime tuning knobs, derived from [`crate::config::AgentConfig`].
#[derive(Debug, Clone)]
pub struct AgentLimits {
    pub completion_timeout: Duration,
    pub context_idle: Duration,
    pub max_contexts: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            completion_timeout: Duration::from_secs(20),
            context_idle: Duration::from_secs(2 * 60 * 60),
            max_contexts: 10_000,
        }
    }
}

/// The conversation agent runtime. Construct once per process.
pub struct AgentRuntime {
    contexts: RwLock<HashMap<ContextKey, Arc<Mutex<ConversationContext>>>>,
    completion: Arc<dyn CompletionBackend>,
    functions: Option<Arc<dyn FunctionExecutor>>,
    dedup: DedupCache,
    limits: AgentLimits,
}

impl AgentRuntime {
    pub fn new(
        completion: Arc<dyn CompletionBackend>,
        functions: Option<Arc<dyn FunctionExecutor>>,
        dedup_ttl: Duration,
        clock: Arc<dyn Clock>,
        limits: AgentLimits,
    ) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            completion,
            functions,
            dedup: DedupCache::new(dedup_ttl, clock),
            limits,
        }
    }

    async fn context_entry(&self, tenant_id: &str, client_key: &str) -> Arc<Mutex<ConversationContext>> {
        let key = ContextKey {
            tenant_id: tenant_id.to_string(),
            client_key: client_key.to_string(),
        };
        if let Some(entry) = self.contexts.read().await.get(&key) {
            return entry.clone();
        }
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationContext::new(tenant_id, client_key)))
            })
            .clone()
    }

    /// Run one turn: append the inbound message, classify, execute selected
    /// business functions, compose and append the reply. Internal failures are
    /// absorbed into a safe reply; the turn itself never errors.
    pub async fn process_message(&self, req: TurnRequest) -> TurnResult {
        if !req.already_deduped {
            if let Some(id) = &req.message_id {
                if !self.dedup.check_and_mark(&req.tenant_id, id).await {
                    log::debug!(
                        "agent: duplicate message {} for tenant {}, skipping",
                        id,
                        req.tenant_id
                    );
                    return TurnResult::silent("duplicate");
                }
            }
        }

        let entry = self.context_entry(&req.tenant_id, &req.client_key).await;
        // Held for the whole turn: appends for this client never interleave.
        let mut ctx = entry.lock().await;

        ctx.messages.push(ContextMessage::user(&req.text));
        ctx.last_message_at = Utc::now();

        let classification = tokio::time::timeout(
            self.limits.completion_timeout,
            self.completion.classify(&ctx),
        )
        .await;
        let classification = match classification {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                log::warn!("agent: classify failed for tenant {}: {}", req.tenant_id, e);
                return self.safe_turn(&mut ctx);
            }
            Err(_) => {
                log::warn!("agent: classify timed out for tenant {}", req.tenant_id);
                return self.safe_turn(&mut ctx);
            }
        };

        let (results, executed) = self.run_functions(&req.tenant_id, &classification).await;

        let (reply, compose_tokens) = if results.is_empty() {
            (classification.reply.clone(), 0)
        } else {
            let composed = tokio::time::timeout(
                self.limits.completion_timeout,
                self.completion
                    .compose(&ctx, &classification.intent, &results),
            )
            .await;
            match composed {
                Ok(Ok(c)) => (c.reply, c.tokens_used),
                Ok(Err(e)) => {
                    log::warn!("agent: compose failed for tenant {}: {}", req.tenant_id, e);
                    (self.reply_or_safe(&classification), 0)
                }
                Err(_) => {
                    log::warn!("agent: compose timed out for tenant {}", req.tenant_id);
                    (self.reply_or_safe(&classification), 0)
                }
            }
        };

        for (k, v) in &classification.extracted_info {
            ctx.extracted_info.insert(k.clone(), v.clone());
        }
        ctx.stage = advance_stage(ctx.stage, &classification.intent);
        if !reply.trim().is_empty() {
            ctx.messages.push(ContextMessage::assistant(&reply));
            ctx.last_message_at = Utc::now();
        }

        TurnResult {
            reply,
            tokens_used: classification.tokens_used + compose_tokens,
            functions_executed: executed,
            intent: classification.intent,
        }
    }

    fn reply_or_safe(&self, classification: &Classification) -> String {
        if classification.reply.trim().is_empty() {
            SAFE_REPLY.to_string()
        } else {
            classification.reply.clone()
        }
    }

    fn safe_turn(&self, ctx: &mut ConversationContext) -> TurnResult {
        ctx.messages.push(ContextMessage::assistant(SAFE_REPLY));
        ctx.last_message_at = Utc::now();
        TurnResult {
            reply: SAFE_REPLY.to_string(),
            tokens_used: 0,
            functions_executed: Vec::new(),
            intent: "unavailable".to_string(),
        }
    }

    async fn run_functions(
        &self,
        tenant_id: &str,
        classification: &Classification,
    ) -> (Vec<FunctionOutcome>, Vec<String>) {
        let mut results = Vec::new();
        let mut executed = Vec::new();
        for call in &classification.function_calls {
            let executor = match &self.functions {
                Some(e) => e,
                None => {
                    log::warn!("agent: function {} requested but no gateway configured", call.name);
                    results.push(FunctionOutcome::failure(
                        &call.name,
                        "function gateway not configured",
                    ));
                    continue;
                }
            };
            match executor.invoke(tenant_id, &call.name, &call.arguments).await {
                Ok(output) => {
                    executed.push(call.name.clone());
                    results.push(FunctionOutcome::success(&call.name, output));
                }
                Err(e) => {
                    log::warn!("agent: function {} failed: {}", call.name, e);
                    results.push(FunctionOutcome::failure(&call.name, e));
                }
            }
        }
        (results, executed)
    }

    /// Explicit eviction: test isolation and user-initiated "start over".
    pub async fn clear_context(&self, tenant_id: &str, client_key: &str) -> bool {
        let key = ContextKey {
            tenant_id: tenant_id.to_string(),
            client_key: client_key.to_string(),
        };
        self.contexts.write().await.remove(&key).is_some()
    }

    /// Clone of the current context, if any (tests, diagnostics).
    pub async fn context_snapshot(
        &self,
        tenant_id: &str,
        client_key: &str,
    ) -> Option<ConversationContext> {
        let key = ContextKey {
            tenant_id: tenant_id.to_string(),
            client_key: client_key.to_string(),
        };
        let entry = self.contexts.read().await.get(&key).cloned()?;
        let ctx = entry.lock().await;
        Some(ctx.clone())
    }

    /// Evict idle contexts and enforce the max-context bound (oldest first).
    /// Contexts mid-turn (mutex held) are skipped. Called from the background sweep.
    pub async fn prune_idle(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.limits.context_idle)
                .unwrap_or_else(|_| chrono::Duration::hours(2));
        let mut contexts = self.contexts.write().await;

        let mut idle: Vec<ContextKey> = Vec::new();
        for (key, entry) in contexts.iter() {
            if let Ok(ctx) = entry.try_lock() {
                if ctx.last_message_at < cutoff {
                    idle.push(key.clone());
                }
            }
        }
        for key in idle {
            contexts.remove(&key);
        }

        if contexts.len() > self.limits.max_contexts {
            let mut by_age: Vec<(ContextKey, DateTime<Utc>)> = Vec::new();
            for (key, entry) in contexts.iter() {
                if let Ok(ctx) = entry.try_lock() {
                    by_age.push((key.clone(), ctx.last_message_at));
                }
            }
            by_age.sort_by_key(|(_, at)| *at);
            let excess = contexts.len().saturating_sub(self.limits.max_contexts);
            for (key, _) in by_age.into_iter().take(excess) {
                contexts.remove(&key);
            }
        }
    }

    /// Purge the runtime-level dedup cache (background sweep).
    pub async fn purge_dedup(&self) {
        self.dedup.purge_expired().await;
    }
}

/// Map an intent onto the next stage. Stages only move forward; "start over" is
/// an explicit `clear_context`, not a backwards transition.
fn advance_stage(current: Stage, intent: &str) -> Stage {
    let proposed = match intent {
        "greeting" | "small_talk" => Stage::Initial,
        "property_inquiry" | "search" | "availability" => Stage::Discovery,
        "pricing" | "details" | "qualification" => Stage::Qualifying,
        "booking" | "reservation" | "negotiation" => Stage::Negotiating,
        "booking_confirmed" | "closed" => Stage::Closed,
        _ => current,
    };
    proposed.max(current)
}
