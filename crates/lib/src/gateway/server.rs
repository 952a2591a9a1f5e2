//! Gateway HTTP server: webhook ingress plus the dashboard session endpoints.
//!
//! The webhook handler acknowledges with 200 for everything except a failed
//! auth check. Duplicates, noise payloads, and downstream failures are handled
//! (or logged) and still acknowledged, so the channel never re-delivers what we
//! have already seen.

use crate::agent::{AgentLimits, AgentRuntime};
use crate::cache::SystemClock;
use crate::channels::ChannelFactory;
use crate::config::{
    self, Config, resolve_functions_url, resolve_hosted_api_key, resolve_webhook_secret,
    resolve_webhook_token, resolve_workflow_secret, resolve_workflow_url,
};
use crate::dedup::DedupCache;
use crate::functions::{FunctionExecutor, FunctionGateway};
use crate::gateway::auth::WebhookAuth;
use crate::gateway::protocol::{ApiResponse, WebhookEvent};
use crate::llm::CompletionClient;
use crate::session::SessionManager;
use crate::workflow::{Dispatcher, WorkflowClient};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Ceiling on how long the webhook handler waits for a dispatch before
/// acknowledging. The dispatch itself keeps running past it.
const DISPATCH_ACK_DEADLINE: Duration = Duration::from_secs(30);

/// Everything the handlers need, constructed once in [`run_gateway`] (tests
/// build it directly around mocks).
pub struct AppState {
    pub auth: WebhookAuth,
    pub dedup: Arc<DedupCache>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub agent: Arc<AgentRuntime>,
    pub port: u16,
    pub dispatch_deadline: Duration,
}

type SharedState = Arc<AppState>;

/// Router with all gateway routes. Exposed separately so tests can serve it on
/// a free port.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/webhook", post(webhook))
        .route(
            "/session",
            get(session_status)
                .post(session_init)
                .delete(session_disconnect),
        )
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rentline-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
    }))
}

/// POST /webhook. Auth first (against the raw body), then parse the tagged
/// event union, then dedup, then dispatch. The dispatch is awaited so the
/// fallback reply, when taken, completes before the acknowledgement.
async fn webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse>) {
    if !state.auth.verify(&headers, &body) {
        log::warn!("webhook delivery rejected: authentication failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse::error("unauthorized")),
        );
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            // Unknown shapes are acknowledged so the channel stops re-delivering.
            log::info!("webhook payload did not match any known event: {}", e);
            return (StatusCode::OK, Json(ApiResponse::accepted()));
        }
    };

    match event {
        WebhookEvent::Message(envelope) => {
            let Some(inbound) = envelope.normalize() else {
                log::debug!(
                    "dropping noise message event for tenant {}",
                    envelope.tenant_id
                );
                return (StatusCode::OK, Json(ApiResponse::accepted()));
            };
            if !state
                .dedup
                .check_and_mark(&inbound.tenant_id, &inbound.message_id)
                .await
            {
                log::debug!(
                    "duplicate message {} for tenant {}, acknowledged without processing",
                    inbound.message_id,
                    inbound.tenant_id
                );
                return (StatusCode::OK, Json(ApiResponse::accepted()));
            }
            let tenant_id = inbound.tenant_id.clone();
            let message_id = inbound.message_id.clone();
            let dispatcher = state.dispatcher.clone();
            let dispatch = tokio::spawn(async move { dispatcher.dispatch(inbound).await });
            match tokio::time::timeout(state.dispatch_deadline, dispatch).await {
                Ok(Ok(outcome)) => log::debug!("webhook message dispatched: {:?}", outcome),
                Ok(Err(e)) => log::error!(
                    "dispatch task for tenant {} message {} failed: {}",
                    tenant_id,
                    message_id,
                    e
                ),
                Err(_) => log::warn!(
                    "dispatch for tenant {} message {} still running at the ack deadline, acknowledging now",
                    tenant_id,
                    message_id
                ),
            }
        }
        WebhookEvent::StatusChange(envelope) => {
            state
                .sessions
                .apply_status_event(&envelope.tenant_id, &envelope.data.to_connection_status())
                .await;
        }
        WebhookEvent::PairingCode(envelope) => match &envelope.data.pairing_code {
            Some(code) if !code.trim().is_empty() => {
                state
                    .sessions
                    .apply_pairing_event(&envelope.tenant_id, code.trim())
                    .await;
            }
            _ => {
                log::debug!(
                    "pairing_code event without a code for tenant {}",
                    envelope.tenant_id
                );
            }
        },
    }

    (StatusCode::OK, Json(ApiResponse::accepted()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    #[serde(default)]
    tenant_id: String,
}

impl SessionQuery {
    fn tenant(&self) -> Option<&str> {
        let t = self.tenant_id.trim();
        if t.is_empty() {
            None
        } else {
            Some(t)
        }
    }
}

/// GET /session?tenantId=... Always 200 with a snapshot; backend trouble shows
/// up as a degraded snapshot, never an error status.
async fn session_status(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(tenant_id) = query.tenant() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("tenantId is required")),
        );
    };
    let snap = state.sessions.get_status(tenant_id).await;
    (StatusCode::OK, Json(ApiResponse::with_status(snap)))
}

/// POST /session?tenantId=... Starts (or reports) pairing for the tenant.
async fn session_init(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(tenant_id) = query.tenant() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("tenantId is required")),
        );
    };
    let snap = state.sessions.initialize_session(tenant_id).await;
    (StatusCode::OK, Json(ApiResponse::with_status(snap)))
}

/// DELETE /session?tenantId=... Best-effort teardown; always acknowledged.
async fn session_disconnect(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(tenant_id) = query.tenant() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("tenantId is required")),
        );
    };
    state.sessions.disconnect(tenant_id).await;
    (StatusCode::OK, Json(ApiResponse::accepted()))
}

/// Wire the full component graph from config and serve until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    let clock = Arc::new(SystemClock);

    let auth = WebhookAuth::new(resolve_webhook_token(&config), resolve_webhook_secret(&config));
    if auth.token.is_none() && auth.secret.is_none() {
        log::warn!(
            "no webhook token or secret configured; every webhook delivery will be rejected"
        );
    }

    let request_timeout = Duration::from_secs(config.session.request_timeout_secs);
    let factory = Arc::new(ChannelFactory::new(
        config.channels.clone(),
        resolve_hosted_api_key(&config),
        request_timeout,
    ));
    let sessions = Arc::new(SessionManager::new(
        factory,
        &config.session,
        clock.clone(),
    ));

    let completion = Arc::new(CompletionClient::new(
        &config.agent.completion_url,
        config.agent.model.clone(),
        config.agent.history_window,
    ));
    let functions: Option<Arc<dyn FunctionExecutor>> = resolve_functions_url(&config)
        .map(|url| Arc::new(FunctionGateway::new(&url, request_timeout)) as Arc<dyn FunctionExecutor>);
    let agent = Arc::new(AgentRuntime::new(
        completion,
        functions,
        config.dedup.ttl(),
        clock.clone(),
        AgentLimits {
            completion_timeout: config.agent.completion_timeout(),
            context_idle: config.agent.context_idle(),
            max_contexts: config.agent.max_contexts,
        },
    ));

    let workflow = WorkflowClient::from_parts(
        resolve_workflow_url(&config),
        resolve_workflow_secret(&config),
        config.workflow.timeout(),
    );
    if workflow.is_none() {
        log::info!("workflow engine not configured; the local agent handles all messages");
    }
    let dispatcher = Arc::new(Dispatcher::new(
        workflow,
        agent.clone(),
        sessions.clone(),
        config.agent.fallback_timeout(),
    ));

    let dedup = Arc::new(DedupCache::new(config.dedup.ttl(), clock));

    let state = Arc::new(AppState {
        auth,
        dedup: dedup.clone(),
        sessions: sessions.clone(),
        dispatcher,
        agent: agent.clone(),
        port: config.gateway.port,
        dispatch_deadline: DISPATCH_ACK_DEADLINE,
    });

    // Periodic maintenance: drop expired dedup entries and idle conversations.
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            dedup.purge_expired().await;
            agent.purge_dedup().await;
            agent.prune_idle().await;
        }
    });

    let app = build_router(state);

    let bind = config.gateway.bind.clone();
    if !config::is_loopback_bind(&bind) {
        log::warn!("gateway binding non-loopback address {}", bind);
    }
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    sweep.abort();
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}
