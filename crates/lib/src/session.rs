//! Per-tenant pairing/connection lifecycle.
//!
//! The session manager owns the tenant session state machine, the status cache
//! (short TTL normally, extended TTL while a pairing code is outstanding), and the
//! init-cooldown guard that keeps a dashboard poll from starting a second pairing
//! attempt while one is already in flight. Backend failures degrade to a
//! well-formed error snapshot; callers always get something renderable.

use crate::cache::{Clock, ExpiringMap};
use crate::channels::{ChannelProvider, ConnectionStatus};
use crate::config::SessionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Session lifecycle states. `Error` is reachable from anywhere and goes back to
/// `Disconnected` on the next successful init or explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    PairingPending,
    Scanning,
    Connected,
    Error,
}

/// What the dashboard (and the webhook fallback path) sees: always well-formed,
/// never an exception. `message` carries the diagnostic on degradation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub connected: bool,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusSnapshot {
    fn disconnected() -> Self {
        Self {
            connected: false,
            status: SessionStatus::Disconnected,
            phone_number: None,
            business_name: None,
            pairing_code: None,
            message: None,
        }
    }

    /// Safe default returned when the channel backend errored.
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            connected: false,
            status: SessionStatus::Error,
            phone_number: None,
            business_name: None,
            pairing_code: None,
            message: Some(message.into()),
        }
    }
}

/// One tenant's session record. Created on first status/init call, never removed;
/// transitions back to `Disconnected` instead.
#[derive(Debug, Clone)]
struct TenantSession {
    status: SessionStatus,
    pairing_code: Option<String>,
    pairing_generated_at: Option<Instant>,
    phone_number: Option<String>,
    display_name: Option<String>,
    last_activity_at: DateTime<Utc>,
    init_in_progress: bool,
    init_started_at: Option<Instant>,
}

impl TenantSession {
    fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            pairing_code: None,
            pairing_generated_at: None,
            phone_number: None,
            display_name: None,
            last_activity_at: Utc::now(),
            init_in_progress: false,
            init_started_at: None,
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: self.status == SessionStatus::Connected,
            status: self.status,
            phone_number: self.phone_number.clone(),
            business_name: self.display_name.clone(),
            pairing_code: self.pairing_code.clone(),
            message: None,
        }
    }
}

/// Owns the pairing/connection lifecycle for every tenant.
pub struct SessionManager {
    provider: Arc<dyn ChannelProvider>,
    sessions: RwLock<HashMap<String, TenantSession>>,
    status_cache: ExpiringMap<String, StatusSnapshot>,
    clock: Arc<dyn Clock>,
    status_ttl: Duration,
    pairing_ttl: Duration,
    init_cooldown: Duration,
    poll_attempts: u32,
    poll_interval: Duration,
    poll_deadline: Duration,
    request_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        config: &SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let status_ttl = Duration::from_secs(config.status_ttl_secs);
        Self {
            provider,
            sessions: RwLock::new(HashMap::new()),
            status_cache: ExpiringMap::new(status_ttl, clock.clone()),
            clock,
            status_ttl,
            pairing_ttl: Duration::from_secs(config.pairing_ttl_secs),
            init_cooldown: Duration::from_secs(config.init_cooldown_secs),
            poll_attempts: config.poll_attempts,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            poll_deadline: Duration::from_secs(config.poll_deadline_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    fn elapsed_since(&self, earlier: Option<Instant>) -> Duration {
        match earlier {
            Some(at) => self.clock.now().saturating_duration_since(at),
            None => Duration::MAX,
        }
    }

    /// Start pairing for a tenant, or return the in-flight/cached state.
    ///
    /// Guards: a second call during the init cooldown returns the last known
    /// status without touching the backend; a pairing code younger than the
    /// pairing TTL is returned as-is so a user mid-scan never sees it replaced.
    pub async fn initialize_session(&self, tenant_id: &str) -> StatusSnapshot {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(tenant_id.to_string())
                .or_insert_with(TenantSession::new);

            if session.init_in_progress
                && self.elapsed_since(session.init_started_at) < self.init_cooldown
            {
                log::debug!("init for tenant {} already in progress, returning cached", tenant_id);
                if let Some(snap) = self.status_cache.get(&tenant_id.to_string()).await {
                    return snap;
                }
                return session.snapshot();
            }

            if session.status != SessionStatus::Connected && session.pairing_code.is_some() {
                if self.elapsed_since(session.pairing_generated_at) < self.pairing_ttl {
                    log::debug!("tenant {} has a live pairing code, not regenerating", tenant_id);
                    let snap = session.snapshot();
                    self.status_cache
                        .insert_with_ttl(tenant_id.to_string(), snap.clone(), self.pairing_ttl)
                        .await;
                    return snap;
                }
                // Expired code: request a fresh one below.
                session.pairing_code = None;
                session.pairing_generated_at = None;
            }

            session.init_in_progress = true;
            session.init_started_at = Some(self.clock.now());
            session.status = SessionStatus::Connecting;
        }

        let snap = self.run_init(tenant_id).await;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(tenant_id) {
                session.init_in_progress = false;
                session.status = snap.status;
                session.phone_number = snap.phone_number.clone();
                session.display_name = snap.business_name.clone();
                session.last_activity_at = Utc::now();
                if let Some(code) = &snap.pairing_code {
                    if session.pairing_code.as_deref() != Some(code.as_str()) {
                        session.pairing_generated_at = Some(self.clock.now());
                    }
                    session.pairing_code = Some(code.clone());
                } else if snap.status == SessionStatus::Connected {
                    session.pairing_code = None;
                    session.pairing_generated_at = None;
                }
            }
        }

        let ttl = if snap.pairing_code.is_some() {
            self.pairing_ttl
        } else {
            self.status_ttl
        };
        self.status_cache
            .insert_with_ttl(tenant_id.to_string(), snap.clone(), ttl)
            .await;
        snap
    }

    /// Backend pairing call plus the bounded pairing-code poll. Never errors:
    /// failures come back as a degraded snapshot.
    async fn run_init(&self, tenant_id: &str) -> StatusSnapshot {
        let backend = self.provider.get(tenant_id).await;
        let start = tokio::time::timeout(self.request_timeout, backend.initialize_session(tenant_id)).await;
        let start = match start {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                log::warn!("init for tenant {} failed: {}", tenant_id, e);
                return StatusSnapshot::degraded(format!("session init failed: {}", e));
            }
            Err(_) => {
                log::warn!("init for tenant {} timed out", tenant_id);
                return StatusSnapshot::degraded("session init timed out");
            }
        };

        if start.connected {
            return self.probe_connected(tenant_id).await;
        }
        if let Some(code) = start.pairing_code {
            return StatusSnapshot {
                connected: false,
                status: SessionStatus::PairingPending,
                phone_number: None,
                business_name: None,
                pairing_code: Some(code),
                message: None,
            };
        }

        // No code yet: poll, bounded by both attempt count and wall-clock deadline.
        let deadline = self.clock.now() + self.poll_deadline;
        for attempt in 0..self.poll_attempts {
            if self.clock.now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
            let status =
                tokio::time::timeout(self.request_timeout, backend.connection_status(tenant_id))
                    .await;
            match status {
                Ok(Ok(cs)) if cs.connected => {
                    return snapshot_from_backend(&cs);
                }
                Ok(Ok(cs)) if cs.pairing_code.is_some() => {
                    let mut snap = snapshot_from_backend(&cs);
                    snap.status = SessionStatus::PairingPending;
                    return snap;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    log::debug!(
                        "pairing poll {} for tenant {} errored: {}",
                        attempt,
                        tenant_id,
                        e
                    );
                }
                Err(_) => {
                    log::debug!("pairing poll {} for tenant {} timed out", attempt, tenant_id);
                }
            }
        }
        log::warn!("tenant {} produced no pairing code within the poll budget", tenant_id);
        StatusSnapshot::degraded("pairing code not available yet, retry shortly")
    }

    async fn probe_connected(&self, tenant_id: &str) -> StatusSnapshot {
        let backend = self.provider.get(tenant_id).await;
        match tokio::time::timeout(self.request_timeout, backend.connection_status(tenant_id)).await
        {
            Ok(Ok(cs)) => snapshot_from_backend(&cs),
            _ => StatusSnapshot {
                connected: true,
                status: SessionStatus::Connected,
                phone_number: None,
                business_name: None,
                pairing_code: None,
                message: None,
            },
        }
    }

    /// Cached status when fresh; otherwise query the backend and cache the
    /// normalized result. Backend errors degrade to a safe snapshot instead of
    /// propagating, so polling dashboards always render something.
    pub async fn get_status(&self, tenant_id: &str) -> StatusSnapshot {
        if let Some(snap) = self.status_cache.get(&tenant_id.to_string()).await {
            return snap;
        }

        let backend = self.provider.get(tenant_id).await;
        let status =
            tokio::time::timeout(self.request_timeout, backend.connection_status(tenant_id)).await;
        let snap = match status {
            Ok(Ok(cs)) => snapshot_from_backend(&cs),
            Ok(Err(e)) => {
                log::warn!("status for tenant {} failed: {}", tenant_id, e);
                return StatusSnapshot::degraded(format!("status unavailable: {}", e));
            }
            Err(_) => {
                log::warn!("status for tenant {} timed out", tenant_id);
                return StatusSnapshot::degraded("status request timed out");
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(tenant_id.to_string())
                .or_insert_with(TenantSession::new);
            session.status = snap.status;
            session.phone_number = snap.phone_number.clone();
            session.display_name = snap.business_name.clone();
            if let Some(code) = &snap.pairing_code {
                if session.pairing_code.as_deref() != Some(code.as_str()) {
                    session.pairing_generated_at = Some(self.clock.now());
                }
                session.pairing_code = Some(code.clone());
            }
        }

        let ttl = if snap.pairing_code.is_some() {
            self.pairing_ttl
        } else {
            self.status_ttl
        };
        self.status_cache
            .insert_with_ttl(tenant_id.to_string(), snap.clone(), ttl)
            .await;
        snap
    }

    /// Best-effort teardown. Backend failure is logged, not surfaced: the
    /// dashboard must not get stuck on a disconnect error. The cached handle is
    /// evicted so no later call reuses a dead session.
    pub async fn disconnect(&self, tenant_id: &str) {
        let backend = self.provider.get(tenant_id).await;
        match tokio::time::timeout(self.request_timeout, backend.disconnect(tenant_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("disconnect for tenant {} failed: {}", tenant_id, e),
            Err(_) => log::warn!("disconnect for tenant {} timed out", tenant_id),
        }
        self.provider.evict(tenant_id).await;
        self.status_cache.remove(&tenant_id.to_string()).await;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(tenant_id.to_string())
            .or_insert_with(TenantSession::new);
        session.status = SessionStatus::Disconnected;
        session.pairing_code = None;
        session.pairing_generated_at = None;
        session.init_in_progress = false;
        session.last_activity_at = Utc::now();
    }

    /// Outbound send for one tenant's session (used by the agent fallback reply).
    pub async fn send(&self, tenant_id: &str, to: &str, text: &str) -> Result<String, String> {
        let backend = self.provider.get(tenant_id).await;
        let sent = tokio::time::timeout(self.request_timeout, backend.send_message(tenant_id, to, text))
            .await
            .map_err(|_| "send timed out".to_string())?
            .map_err(|e| e.to_string())?;
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(tenant_id) {
            session.last_activity_at = Utc::now();
        }
        Ok(sent)
    }

    /// Webhook-driven pairing code refresh. The new code is cached under the
    /// extended TTL so dashboard polls serve it without a backend round-trip.
    pub async fn apply_pairing_event(&self, tenant_id: &str, pairing_code: &str) {
        let snap = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(tenant_id.to_string())
                .or_insert_with(TenantSession::new);
            session.status = SessionStatus::PairingPending;
            session.pairing_code = Some(pairing_code.to_string());
            session.pairing_generated_at = Some(self.clock.now());
            session.last_activity_at = Utc::now();
            session.snapshot()
        };
        self.status_cache
            .insert_with_ttl(tenant_id.to_string(), snap, self.pairing_ttl)
            .await;
    }

    /// Webhook-driven status update (e.g. the channel reports connected or a drop).
    pub async fn apply_status_event(&self, tenant_id: &str, status: &ConnectionStatus) {
        let snap = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(tenant_id.to_string())
                .or_insert_with(TenantSession::new);
            session.status = session_status_from(status);
            if status.connected {
                session.pairing_code = None;
                session.pairing_generated_at = None;
            }
            if status.phone_number.is_some() {
                session.phone_number = status.phone_number.clone();
            }
            if status.display_name.is_some() {
                session.display_name = status.display_name.clone();
            }
            session.last_activity_at = Utc::now();
            session.snapshot()
        };
        // A code still outstanding keeps the extended window; a short TTL here
        // would let the next poll hit the backend and replace it mid-scan.
        let ttl = if snap.pairing_code.is_some() {
            self.pairing_ttl
        } else {
            self.status_ttl
        };
        self.status_cache
            .insert_with_ttl(tenant_id.to_string(), snap, ttl)
            .await;
    }

    /// Last locally known snapshot without touching cache or backend (tests, diagnostics).
    pub async fn local_snapshot(&self, tenant_id: &str) -> StatusSnapshot {
        let sessions = self.sessions.read().await;
        sessions
            .get(tenant_id)
            .map(|s| s.snapshot())
            .unwrap_or_else(StatusSnapshot::disconnected)
    }
}

fn session_status_from(cs: &ConnectionStatus) -> SessionStatus {
    if cs.connected {
        return SessionStatus::Connected;
    }
    match cs.state.as_deref() {
        Some("open") => SessionStatus::Connected,
        Some("connecting") => SessionStatus::Connecting,
        Some("qr") | Some("pairing") => SessionStatus::PairingPending,
        Some("scanning") => SessionStatus::Scanning,
        Some("close") | Some("closed") | None => {
            if cs.pairing_code.is_some() {
                SessionStatus::PairingPending
            } else {
                SessionStatus::Disconnected
            }
        }
        Some(other) => {
            log::debug!("unknown channel state label: {}", other);
            if cs.pairing_code.is_some() {
                SessionStatus::PairingPending
            } else {
                SessionStatus::Disconnected
            }
        }
    }
}

fn snapshot_from_backend(cs: &ConnectionStatus) -> StatusSnapshot {
    StatusSnapshot {
        connected: cs.connected,
        status: session_status_from(cs),
        phone_number: cs.phone_number.clone(),
        business_name: cs.display_name.clone(),
        pairing_code: cs.pairing_code.clone(),
        message: None,
    }
}
