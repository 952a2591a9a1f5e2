//! Session manager lifecycle tests against a scripted channel backend.

use async_trait::async_trait;
use lib::cache::ManualClock;
use lib::channels::{
    ChannelBackend, ChannelError, ChannelProvider, ConnectionStatus, PairingStart,
};
use lib::config::SessionConfig;
use lib::session::{SessionManager, SessionStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockBackend {
    init_calls: AtomicUsize,
    status_calls: AtomicUsize,
    send_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    pairing_code: Option<String>,
    connected: AtomicBool,
    fail_status: AtomicBool,
    /// Status polls return no code until this many calls have happened.
    code_after_status_calls: usize,
    /// Simulated backend latency for init calls.
    init_delay_ms: u64,
}

#[async_trait]
impl ChannelBackend for MockBackend {
    fn id(&self) -> &str {
        "mock"
    }

    async fn initialize_session(&self, _tenant_id: &str) -> Result<PairingStart, ChannelError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.init_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.init_delay_ms)).await;
        }
        Ok(PairingStart {
            connected: self.connected.load(Ordering::SeqCst),
            pairing_code: if self.code_after_status_calls == 0 {
                self.pairing_code.clone()
            } else {
                None
            },
        })
    }

    async fn connection_status(&self, _tenant_id: &str) -> Result<ConnectionStatus, ChannelError> {
        let calls = self.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(ChannelError::Api("bridge unavailable".to_string()));
        }
        let connected = self.connected.load(Ordering::SeqCst);
        let code = if connected || calls < self.code_after_status_calls {
            None
        } else {
            self.pairing_code.clone()
        };
        Ok(ConnectionStatus {
            connected,
            state: Some(if connected { "open" } else { "connecting" }.to_string()),
            phone_number: connected.then(|| "+5511988887777".to_string()),
            display_name: connected.then(|| "Rentline Imoveis".to_string()),
            pairing_code: code,
        })
    }

    async fn disconnect(&self, _tenant_id: &str) -> Result<(), ChannelError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(
        &self,
        _tenant_id: &str,
        _to: &str,
        _text: &str,
    ) -> Result<String, ChannelError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        Ok("out-1".to_string())
    }
}

struct MockProvider {
    backend: Arc<MockBackend>,
    evictions: AtomicUsize,
}

impl MockProvider {
    fn new(backend: Arc<MockBackend>) -> Self {
        Self {
            backend,
            evictions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChannelProvider for MockProvider {
    async fn get(&self, _tenant_id: &str) -> Arc<dyn ChannelBackend> {
        self.backend.clone()
    }

    async fn evict(&self, _tenant_id: &str) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        status_ttl_secs: 5,
        pairing_ttl_secs: 60,
        init_cooldown_secs: 30,
        poll_attempts: 5,
        poll_interval_ms: 10,
        poll_deadline_secs: 5,
        request_timeout_secs: 2,
    }
}

fn manager_with(
    backend: Arc<MockBackend>,
) -> (SessionManager, Arc<MockProvider>, Arc<ManualClock>) {
    let provider = Arc::new(MockProvider::new(backend));
    let clock = Arc::new(ManualClock::new());
    let manager = SessionManager::new(provider.clone(), &fast_config(), clock.clone());
    (manager, provider, clock)
}

#[tokio::test]
async fn init_returns_pairing_code_and_reuses_it_while_live() {
    let backend = Arc::new(MockBackend {
        pairing_code: Some("CODE-1".to_string()),
        ..Default::default()
    });
    let (manager, _provider, _clock) = manager_with(backend.clone());

    let first = manager.initialize_session("t1").await;
    assert_eq!(first.status, SessionStatus::PairingPending);
    assert_eq!(first.pairing_code.as_deref(), Some("CODE-1"));

    // A dashboard poll hitting init again must not regenerate the code.
    let second = manager.initialize_session("t1").await;
    assert_eq!(second.pairing_code.as_deref(), Some("CODE-1"));
    assert_eq!(backend.init_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_init_performs_one_backend_call() {
    let backend = Arc::new(MockBackend {
        pairing_code: Some("CODE-1".to_string()),
        init_delay_ms: 200,
        ..Default::default()
    });
    let (manager, _provider, _clock) = manager_with(backend.clone());
    let manager = Arc::new(manager);

    let first_manager = manager.clone();
    let first = tokio::spawn(async move { first_manager.initialize_session("t1").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A dashboard poll arriving mid-init returns without a second backend call.
    let second = manager.initialize_session("t1").await;
    assert_ne!(second.status, SessionStatus::Connected);

    let first = first.await.expect("init task");
    assert_eq!(first.pairing_code.as_deref(), Some("CODE-1"));
    assert_eq!(backend.init_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_pairing_code_is_regenerated() {
    let backend = Arc::new(MockBackend {
        pairing_code: Some("CODE-1".to_string()),
        ..Default::default()
    });
    let (manager, _provider, clock) = manager_with(backend.clone());

    let first = manager.initialize_session("t1").await;
    assert_eq!(first.pairing_code.as_deref(), Some("CODE-1"));

    clock.advance(Duration::from_secs(61));
    let second = manager.initialize_session("t1").await;
    assert_eq!(second.status, SessionStatus::PairingPending);
    assert_eq!(backend.init_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn init_polls_until_a_code_appears() {
    let backend = Arc::new(MockBackend {
        pairing_code: Some("CODE-9".to_string()),
        code_after_status_calls: 3,
        ..Default::default()
    });
    let (manager, _provider, _clock) = manager_with(backend.clone());

    let snap = manager.initialize_session("t1").await;
    assert_eq!(snap.status, SessionStatus::PairingPending);
    assert_eq!(snap.pairing_code.as_deref(), Some("CODE-9"));
    assert!(backend.status_calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn init_exhausting_poll_budget_degrades() {
    let backend = Arc::new(MockBackend {
        pairing_code: None,
        code_after_status_calls: 100,
        ..Default::default()
    });
    let (manager, _provider, _clock) = manager_with(backend.clone());

    let snap = manager.initialize_session("t1").await;
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.message.is_some());
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn status_is_cached_within_ttl() {
    let backend = Arc::new(MockBackend::default());
    backend.connected.store(true, Ordering::SeqCst);
    let (manager, _provider, clock) = manager_with(backend.clone());

    let first = manager.get_status("t1").await;
    assert!(first.connected);
    assert_eq!(first.phone_number.as_deref(), Some("+5511988887777"));

    let second = manager.get_status("t1").await;
    assert!(second.connected);
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(6));
    let third = manager.get_status("t1").await;
    assert!(third.connected);
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn backend_failure_degrades_and_is_not_cached() {
    let backend = Arc::new(MockBackend::default());
    backend.fail_status.store(true, Ordering::SeqCst);
    let (manager, _provider, _clock) = manager_with(backend.clone());

    let snap = manager.get_status("t1").await;
    assert_eq!(snap.status, SessionStatus::Error);
    assert!(snap.message.as_deref().unwrap_or("").contains("unavailable"));

    // Degraded results must not poison the cache: recovery is visible immediately.
    backend.fail_status.store(false, Ordering::SeqCst);
    backend.connected.store(true, Ordering::SeqCst);
    let recovered = manager.get_status("t1").await;
    assert!(recovered.connected);
}

#[tokio::test]
async fn disconnect_evicts_handle_and_resets_state() {
    let backend = Arc::new(MockBackend::default());
    backend.connected.store(true, Ordering::SeqCst);
    let (manager, provider, _clock) = manager_with(backend.clone());

    let _ = manager.get_status("t1").await;
    manager.disconnect("t1").await;

    assert_eq!(backend.disconnect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.evictions.load(Ordering::SeqCst), 1);
    let snap = manager.local_snapshot("t1").await;
    assert_eq!(snap.status, SessionStatus::Disconnected);
    assert!(snap.pairing_code.is_none());
}

#[tokio::test]
async fn pairing_event_is_served_from_cache() {
    let backend = Arc::new(MockBackend::default());
    let (manager, _provider, _clock) = manager_with(backend.clone());

    manager.apply_pairing_event("t1", "CODE-WS").await;
    let snap = manager.get_status("t1").await;
    assert_eq!(snap.status, SessionStatus::PairingPending);
    assert_eq!(snap.pairing_code.as_deref(), Some("CODE-WS"));
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn status_event_mid_scan_keeps_the_live_pairing_code() {
    // The backend would hand out a different code if anything fell through to it.
    let backend = Arc::new(MockBackend {
        pairing_code: Some("CODE-B".to_string()),
        ..Default::default()
    });
    let (manager, _provider, clock) = manager_with(backend.clone());

    manager.apply_pairing_event("t1", "CODE-A").await;
    manager
        .apply_status_event(
            "t1",
            &ConnectionStatus {
                connected: false,
                state: Some("connecting".to_string()),
                ..Default::default()
            },
        )
        .await;

    // Well past the short status TTL but inside the pairing window.
    clock.advance(Duration::from_secs(6));
    let snap = manager.get_status("t1").await;
    assert_eq!(snap.pairing_code.as_deref(), Some("CODE-A"));
    assert_eq!(backend.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn status_event_marks_connected_and_clears_code() {
    let backend = Arc::new(MockBackend::default());
    let (manager, _provider, _clock) = manager_with(backend);

    manager.apply_pairing_event("t1", "CODE-WS").await;
    manager
        .apply_status_event(
            "t1",
            &ConnectionStatus {
                connected: true,
                state: Some("open".to_string()),
                phone_number: Some("+5511988887777".to_string()),
                display_name: Some("Rentline Imoveis".to_string()),
                pairing_code: None,
            },
        )
        .await;

    let snap = manager.get_status("t1").await;
    assert!(snap.connected);
    assert_eq!(snap.status, SessionStatus::Connected);
    assert!(snap.pairing_code.is_none());
    assert_eq!(snap.business_name.as_deref(), Some("Rentline Imoveis"));
}
