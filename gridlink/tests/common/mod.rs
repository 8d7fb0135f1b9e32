//! Shared fakes for the connection manager tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use gridlink::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed(Duration),
    Fail(Duration),
    Hang,
}

pub struct FakeTransport {
    state: watch::Sender<TransportState>,
    stats: Mutex<ConnectionStats>,
    closes: AtomicU32,
    closing: Notify,
    close_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(TransportState::Connected);
        Arc::new(Self {
            state,
            stats: Mutex::new(ConnectionStats {
                round_trip_time: Some(Duration::from_millis(30)),
                ..ConnectionStats::default()
            }),
            closes: AtomicU32::new(0),
            closing: Notify::new(),
            close_gate: Mutex::new(None),
        })
    }

    pub fn lose(&self) {
        self.state.send_replace(TransportState::Disconnected);
    }

    pub fn transfer(&self, sent: u64, received: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_sent += sent;
        stats.bytes_received += received;
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make `close` block until the returned gate is notified
    pub fn hold_close(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.close_gate.lock() = Some(gate.clone());
        gate
    }

    /// Resolves once `close` has been entered
    pub async fn closing(&self) {
        self.closing.notified().await;
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn stats(&self) -> Result<ConnectionStats, GridError> {
        Ok(self.stats.lock().clone())
    }

    async fn close(&self) -> Result<(), GridError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closing.notify_one();
        let gate = self.close_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.state.send_replace(TransportState::Closed);
        Ok(())
    }
}

/// Connector whose tiers follow a script; the last entry of a tier repeats
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<ConnectionTier, VecDeque<Script>>>,
    calls: Mutex<Vec<TransportConfig>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl ScriptedConnector {
    pub fn new(scripts: &[(ConnectionTier, Script)]) -> Arc<Self> {
        let connector = Self::default();
        {
            let mut map = connector.scripts.lock();
            for (tier, script) in scripts {
                map.entry(*tier).or_default().push_back(*script);
            }
        }
        Arc::new(connector)
    }

    pub fn tiers(&self) -> Vec<ConnectionTier> {
        self.calls.lock().iter().map(|c| c.tier).collect()
    }

    pub fn calls(&self) -> Vec<TransportConfig> {
        self.calls.lock().clone()
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock()[index].clone()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    fn next_script(&self, tier: ConnectionTier) -> Script {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&tier) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Script::Hang),
            Some(queue) => queue.front().copied().unwrap_or(Script::Hang),
            None => Script::Hang,
        }
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn establish(
        &self,
        _grid_id: &str,
        config: TransportConfig,
    ) -> Result<Arc<dyn PeerTransport>, GridError> {
        let tier = config.tier;
        self.calls.lock().push(config);
        match self.next_script(tier) {
            Script::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                let transport = FakeTransport::new();
                self.transports.lock().push(transport.clone());
                Ok(transport)
            }
            Script::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(GridError::Transport {
                    reason: "ice failed".to_string(),
                })
            }
            Script::Hang => std::future::pending().await,
        }
    }
}

pub struct FakeBilling {
    config: Mutex<Result<RelayConfig, BillingError>>,
    reports: Mutex<Vec<(u64, u64)>>,
    failing_reports: AtomicU32,
}

impl FakeBilling {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(Ok(config)),
            reports: Mutex::new(Vec::new()),
            failing_reports: AtomicU32::new(0),
        })
    }

    pub fn set_used_gb(&self, used_gb: f64) {
        if let Ok(config) = self.config.lock().as_mut() {
            if let Some(allocation) = config.allocation.as_mut() {
                allocation.used_gb = used_gb;
            }
        }
    }

    pub fn fail_next_reports(&self, count: u32) {
        self.failing_reports.store(count, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<(u64, u64)> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl BillingClient for FakeBilling {
    async fn get_relay_config(&self, _grid_id: &str) -> Result<RelayConfig, BillingError> {
        self.config.lock().clone()
    }

    async fn report_usage(&self, _: &str, sent: u64, received: u64) -> Result<(), BillingError> {
        let failing = self.failing_reports.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reports.store(failing - 1, Ordering::SeqCst);
            return Err(BillingError::Request {
                status: Some(503),
                reason: "billing unavailable".to_string(),
            });
        }
        self.reports.lock().push((sent, received));
        Ok(())
    }

    async fn update_relay_mode(&self, _: &str, mode: RelayMode) -> Result<(), BillingError> {
        if let Ok(config) = self.config.lock().as_mut() {
            config.relay_mode = mode;
        }
        Ok(())
    }

    async fn purchase_bandwidth(
        &self,
        _: &str,
        gb: u32,
        _months: u32,
    ) -> Result<PaymentIntent, BillingError> {
        if let Ok(config) = self.config.lock().as_mut() {
            if let Some(allocation) = config.allocation.as_mut() {
                allocation.purchased_gb += f64::from(gb);
            }
        }
        Ok(PaymentIntent {
            id: "pi_test".to_string(),
            client_secret: "pi_test_secret".to_string(),
            amount_cents: u64::from(gb) * 50,
            currency: "usd".to_string(),
        })
    }
}

struct NullPeer;

#[async_trait]
impl MediaPeer for NullPeer {
    async fn set_remote_description(&self, _: SessionDescription) -> Result<(), GridError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, GridError> {
        Ok("offer".to_string())
    }

    async fn create_answer(&self) -> Result<String, GridError> {
        Ok("answer".to_string())
    }

    async fn add_ice_candidate(&self, _: IceCandidate) -> Result<(), GridError> {
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, GridError> {
        Ok(track.id().to_string())
    }

    async fn remove_track(&self, _: &SenderId) -> Result<(), GridError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), GridError> {
        Ok(())
    }
}

struct NullFactory;

#[async_trait]
impl MediaPeerFactory for NullFactory {
    async fn create(
        &self,
        _participant_id: &str,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>, GridError> {
        Ok(Arc::new(NullPeer))
    }
}

struct NullChannel;

#[async_trait]
impl SignalingChannel for NullChannel {
    async fn send(&self, _: SignalingEnvelope) -> Result<(), GridError> {
        Ok(())
    }
}

pub fn relay_config(mode: RelayMode, purchased_gb: f64, used_gb: f64) -> RelayConfig {
    RelayConfig {
        relay_mode: mode,
        allocation: Some(RelayAllocation {
            purchased_gb,
            used_gb,
            expires_at: Utc::now() + chrono::Duration::days(30),
            status: AllocationStatus::Active,
        }),
        turn_credentials: Some(TurnCredentials {
            username: "grid-user".to_string(),
            credential: "grid-secret".to_string(),
        }),
        relay_servers: vec![
            RelayServer {
                region: "eu-west".to_string(),
                urls: vec!["turn:eu.relay.example.net:3478".to_string()],
                is_healthy: true,
            },
            RelayServer {
                region: "us-east".to_string(),
                urls: vec!["turn:us.relay.example.net:3478".to_string()],
                is_healthy: false,
            },
        ],
    }
}

pub fn grid_link(
    connector: Arc<ScriptedConnector>,
    billing: Arc<FakeBilling>,
    config: GridConfig,
) -> GridLink {
    GridLink::builder()
        .config(config)
        .local_user_id("alice")
        .connector(connector)
        .billing(billing)
        .media_factory(Arc::new(NullFactory))
        .signaling(Arc::new(NullChannel))
        .build()
        .expect("complete builder")
}

/// Drain everything currently buffered on a stream
pub fn drain(events: &mut EventStream) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.try_next() {
        seen.push(event);
    }
    seen
}

/// Poll until the condition holds (paused clock advances while sleeping)
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
