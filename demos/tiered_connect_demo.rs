//! Tiered Connect Demo
//!
//! Runs a connection manager against an in-memory network where direct
//! connections never complete, so the manager falls back to STUN. The billing
//! side reports an allocation close to its limit to show quota warnings and
//! the pre-flight rejection once it runs out.

use async_trait::async_trait;
use chrono::Utc;
use gridlink::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct LoopbackTransport {
    state: watch::Sender<TransportState>,
    started: std::time::Instant,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn stats(&self) -> Result<ConnectionStats, GridError> {
        let elapsed = self.started.elapsed().as_millis() as u64;
        Ok(ConnectionStats {
            bytes_sent: elapsed * 120,
            bytes_received: elapsed * 80,
            packets_lost: 0,
            round_trip_time: Some(Duration::from_millis(45)),
            connection_type: None,
        })
    }

    async fn close(&self) -> Result<(), GridError> {
        self.state.send_replace(TransportState::Closed);
        Ok(())
    }
}

/// Direct paths are blocked; everything else connects after a short handshake
struct FirewalledNetwork;

#[async_trait]
impl TransportConnector for FirewalledNetwork {
    async fn establish(
        &self,
        grid_id: &str,
        config: TransportConfig,
    ) -> Result<Arc<dyn PeerTransport>, GridError> {
        println!(
            "   ↪ {} attempt for {} via {:?}",
            config.tier, grid_id, config.policy
        );
        if config.tier == ConnectionTier::P2p {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        let (state, _) = watch::channel(TransportState::Connected);
        Ok(Arc::new(LoopbackTransport {
            state,
            started: std::time::Instant::now(),
        }))
    }
}

struct InMemoryBilling {
    config: Mutex<RelayConfig>,
}

#[async_trait]
impl BillingClient for InMemoryBilling {
    async fn get_relay_config(&self, _grid_id: &str) -> Result<RelayConfig, BillingError> {
        Ok(self.config.lock().clone())
    }

    async fn report_usage(
        &self,
        grid_id: &str,
        sent: u64,
        received: u64,
    ) -> Result<(), BillingError> {
        println!("   💳 billed {} bytes to {}", sent + received, grid_id);
        Ok(())
    }

    async fn update_relay_mode(
        &self,
        _grid_id: &str,
        mode: RelayMode,
    ) -> Result<(), BillingError> {
        self.config.lock().relay_mode = mode;
        Ok(())
    }

    async fn purchase_bandwidth(
        &self,
        _grid_id: &str,
        gb: u32,
        _months: u32,
    ) -> Result<PaymentIntent, BillingError> {
        if let Some(allocation) = self.config.lock().allocation.as_mut() {
            allocation.purchased_gb += f64::from(gb);
        }
        Ok(PaymentIntent {
            id: "pi_demo".to_string(),
            client_secret: "pi_demo_secret".to_string(),
            amount_cents: u64::from(gb) * 50,
            currency: "usd".to_string(),
        })
    }
}

impl InMemoryBilling {
    fn set_used_gb(&self, used_gb: f64) {
        if let Some(allocation) = self.config.lock().allocation.as_mut() {
            allocation.used_gb = used_gb;
        }
    }
}

struct SilentPeer;

#[async_trait]
impl MediaPeer for SilentPeer {
    async fn set_remote_description(&self, _: SessionDescription) -> Result<(), GridError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, GridError> {
        Ok("v=0".to_string())
    }

    async fn create_answer(&self) -> Result<String, GridError> {
        Ok("v=0".to_string())
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

struct SilentPeers;

#[async_trait]
impl MediaPeerFactory for SilentPeers {
    async fn create(
        &self,
        _participant_id: &str,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>, GridError> {
        Ok(Arc::new(SilentPeer))
    }
}

struct PrintingChannel;

#[async_trait]
impl SignalingChannel for PrintingChannel {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<(), GridError> {
        println!("   📨 {} -> {}", envelope.message.kind(), envelope.to_user_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    DebugLogger::new().install()?;

    println!("🚀 Gridlink Tiered Connect Demo");
    println!("================================");

    let billing = Arc::new(InMemoryBilling {
        config: Mutex::new(RelayConfig {
            relay_mode: RelayMode::P2pFirst,
            allocation: Some(RelayAllocation {
                purchased_gb: 10.0,
                used_gb: 9.6,
                expires_at: Utc::now() + chrono::Duration::days(30),
                status: AllocationStatus::Active,
            }),
            turn_credentials: Some(TurnCredentials {
                username: "demo".to_string(),
                credential: "demo-secret".to_string(),
            }),
            relay_servers: vec![RelayServer {
                region: "eu-west".to_string(),
                urls: vec!["turn:relay.example.net:3478".to_string()],
                is_healthy: true,
            }],
        }),
    });

    let config = GridConfig {
        p2p_timeout: Duration::from_secs(2),
        report_interval: Duration::from_secs(2),
        ..GridConfig::default()
    };
    let grid_link = GridLink::builder()
        .config(config)
        .local_user_id("alice")
        .connector(Arc::new(FirewalledNetwork))
        .billing(billing.clone())
        .media_factory(Arc::new(SilentPeers))
        .signaling(Arc::new(PrintingChannel))
        .build()?;

    let manager = grid_link.manager("bob");
    let mut events = manager.subscribe_filtered(EventFilter::specific(vec![
        "state_changed".to_string(),
        "quota_warning".to_string(),
        "usage_reported".to_string(),
    ]));
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                ConnectionEvent::StateChanged { previous, state, .. } => {
                    println!("   🔀 {} -> {}", previous, state)
                }
                ConnectionEvent::QuotaWarning { warning } => println!(
                    "   ⚠️  {}% threshold crossed ({:.1} GB left)",
                    warning.threshold, warning.remaining_gb
                ),
                ConnectionEvent::UsageReported { delta, .. } => {
                    println!("   📈 reported {} bytes", delta.total_bytes())
                }
                _ => {}
            }
        }
    });

    // Demo 1: fallback past the blocked direct path
    println!("\n🔄 Demo 1: p2p → stun fallback");
    let session = manager.connect("demo-grid").await?;
    println!("✅ Session {} is {}", session.session_id, session.state);

    let media = manager.initialize_media()?;
    println!("🎥 Media session open for {}", media.session_id());
    grid_link
        .add_local_track(
            &session.session_id,
            LocalTrack::new("mic-0", TrackSource::Microphone),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(5)).await;
    if let Some(stats) = manager.get_stats() {
        println!("📊 {:?} over {:?}", stats.round_trip_time, stats.connection_type);
    }
    manager.disconnect().await;

    // Demo 2: allocation used up
    println!("\n⛔ Demo 2: quota exhausted");
    billing.set_used_gb(10.0);
    match manager.connect("demo-grid").await {
        Ok(_) => println!("❌ Unexpectedly connected"),
        Err(e) => println!(
            "✅ Rejected with {} (remediation: {:?})",
            e.error_code(),
            e.remediation()
        ),
    }

    // Demo 3: buy more and retry
    println!("\n💳 Demo 3: purchase and reconnect");
    let intent = manager.purchase_bandwidth("demo-grid", 5, 1).await?;
    println!("   payment intent {} for {} cents", intent.id, intent.amount_cents);
    let session = manager.connect("demo-grid").await?;
    println!("✅ Session {} is {}", session.session_id, session.state);
    manager.disconnect().await;

    println!("\n👋 Done");
    Ok(())
}
