//! # Gridlink - Peer Session and Media Connection Orchestration
//!
//! Gridlink establishes, monitors and tears down real-time channels between
//! two parties. Connections fall back from direct peer-to-peer to
//! reflection-assisted and finally relayed transport, relayed bandwidth is
//! gated by a metered quota, and audio, video and screen-share tracks are
//! negotiated per remote participant.
//!
//! ## Key Features
//!
//! - **Tiered connectivity**: p2p, stun and turn attempted in the order the grid's relay mode allows
//! - **Quota admission**: connections are refused before any network attempt once the allocation is used up
//! - **Session registry**: one source of truth merged per field from every subsystem
//! - **Media sessions**: offer/answer/ICE routing with early-candidate buffering
//! - **Supervised reconnection**: bounded, cancellable retries with a policy-supplied delay
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gridlink::GridLink;
//! # use std::sync::Arc;
//! # async fn example(
//! #     connector: Arc<dyn gridlink::TransportConnector>,
//! #     billing: Arc<dyn gridlink::BillingClient>,
//! #     factory: Arc<dyn gridlink::MediaPeerFactory>,
//! #     signaling: Arc<dyn gridlink::SignalingChannel>,
//! # ) -> Result<(), gridlink::GridError> {
//! let grid_link = GridLink::builder()
//!     .local_user_id("alice")
//!     .connector(connector)
//!     .billing(billing)
//!     .media_factory(factory)
//!     .signaling(signaling)
//!     .build()?;
//!
//! let manager = grid_link.manager("bob");
//! let session = manager.connect("grid-1").await?;
//! println!("Connected: {}", session.state);
//!
//! let mut events = manager.subscribe();
//! while let Some(event) = events.next().await {
//!     println!("Event: {}", event.event_type());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use gridlink_core::{
    AllocationStatus, BandwidthQuotaTracker, BillingClient, BillingError, ConnectionMetrics,
    ConnectionState, ConnectionStats, ConnectionTier, GridError, IceServer, LocalTrack,
    MediaQuality, PaymentIntent, PeerTransport, QuotaStatus, QuotaWarning, RelayAllocation,
    RelayConfig, RelayMode, RelayServer, Remediation, RemoteTrack, Session, SessionEvent,
    SessionPatch, SessionRegistry, TrackKind, TrackSource, TransportConfig, TransportConnector,
    TransportPolicy, TransportState, TurnCredentials, UsageDelta,
};
pub use gridlink_diagnostics::{ConnectionAnalyzer, ConnectionReport, DebugLogger};
pub use gridlink_media::{MediaSession, MediaSessionRegistry, TrackAction, TrackEvent};
pub use gridlink_signaling::{
    IceCandidate, MediaPeer, MediaPeerFactory, PeerEvent, SenderId, SessionDescription,
    SignalingChannel, SignalingEnvelope, SignalingMessage, TrackChange, WebSocketSignalingChannel,
};

// Public API modules
pub mod config;
pub mod event;
pub mod manager;
pub mod reconnect;

// Re-export main API types
pub use config::{GridConfig, ReconnectPolicy};
pub use event::{ConnectionEvent, EventFilter, EventStream, FilteredEventStream};
pub use manager::GridConnectionManager;
pub use reconnect::ReconnectionSupervisor;

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Main entry point for gridlink
///
/// Owns the session registry and the media session registry; every manager it
/// hands out writes into the same pair.
#[derive(Debug, Clone)]
pub struct GridLink {
    inner: Arc<GridLinkInner>,
}

struct GridLinkInner {
    config: GridConfig,
    connector: Arc<dyn TransportConnector>,
    billing: Arc<dyn BillingClient>,
    sessions: Arc<SessionRegistry>,
    media: Arc<MediaSessionRegistry>,
}

impl std::fmt::Debug for GridLinkInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridLinkInner")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("media", &self.media)
            .finish()
    }
}

impl GridLink {
    /// Start building a gridlink instance
    pub fn builder() -> GridLinkBuilder {
        GridLinkBuilder::default()
    }

    /// Connection manager for a peer relationship
    ///
    /// # Example
    /// ```rust,no_run
    /// # async fn example(grid_link: gridlink::GridLink) -> Result<(), gridlink::GridError> {
    /// let manager = grid_link.manager("bob");
    /// manager.connect("grid-1").await?;
    /// manager.disconnect().await;
    /// # Ok(())
    /// # }
    /// ```
    pub fn manager(&self, peer_user_id: &str) -> GridConnectionManager {
        GridConnectionManager::new(
            peer_user_id,
            self.inner.config.clone(),
            self.inner.connector.clone(),
            self.inner.billing.clone(),
            self.inner.sessions.clone(),
            self.inner.media.clone(),
        )
    }

    /// Configuration every manager is created with
    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    /// Shared session registry
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    /// Shared media session registry
    pub fn media(&self) -> &Arc<MediaSessionRegistry> {
        &self.inner.media
    }

    /// All sessions, oldest first
    pub fn list_sessions(&self) -> Vec<Session> {
        self.inner.sessions.list()
    }

    /// Snapshot of one session
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.inner.sessions.get(session_id)
    }

    /// Subscribe to session changes
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.sessions.subscribe()
    }

    /// Open media for a data session
    pub fn initialize_media_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<MediaSession>, GridError> {
        self.inner.media.initialize(session_id)
    }

    /// Close media for a data session; returns false if none was open
    pub async fn close_media_session(&self, session_id: &str) -> bool {
        self.inner.media.close(session_id).await
    }

    /// Publish a local track on a media session
    pub async fn add_local_track(
        &self,
        session_id: &str,
        track: LocalTrack,
    ) -> Result<TrackChange, GridError> {
        self.inner.media.add_local_track(session_id, track).await
    }

    /// Stop publishing the local track of a kind
    pub async fn remove_local_track(
        &self,
        session_id: &str,
        kind: TrackKind,
    ) -> Result<Option<LocalTrack>, GridError> {
        self.inner.media.remove_local_track(session_id, kind).await
    }

    /// Subscribe to track changes; remote tracks are the events with `is_remote()`
    pub fn subscribe_tracks(&self) -> broadcast::Receiver<TrackEvent> {
        self.inner.media.subscribe_tracks()
    }

    /// Route one inbound signaling message
    pub async fn handle_signaling(&self, envelope: SignalingEnvelope) -> Result<(), GridError> {
        self.inner.media.handle_signaling(envelope).await
    }

    /// Feed inbound signaling (e.g. from a [`WebSocketSignalingChannel`]) into the media sessions
    ///
    /// Routing failures are logged and isolated to the message that caused them.
    pub fn spawn_signaling_pump(
        &self,
        mut incoming: mpsc::UnboundedReceiver<SignalingEnvelope>,
    ) -> JoinHandle<()> {
        let media = self.inner.media.clone();
        tokio::spawn(async move {
            while let Some(envelope) = incoming.recv().await {
                let kind = envelope.message.kind();
                let from = envelope.from_user_id.clone();
                if let Err(e) = media.handle_signaling(envelope).await {
                    warn!("Dropped {} from {}: {}", kind, from, e);
                }
            }
            debug!("Signaling pump stopped");
        })
    }
}

/// Builder for [`GridLink`]
#[derive(Default)]
pub struct GridLinkBuilder {
    config: Option<GridConfig>,
    local_user_id: Option<String>,
    connector: Option<Arc<dyn TransportConnector>>,
    billing: Option<Arc<dyn BillingClient>>,
    media_factory: Option<Arc<dyn MediaPeerFactory>>,
    signaling: Option<Arc<dyn SignalingChannel>>,
}

impl GridLinkBuilder {
    /// Use a custom configuration (defaults otherwise)
    pub fn config(mut self, config: GridConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Local participant ID
    pub fn local_user_id(mut self, local_user_id: impl Into<String>) -> Self {
        self.local_user_id = Some(local_user_id.into());
        self
    }

    /// Transport primitive
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Billing collaborator
    pub fn billing(mut self, billing: Arc<dyn BillingClient>) -> Self {
        self.billing = Some(billing);
        self
    }

    /// Media peer factory
    pub fn media_factory(mut self, factory: Arc<dyn MediaPeerFactory>) -> Self {
        self.media_factory = Some(factory);
        self
    }

    /// Outbound signaling channel
    pub fn signaling(mut self, signaling: Arc<dyn SignalingChannel>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    /// Build the instance
    pub fn build(self) -> Result<GridLink, GridError> {
        let local_user_id = required(self.local_user_id, "local_user_id")?;
        let connector = required(self.connector, "connector")?;
        let billing = required(self.billing, "billing")?;
        let factory = required(self.media_factory, "media_factory")?;
        let signaling = required(self.signaling, "signaling")?;

        let sessions = Arc::new(SessionRegistry::new());
        let media = Arc::new(MediaSessionRegistry::new(
            sessions.clone(),
            factory,
            signaling,
            local_user_id,
        ));

        Ok(GridLink {
            inner: Arc::new(GridLinkInner {
                config: self.config.unwrap_or_default(),
                connector,
                billing,
                sessions,
                media,
            }),
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, GridError> {
    value.ok_or_else(|| GridError::MissingConfiguration {
        field: field.to_string(),
    })
}
