//! # Gridlink Core
//!
//! Connection tiers, bandwidth quota and session state for gridlink.
//! This crate holds the error taxonomy, the transport and billing collaborator
//! interfaces, the tier selector, the quota tracker and the canonical session
//! registry that every other gridlink crate writes to.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod quota;
pub mod session;
pub mod tier;
pub mod track;
pub mod transport;

// Re-export main types
pub use error::{GridError, Remediation};
pub use quota::{
    AllocationStatus, BandwidthQuotaTracker, BillingClient, BillingError, PaymentIntent,
    QuotaStatus, QuotaWarning, RelayAllocation, RelayConfig, RelayServer, TurnCredentials,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_WARNING_THRESHOLDS,
};
pub use session::{
    ConnectionState, MediaQuality, Session, SessionEvent, SessionField, SessionPatch,
    SessionRegistry,
};
pub use tier::{ConnectionAttempt, TierSelector, TierTimeouts};
pub use track::{LocalTrack, RemoteTrack, TrackKind, TrackSource};
pub use transport::{
    ConnectionMetrics, ConnectionStats, ConnectionTier, IceServer, PeerTransport, RelayMode,
    TransportConfig, TransportConnector, TransportPolicy, TransportState, UsageDelta,
};
