//! Transport primitive interfaces, connection tiers and transport statistics
//!
//! The ICE/STUN/TURN negotiation itself is an external capability. This module
//! describes what gridlink hands to it (ICE servers plus a transport policy)
//! and what it expects back (state transitions and cumulative stats).

use crate::error::GridError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Grid relay policy controlling which tiers may be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// Direct first, then reflection-assisted, then relayed
    #[default]
    P2pFirst,
    /// Relayed transport only
    RelayOnly,
    /// Direct transport only, never relayed
    P2pOnly,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayMode::P2pFirst => "p2p_first",
            RelayMode::RelayOnly => "relay_only",
            RelayMode::P2pOnly => "p2p_only",
        };
        f.write_str(name)
    }
}

/// One connectivity strategy, attempted in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionTier {
    /// Direct transport using only locally discovered candidates
    P2p,
    /// Reflection-assisted direct transport
    Stun,
    /// Third-party relayed transport (metered)
    Turn,
}

impl ConnectionTier {
    /// Whether traffic on this tier is billed against the relay allocation
    pub fn is_metered(&self) -> bool {
        matches!(self, ConnectionTier::Turn)
    }
}

impl fmt::Display for ConnectionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionTier::P2p => "p2p",
            ConnectionTier::Stun => "stun",
            ConnectionTier::Turn => "turn",
        };
        f.write_str(name)
    }
}

/// Candidate gathering policy handed to the transport primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportPolicy {
    /// Use every candidate type
    All,
    /// Only use relayed candidates
    RelayOnly,
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (stun:, turn:, turns:)
    pub urls: Vec<String>,
    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Unauthenticated server (STUN)
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

/// Configuration for one transport negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Tier this configuration was built for
    pub tier: ConnectionTier,
    /// ICE servers to use; empty means host candidates only
    pub ice_servers: Vec<IceServer>,
    /// Candidate policy
    pub policy: TransportPolicy,
}

/// Transport state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not yet negotiating
    New,
    /// Negotiation in progress
    Connecting,
    /// Transport usable
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Negotiation or connectivity failed
    Failed,
    /// Closed locally
    Closed,
}

impl TransportState {
    /// Whether this state means the peer link was lost
    pub fn is_lost(&self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }
}

/// Cumulative statistics for an active transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Bytes sent since the transport connected
    pub bytes_sent: u64,
    /// Bytes received since the transport connected
    pub bytes_received: u64,
    /// Packets lost since the transport connected
    pub packets_lost: u64,
    /// Most recent round-trip time
    pub round_trip_time: Option<Duration>,
    /// Tier the transport is running on
    pub connection_type: Option<ConnectionTier>,
}

impl ConnectionStats {
    /// Bytes transferred since the given usage mark
    pub fn delta_since(&self, mark: &UsageDelta) -> UsageDelta {
        UsageDelta {
            bytes_sent: self.bytes_sent.saturating_sub(mark.bytes_sent),
            bytes_received: self.bytes_received.saturating_sub(mark.bytes_received),
        }
    }

    /// Usage mark at the current counters
    pub fn usage_mark(&self) -> UsageDelta {
        UsageDelta {
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

/// Byte counts for a usage report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

impl UsageDelta {
    /// Whether nothing was transferred
    pub fn is_empty(&self) -> bool {
        self.bytes_sent == 0 && self.bytes_received == 0
    }

    /// Total bytes in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

/// Connection metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// Tier attempts started
    pub connection_attempts: u32,
    /// Attempts that connected
    pub successful_connections: u32,
    /// Failed attempts by tier (timeouts included)
    pub failed_connections: HashMap<ConnectionTier, u32>,
    /// Attempts that ended by timeout
    pub timeouts: u32,
    /// Last attempt start time
    pub last_attempt: Option<Instant>,
}

impl ConnectionMetrics {
    /// Record the start of a tier attempt
    pub fn record_attempt(&mut self) {
        self.connection_attempts += 1;
        self.last_attempt = Some(Instant::now());
    }

    /// Record a failed tier attempt
    pub fn record_failure(&mut self, tier: ConnectionTier, timed_out: bool) {
        *self.failed_connections.entry(tier).or_insert(0) += 1;
        if timed_out {
            self.timeouts += 1;
        }
    }
}

/// An established peer transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Current state
    fn state(&self) -> TransportState;

    /// Watch state transitions
    fn subscribe_state(&self) -> watch::Receiver<TransportState>;

    /// Cumulative statistics
    async fn stats(&self) -> Result<ConnectionStats, GridError>;

    /// Release the transport
    async fn close(&self) -> Result<(), GridError>;
}

/// Transport primitive: negotiates a transport from an ICE configuration
///
/// The returned future resolves once the transport is connected or the
/// negotiation fails. Dropping the future aborts the negotiation.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Negotiate a transport for the grid using the given configuration
    async fn establish(
        &self,
        grid_id: &str,
        config: TransportConfig,
    ) -> Result<Arc<dyn PeerTransport>, GridError>;
}
