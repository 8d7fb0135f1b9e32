//! Error types for gridlink

use crate::transport::ConnectionTier;
use std::time::Duration;
use thiserror::Error;

/// Main error type for gridlink operations
#[derive(Error, Debug)]
pub enum GridError {
    /// Relay quota is used up; raised before any network attempt
    #[error("Bandwidth quota exceeded for grid {grid_id} ({percent_used:.1}% used)")]
    QuotaExceeded {
        /// Grid whose allocation is exhausted
        grid_id: String,
        /// Percentage of the purchased allocation already used
        percent_used: f64,
    },

    /// A single tier attempt did not connect within its timeout
    #[error("{tier} attempt timed out after {timeout:?}")]
    AttemptTimeout {
        /// Tier that was being attempted
        tier: ConnectionTier,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A single tier attempt was rejected by the transport primitive
    #[error("{tier} attempt failed: {reason}")]
    AttemptFailed {
        /// Tier that was being attempted
        tier: ConnectionTier,
        /// Reason reported by the transport
        reason: String,
    },

    /// Every tier allowed by the relay mode failed
    #[error("All connection tiers failed for grid {grid_id} (tried {attempted:?}): {last_reason}")]
    AllTiersFailed {
        /// Grid the connection was for
        grid_id: String,
        /// Tiers that were attempted, in order
        attempted: Vec<ConnectionTier>,
        /// Reason the final tier failed
        last_reason: String,
        /// Suggested retry delay
        retry_in: Option<Duration>,
    },

    /// The relay tier is required but not usable for this grid
    #[error("Relay unavailable for grid {grid_id}: {reason}")]
    RelayUnavailable {
        /// Grid that has no usable relay
        grid_id: String,
        /// Why the relay tier could not be built
        reason: String,
    },

    /// Signaling failure isolated to one remote participant
    #[error("Signaling error with participant {participant_id}: {reason}")]
    Signaling {
        /// Remote participant the failure belongs to
        participant_id: String,
        /// Reason for the failure
        reason: String,
    },

    /// Reconnection gave up after the configured number of attempts
    #[error("Reconnection retries exhausted for session {session_id} after {attempts} attempts")]
    ReconnectionExhausted {
        /// Session that could not be restored
        session_id: String,
        /// Number of attempts that were made
        attempts: u32,
    },

    /// Fetching the relay allocation failed
    #[error("Allocation fetch failed for grid {grid_id}: {reason}")]
    AllocationFetchFailed {
        /// Grid whose allocation was requested
        grid_id: String,
        /// Reason for failure
        reason: String,
    },

    /// Billing collaborator rejected a request
    #[error("Billing request failed: {reason}")]
    Billing {
        /// Reason for failure
        reason: String,
    },

    /// Session not found in the registry
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// Session ID that was not found
        session_id: String,
    },

    /// No media session is active for the data session
    #[error("Media session not found: {session_id}")]
    MediaSessionNotFound {
        /// Session ID without a media session
        session_id: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// A backward or skipping state transition was requested
    #[error("Invalid transition for session {session_id}: {from} -> {to}")]
    InvalidTransition {
        /// Session the transition was requested for
        session_id: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Operation was cancelled by disconnect or session close
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },

    /// Transport error
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Remediation path a caller can offer for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Buy more relay bandwidth
    PurchaseBandwidth,
    /// Retry the connection (network problem)
    Retry,
    /// Switch the grid's relay mode
    ChangeRelayMode,
    /// Nothing actionable for the user
    None,
}

impl GridError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            GridError::QuotaExceeded { .. } => "QUOTA_EXCEEDED".to_string(),
            GridError::AttemptTimeout { .. } => "ATTEMPT_TIMEOUT".to_string(),
            GridError::AttemptFailed { .. } => "ATTEMPT_FAILED".to_string(),
            GridError::AllTiersFailed { .. } => "ALL_TIERS_FAILED".to_string(),
            GridError::RelayUnavailable { .. } => "RELAY_UNAVAILABLE".to_string(),
            GridError::Signaling { .. } => "SIGNALING_ERROR".to_string(),
            GridError::ReconnectionExhausted { .. } => "RECONNECTION_EXHAUSTED".to_string(),
            GridError::AllocationFetchFailed { .. } => "ALLOCATION_FETCH_FAILED".to_string(),
            GridError::Billing { .. } => "BILLING_ERROR".to_string(),
            GridError::SessionNotFound { .. } => "SESSION_NOT_FOUND".to_string(),
            GridError::MediaSessionNotFound { .. } => "MEDIA_SESSION_NOT_FOUND".to_string(),
            GridError::InvalidState { .. } => "INVALID_STATE".to_string(),
            GridError::InvalidTransition { .. } => "INVALID_TRANSITION".to_string(),
            GridError::Cancelled { .. } => "CANCELLED".to_string(),
            GridError::Transport { .. } => "TRANSPORT_ERROR".to_string(),
            GridError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            GridError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
        }
    }

    /// Which remediation path applies to this failure
    pub fn remediation(&self) -> Remediation {
        match self {
            GridError::QuotaExceeded { .. } => Remediation::PurchaseBandwidth,
            GridError::RelayUnavailable { .. } => Remediation::ChangeRelayMode,
            GridError::AttemptTimeout { .. }
            | GridError::AttemptFailed { .. }
            | GridError::AllTiersFailed { .. }
            | GridError::ReconnectionExhausted { .. }
            | GridError::Signaling { .. }
            | GridError::Transport { .. } => Remediation::Retry,
            _ => Remediation::None,
        }
    }

    /// Whether this error came from reconnection giving up rather than a first attempt
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, GridError::ReconnectionExhausted { .. })
    }
}
