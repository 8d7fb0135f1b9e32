//! Event system for connection, quota and reconnection events

use gridlink_core::{
    ConnectionState, ConnectionStats, ConnectionTier, MediaQuality, QuotaWarning, UsageDelta,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Events published by a connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The manager's connection state changed
    StateChanged {
        /// Session the state belongs to, if one exists
        session_id: Option<String>,
        /// Grid being connected
        grid_id: Option<String>,
        /// Previous state
        previous: ConnectionState,
        /// New state
        state: ConnectionState,
    },
    /// A stats sample was taken
    StatsUpdated {
        /// Session the stats belong to
        session_id: String,
        /// Cumulative transport stats
        stats: ConnectionStats,
        /// Quality derived from the sample
        quality: MediaQuality,
    },
    /// A quota threshold was crossed
    QuotaWarning {
        /// Warning details
        warning: QuotaWarning,
    },
    /// A usage delta was reported to billing
    UsageReported {
        /// Grid the usage was billed to
        grid_id: String,
        /// Reported bytes
        delta: UsageDelta,
    },
    /// A reconnection attempt is scheduled
    Reconnecting {
        /// Session being restored
        session_id: String,
        /// Attempt number (1-based)
        attempt: u32,
        /// Attempts allowed
        max_attempts: u32,
        /// Delay before the attempt runs
        retry_in: Duration,
    },
    /// The session was restored
    Reconnected {
        /// Session that was restored
        session_id: String,
        /// Attempt that succeeded
        attempt: u32,
        /// Tier the new transport runs on
        tier: ConnectionTier,
    },
    /// Reconnection gave up
    ReconnectionFailed {
        /// Session that was lost
        session_id: String,
        /// Attempts made
        attempts: u32,
        /// Final error
        error: String,
    },
}

impl ConnectionEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            ConnectionEvent::StateChanged { .. } => "state_changed",
            ConnectionEvent::StatsUpdated { .. } => "stats_updated",
            ConnectionEvent::QuotaWarning { .. } => "quota_warning",
            ConnectionEvent::UsageReported { .. } => "usage_reported",
            ConnectionEvent::Reconnecting { .. } => "reconnecting",
            ConnectionEvent::Reconnected { .. } => "reconnected",
            ConnectionEvent::ReconnectionFailed { .. } => "reconnection_failed",
        }
    }

    /// Check if this is a state event
    pub fn is_state_event(&self) -> bool {
        matches!(self, ConnectionEvent::StateChanged { .. })
    }

    /// Check if this is a stats or usage event
    pub fn is_stats_event(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::StatsUpdated { .. } | ConnectionEvent::UsageReported { .. }
        )
    }

    /// Check if this is a quota event
    pub fn is_quota_event(&self) -> bool {
        matches!(self, ConnectionEvent::QuotaWarning { .. })
    }

    /// Check if this is a reconnection event
    pub fn is_reconnection_event(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Reconnecting { .. }
                | ConnectionEvent::Reconnected { .. }
                | ConnectionEvent::ReconnectionFailed { .. }
        )
    }
}

/// Stream of connection events for async iteration
///
/// Each stream is an independent subscriber. A subscriber that falls behind
/// skips the events it missed.
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<ConnectionEvent>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: broadcast::Receiver<ConnectionEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event subscriber lagged, skipped {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("Event subscriber lagged, skipped {} events", missed);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Event filter for selective event processing
#[derive(Debug, Clone)]
pub struct EventFilter {
    /// Whether to include state events
    pub include_state_events: bool,
    /// Whether to include stats and usage events
    pub include_stats_events: bool,
    /// Whether to include quota events
    pub include_quota_events: bool,
    /// Whether to include reconnection events
    pub include_reconnection_events: bool,
    /// Specific event types to include (if specified, overrides other filters)
    pub specific_event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a filter that includes all events
    pub fn all() -> Self {
        Self {
            include_state_events: true,
            include_stats_events: true,
            include_quota_events: true,
            include_reconnection_events: true,
            specific_event_types: None,
        }
    }

    fn none() -> Self {
        Self {
            include_state_events: false,
            include_stats_events: false,
            include_quota_events: false,
            include_reconnection_events: false,
            specific_event_types: None,
        }
    }

    /// Create a filter that includes only state events
    pub fn state_only() -> Self {
        Self {
            include_state_events: true,
            ..Self::none()
        }
    }

    /// Create a filter that includes only quota events
    pub fn quota_only() -> Self {
        Self {
            include_quota_events: true,
            ..Self::none()
        }
    }

    /// Create a filter that includes only reconnection events
    pub fn reconnection_only() -> Self {
        Self {
            include_reconnection_events: true,
            ..Self::none()
        }
    }

    /// Create a filter for specific event types
    pub fn specific(event_types: Vec<String>) -> Self {
        Self {
            specific_event_types: Some(event_types),
            ..Self::none()
        }
    }

    /// Check if an event should be included based on this filter
    pub fn should_include(&self, event: &ConnectionEvent) -> bool {
        if let Some(ref specific_types) = self.specific_event_types {
            return specific_types.iter().any(|t| t == event.event_type());
        }

        (self.include_state_events && event.is_state_event())
            || (self.include_stats_events && event.is_stats_event())
            || (self.include_quota_events && event.is_quota_event())
            || (self.include_reconnection_events && event.is_reconnection_event())
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Filtered event stream that only yields events matching a filter
#[derive(Debug)]
pub struct FilteredEventStream {
    stream: EventStream,
    filter: EventFilter,
}

impl FilteredEventStream {
    /// Create a new filtered event stream
    pub fn new(stream: EventStream, filter: EventFilter) -> Self {
        Self { stream, filter }
    }

    /// Get the next event that matches the filter
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        loop {
            let event = self.stream.next().await?;
            if self.filter.should_include(&event) {
                return Some(event);
            }
        }
    }

    /// Try to get the next filtered event without blocking
    pub fn try_next(&mut self) -> Option<ConnectionEvent> {
        loop {
            let event = self.stream.try_next()?;
            if self.filter.should_include(&event) {
                return Some(event);
            }
        }
    }

    /// Update the filter
    pub fn set_filter(&mut self, filter: EventFilter) {
        self.filter = filter;
    }

    /// Get the current filter
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}
