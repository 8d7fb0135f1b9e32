//! Track events and the per-session track history

use chrono::{DateTime, Utc};
use gridlink_core::TrackKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum history entries kept per media session
pub const TRACK_HISTORY_LIMIT: usize = 256;

/// Who a track belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "lowercase")]
pub enum TrackOrigin {
    /// Published by the local participant
    Local,
    /// Received from a remote participant
    Remote {
        /// Sending participant
        participant_id: String,
    },
}

/// What happened to a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackAction {
    /// Track started
    Added,
    /// Track ended
    Removed,
}

/// Track change keyed on `(session_id, kind)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEvent {
    /// Data session the media session belongs to
    pub session_id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Track ID
    pub track_id: String,
    /// Local or remote
    #[serde(flatten)]
    pub origin: TrackOrigin,
    /// Added or removed
    pub action: TrackAction,
    /// When the change was recorded
    pub timestamp: DateTime<Utc>,
}

impl TrackEvent {
    /// Local track event
    pub fn local(session_id: &str, kind: TrackKind, track_id: &str, action: TrackAction) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            track_id: track_id.to_string(),
            origin: TrackOrigin::Local,
            action,
            timestamp: Utc::now(),
        }
    }

    /// Remote track event
    pub fn remote(
        session_id: &str,
        participant_id: &str,
        kind: TrackKind,
        track_id: &str,
        action: TrackAction,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            track_id: track_id.to_string(),
            origin: TrackOrigin::Remote {
                participant_id: participant_id.to_string(),
            },
            action,
            timestamp: Utc::now(),
        }
    }

    /// Whether the track came from a remote participant
    pub fn is_remote(&self) -> bool {
        matches!(self.origin, TrackOrigin::Remote { .. })
    }
}

/// Auditable, bounded record of track changes
#[derive(Debug, Clone, Default)]
pub struct TrackHistory {
    events: VecDeque<TrackEvent>,
}

impl TrackHistory {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, dropping the oldest past the limit
    pub fn record(&mut self, event: TrackEvent) {
        if self.events.len() == TRACK_HISTORY_LIMIT {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Events oldest first
    pub fn events(&self) -> Vec<TrackEvent> {
        self.events.iter().cloned().collect()
    }

    /// Number of recorded events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
