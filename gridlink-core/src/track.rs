//! Track descriptors shared by signaling and media bookkeeping

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Camera or file video track
    Video,
    /// Screen or application share
    ScreenShare,
}

impl TrackKind {
    /// All kinds, in session flag order
    pub const ALL: [TrackKind; 3] = [TrackKind::Audio, TrackKind::Video, TrackKind::ScreenShare];
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
            TrackKind::ScreenShare => write!(f, "screen-share"),
        }
    }
}

/// Track source enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    /// Camera/webcam video
    Camera,
    /// Microphone audio
    Microphone,
    /// Screen sharing video
    Screen,
    /// Application window sharing
    Application,
    /// Other/unknown source
    Unknown,
}

impl TrackSource {
    /// Kind a track from this source is classified as
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Screen | TrackSource::Application => TrackKind::ScreenShare,
            TrackSource::Camera | TrackSource::Unknown => TrackKind::Video,
        }
    }
}

/// Track published by the local participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    muted: bool,
}

impl LocalTrack {
    /// Create a track, classifying its kind from the source
    pub fn new(id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind: source.kind(),
            source,
            muted: false,
        }
    }

    /// Local microphone track
    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(id, TrackSource::Microphone)
    }

    /// Local camera track
    pub fn video(id: impl Into<String>) -> Self {
        Self::new(id, TrackSource::Camera)
    }

    /// Local screen share track
    pub fn screen_share(id: impl Into<String>) -> Self {
        Self::new(id, TrackSource::Screen)
    }

    /// Get track ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Get track source
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Check if track is muted
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Set mute state
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }
}

/// Track received from a remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    id: String,
    participant_id: String,
    kind: TrackKind,
    received_at: Instant,
}

impl RemoteTrack {
    /// Create a remote track record
    pub fn new(id: impl Into<String>, participant_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            participant_id: participant_id.into(),
            kind,
            received_at: Instant::now(),
        }
    }

    /// Get track ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote participant the track belongs to
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Get track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// When the track arrived
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}
