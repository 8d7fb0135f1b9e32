//! Session model and the canonical session registry
//!
//! Several subsystems write to the same session: the connection manager owns
//! the connection state, the media registry owns the media flags and the
//! participant count, the supervisor owns the reconnect counter. Each writer
//! submits a [`SessionPatch`] naming only the fields it owns; the registry
//! merges field by field so concurrent writers never clobber each other.

use crate::error::GridError;
use crate::transport::ConnectionTier;
use crate::track::TrackKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Connection state machine of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Idle,
    /// Trying a direct transport
    AttemptingP2p,
    /// Trying a reflection-assisted transport
    AttemptingStun,
    /// Trying a relayed transport
    AttemptingTurn,
    /// Connected directly
    ConnectedP2p,
    /// Connected through reflection
    ConnectedStun,
    /// Connected through the relay
    ConnectedTurn,
    /// Connection lost, supervisor retrying
    Reconnecting,
    /// Gave up
    Failed,
    /// Rejected by the bandwidth quota
    QuotaExceeded,
}

impl ConnectionState {
    /// Attempting state for a tier
    pub fn attempting(tier: ConnectionTier) -> Self {
        match tier {
            ConnectionTier::P2p => ConnectionState::AttemptingP2p,
            ConnectionTier::Stun => ConnectionState::AttemptingStun,
            ConnectionTier::Turn => ConnectionState::AttemptingTurn,
        }
    }

    /// Connected state for a tier
    pub fn connected(tier: ConnectionTier) -> Self {
        match tier {
            ConnectionTier::P2p => ConnectionState::ConnectedP2p,
            ConnectionTier::Stun => ConnectionState::ConnectedStun,
            ConnectionTier::Turn => ConnectionState::ConnectedTurn,
        }
    }

    /// Tier an attempting or connected state refers to
    pub fn tier(&self) -> Option<ConnectionTier> {
        match self {
            ConnectionState::AttemptingP2p | ConnectionState::ConnectedP2p => {
                Some(ConnectionTier::P2p)
            }
            ConnectionState::AttemptingStun | ConnectionState::ConnectedStun => {
                Some(ConnectionTier::Stun)
            }
            ConnectionState::AttemptingTurn | ConnectionState::ConnectedTurn => {
                Some(ConnectionTier::Turn)
            }
            _ => None,
        }
    }

    /// Whether a transport is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedP2p
                | ConnectionState::ConnectedStun
                | ConnectionState::ConnectedTurn
        )
    }

    /// Whether a tier attempt is in flight
    pub fn is_attempting(&self) -> bool {
        matches!(
            self,
            ConnectionState::AttemptingP2p
                | ConnectionState::AttemptingStun
                | ConnectionState::AttemptingTurn
        )
    }

    /// Whether the machine allows moving from `self` to `next`
    ///
    /// Tiers only advance (p2p, then stun, then turn) and a connected state is
    /// only reachable from the attempt at the same tier. Re-writing the
    /// current state is always allowed.
    pub fn can_advance_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if *self == next {
            return true;
        }

        match (*self, next) {
            (_, Idle) | (_, Failed) => true,
            (Idle | Failed | Reconnecting, QuotaExceeded) => true,
            (from, QuotaExceeded) if from.is_connected() => true,
            (Idle | Failed | QuotaExceeded | Reconnecting, s) if s.is_attempting() => true,
            (from, to) if from.is_attempting() && to.is_attempting() => {
                tier_rank(from) < tier_rank(to)
            }
            (from, to) if from.is_attempting() && to.is_connected() => from.tier() == to.tier(),
            // A failed retry hands control back to the supervisor.
            (from, Reconnecting) => from.is_connected() || from.is_attempting(),
            _ => false,
        }
    }
}

fn tier_rank(state: ConnectionState) -> u8 {
    match state.tier() {
        Some(ConnectionTier::P2p) => 0,
        Some(ConnectionTier::Stun) => 1,
        Some(ConnectionTier::Turn) => 2,
        None => u8::MAX,
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AttemptingP2p => "attempting-p2p",
            ConnectionState::AttemptingStun => "attempting-stun",
            ConnectionState::AttemptingTurn => "attempting-turn",
            ConnectionState::ConnectedP2p => "connected-p2p",
            ConnectionState::ConnectedStun => "connected-stun",
            ConnectionState::ConnectedTurn => "connected-turn",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::QuotaExceeded => "quota-exceeded",
        };
        f.write_str(name)
    }
}

/// Perceived media quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaQuality {
    /// Not sampled yet
    #[default]
    Unknown,
    /// Excellent quality
    Excellent,
    /// Good quality
    Good,
    /// Fair quality
    Fair,
    /// Poor quality
    Poor,
}

/// Canonical state of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session ID
    pub session_id: String,
    /// Remote party
    pub peer_user_id: String,
    /// Grid the session belongs to
    pub grid_id: String,
    /// Connection state
    pub state: ConnectionState,
    /// A media session is open for this session
    pub has_media_session: bool,
    /// At least one media peer connection is connected
    pub media_connected: bool,
    /// Local audio is published
    pub has_audio: bool,
    /// Local video is published
    pub has_video: bool,
    /// Local screen share is published
    pub has_screen_share: bool,
    /// Quality derived from transport stats
    pub media_quality: MediaQuality,
    /// Remote participants currently sending tracks
    pub participant_count: u32,
    /// Current reconnection attempt (0 when not reconnecting)
    pub reconnect_attempt: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change time
    pub updated_at: DateTime<Utc>,
    /// Last error message
    pub last_error: Option<String>,
}

impl Session {
    /// New idle session
    pub fn new(
        session_id: impl Into<String>,
        peer_user_id: impl Into<String>,
        grid_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            peer_user_id: peer_user_id.into(),
            grid_id: grid_id.into(),
            state: ConnectionState::Idle,
            has_media_session: false,
            media_connected: false,
            has_audio: false,
            has_video: false,
            has_screen_share: false,
            media_quality: MediaQuality::Unknown,
            participant_count: 0,
            reconnect_attempt: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Whether a local track of the given kind is published
    pub fn has_track(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.has_audio,
            TrackKind::Video => self.has_video,
            TrackKind::ScreenShare => self.has_screen_share,
        }
    }

    /// Merge a patch field by field and return the fields that changed
    ///
    /// `updated_at` moves only when something changed.
    pub fn apply(&mut self, patch: &SessionPatch) -> Vec<SessionField> {
        let mut changed = Vec::new();

        fn merge<T: PartialEq + Clone>(
            slot: &mut T,
            value: &Option<T>,
            field: SessionField,
            changed: &mut Vec<SessionField>,
        ) {
            if let Some(value) = value {
                if slot != value {
                    *slot = value.clone();
                    changed.push(field);
                }
            }
        }

        merge(&mut self.state, &patch.state, SessionField::State, &mut changed);
        merge(
            &mut self.has_media_session,
            &patch.has_media_session,
            SessionField::HasMediaSession,
            &mut changed,
        );
        merge(
            &mut self.media_connected,
            &patch.media_connected,
            SessionField::MediaConnected,
            &mut changed,
        );
        merge(&mut self.has_audio, &patch.has_audio, SessionField::HasAudio, &mut changed);
        merge(&mut self.has_video, &patch.has_video, SessionField::HasVideo, &mut changed);
        merge(
            &mut self.has_screen_share,
            &patch.has_screen_share,
            SessionField::HasScreenShare,
            &mut changed,
        );
        merge(
            &mut self.media_quality,
            &patch.media_quality,
            SessionField::MediaQuality,
            &mut changed,
        );
        merge(
            &mut self.participant_count,
            &patch.participant_count,
            SessionField::ParticipantCount,
            &mut changed,
        );
        merge(
            &mut self.reconnect_attempt,
            &patch.reconnect_attempt,
            SessionField::ReconnectAttempt,
            &mut changed,
        );
        merge(
            &mut self.last_error,
            &patch.last_error,
            SessionField::LastError,
            &mut changed,
        );

        if !changed.is_empty() {
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// Names of mergeable session fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionField {
    /// Connection state
    State,
    /// Media session open flag
    HasMediaSession,
    /// Media connected flag
    MediaConnected,
    /// Audio published flag
    HasAudio,
    /// Video published flag
    HasVideo,
    /// Screen share published flag
    HasScreenShare,
    /// Media quality
    MediaQuality,
    /// Remote participant count
    ParticipantCount,
    /// Reconnection attempt counter
    ReconnectAttempt,
    /// Last error message
    LastError,
}

/// Partial update of a session
///
/// `Some` fields overwrite, `None` fields are left alone. `last_error` is
/// tri-state: `None` leaves it, `Some(Some(_))` sets it, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    /// New connection state
    pub state: Option<ConnectionState>,
    /// New media session flag
    pub has_media_session: Option<bool>,
    /// New media connected flag
    pub media_connected: Option<bool>,
    /// New audio flag
    pub has_audio: Option<bool>,
    /// New video flag
    pub has_video: Option<bool>,
    /// New screen share flag
    pub has_screen_share: Option<bool>,
    /// New media quality
    pub media_quality: Option<MediaQuality>,
    /// New participant count
    pub participant_count: Option<u32>,
    /// New reconnection attempt counter
    pub reconnect_attempt: Option<u32>,
    /// Last error update
    pub last_error: Option<Option<String>>,
}

impl SessionPatch {
    /// Empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection state
    pub fn state(mut self, state: ConnectionState) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the media session flag
    pub fn has_media_session(mut self, value: bool) -> Self {
        self.has_media_session = Some(value);
        self
    }

    /// Set the media connected flag
    pub fn media_connected(mut self, value: bool) -> Self {
        self.media_connected = Some(value);
        self
    }

    /// Set the published flag for a track kind
    pub fn track(mut self, kind: TrackKind, published: bool) -> Self {
        match kind {
            TrackKind::Audio => self.has_audio = Some(published),
            TrackKind::Video => self.has_video = Some(published),
            TrackKind::ScreenShare => self.has_screen_share = Some(published),
        }
        self
    }

    /// Set the media quality
    pub fn media_quality(mut self, quality: MediaQuality) -> Self {
        self.media_quality = Some(quality);
        self
    }

    /// Set the participant count
    pub fn participant_count(mut self, count: u32) -> Self {
        self.participant_count = Some(count);
        self
    }

    /// Set the reconnection attempt counter
    pub fn reconnect_attempt(mut self, attempt: u32) -> Self {
        self.reconnect_attempt = Some(attempt);
        self
    }

    /// Record an error message
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    /// Clear the last error
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Whether the patch touches nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Session change notification
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was created
    Created(Session),
    /// Fields of a session changed
    Updated {
        /// Session after the merge
        session: Session,
        /// Fields that changed
        changed: Vec<SessionField>,
    },
    /// A session was removed
    Removed {
        /// Removed session ID
        session_id: String,
    },
}

impl SessionEvent {
    /// Session the event is about
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Created(session) => &session.session_id,
            SessionEvent::Updated { session, .. } => &session.session_id,
            SessionEvent::Removed { session_id } => session_id,
        }
    }
}

/// Canonical sessionId → session store
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    /// Create a session with a fresh ID
    pub fn create(&self, peer_user_id: &str, grid_id: &str) -> Session {
        self.insert(Session::new(Uuid::new_v4().to_string(), peer_user_id, grid_id))
    }

    /// Insert a session, replacing any previous one with the same ID
    pub fn insert(&self, session: Session) -> Session {
        debug!(
            "Session {} created for peer {} on grid {}",
            session.session_id, session.peer_user_id, session.grid_id
        );
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        let _ = self.events.send(SessionEvent::Created(session.clone()));
        session
    }

    /// Get a snapshot of a session
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Whether a session exists
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Snapshot of all sessions, oldest first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Merge a patch into a session
    ///
    /// Rejects state changes the connection state machine does not allow.
    pub fn update(&self, session_id: &str, patch: SessionPatch) -> Result<Session, GridError> {
        let (session, changed) = {
            let mut entry = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| GridError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;

            if let Some(next) = patch.state {
                if !entry.state.can_advance_to(next) {
                    warn!(
                        "Rejected transition {} -> {} for session {}",
                        entry.state, next, session_id
                    );
                    return Err(GridError::InvalidTransition {
                        session_id: session_id.to_string(),
                        from: entry.state.to_string(),
                        to: next.to_string(),
                    });
                }
            }

            let changed = entry.apply(&patch);
            (entry.clone(), changed)
        };

        if !changed.is_empty() {
            debug!("Session {} updated: {:?}", session_id, changed);
            let _ = self.events.send(SessionEvent::Updated {
                session: session.clone(),
                changed,
            });
        }
        Ok(session)
    }

    /// Remove a session
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id).map(|(_, s)| s);
        if removed.is_some() {
            debug!("Session {} removed", session_id);
            let _ = self.events.send(SessionEvent::Removed {
                session_id: session_id.to_string(),
            });
        }
        removed
    }

    /// Subscribe to session changes
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_only_advance() {
        use ConnectionState::*;

        assert!(Idle.can_advance_to(AttemptingP2p));
        assert!(AttemptingP2p.can_advance_to(AttemptingStun));
        assert!(AttemptingP2p.can_advance_to(AttemptingTurn));
        assert!(AttemptingStun.can_advance_to(ConnectedStun));
        assert!(ConnectedStun.can_advance_to(Idle));
        assert!(ConnectedTurn.can_advance_to(Reconnecting));

        assert!(!AttemptingStun.can_advance_to(AttemptingP2p));
        assert!(!AttemptingP2p.can_advance_to(ConnectedStun));
        assert!(!Idle.can_advance_to(ConnectedP2p));
        assert!(!Idle.can_advance_to(Reconnecting));
        assert!(!ConnectedP2p.can_advance_to(AttemptingStun));
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::AttemptingP2p).unwrap(),
            "\"attempting-p2p\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::QuotaExceeded).unwrap(),
            "\"quota-exceeded\""
        );
        assert_eq!(ConnectionState::ConnectedStun.to_string(), "connected-stun");
    }

    #[test]
    fn test_patch_merges_only_named_fields() {
        let registry = SessionRegistry::new();
        let session = registry.create("bob", "g1");

        registry
            .update(
                &session.session_id,
                SessionPatch::new().state(ConnectionState::AttemptingP2p),
            )
            .unwrap();
        registry
            .update(
                &session.session_id,
                SessionPatch::new()
                    .has_media_session(true)
                    .track(TrackKind::Audio, true),
            )
            .unwrap();

        let merged = registry.get(&session.session_id).unwrap();
        assert_eq!(merged.state, ConnectionState::AttemptingP2p);
        assert!(merged.has_media_session);
        assert!(merged.has_audio);
        assert!(!merged.has_video);
    }

    #[test]
    fn test_last_error_is_tri_state() {
        let mut session = Session::new("s1", "bob", "g1");

        session.apply(&SessionPatch::new().error("boom"));
        assert_eq!(session.last_error.as_deref(), Some("boom"));

        let changed = session.apply(&SessionPatch::new().state(ConnectionState::AttemptingP2p));
        assert_eq!(changed, vec![SessionField::State]);
        assert_eq!(session.last_error.as_deref(), Some("boom"));

        session.apply(&SessionPatch::new().clear_error());
        assert!(session.last_error.is_none());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let registry = SessionRegistry::new();
        registry.insert(Session::new("s1", "bob", "g1"));
        registry
            .update("s1", SessionPatch::new().state(ConnectionState::AttemptingStun))
            .unwrap();

        let err = registry
            .update("s1", SessionPatch::new().state(ConnectionState::AttemptingP2p))
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert_eq!(
            registry.get("s1").unwrap().state,
            ConnectionState::AttemptingStun
        );
    }

    #[test]
    fn test_unchanged_patch_emits_nothing() {
        let registry = SessionRegistry::new();
        registry.insert(Session::new("s1", "bob", "g1"));
        let mut events = registry.subscribe();

        registry
            .update("s1", SessionPatch::new().media_connected(false))
            .unwrap();
        assert!(events.try_recv().is_err());

        registry
            .update("s1", SessionPatch::new().media_connected(true))
            .unwrap();
        match events.try_recv().unwrap() {
            SessionEvent::Updated { changed, .. } => {
                assert_eq!(changed, vec![SessionField::MediaConnected])
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_update_missing_session() {
        let registry = SessionRegistry::new();
        let err = registry.update("nope", SessionPatch::new()).unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[test]
    fn test_remove_emits_once() {
        let registry = SessionRegistry::new();
        registry.insert(Session::new("s1", "bob", "g1"));
        let mut events = registry.subscribe();

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());

        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Removed { .. }
        ));
        assert!(events.try_recv().is_err());
        assert!(registry.is_empty());
    }
}
