//! Media sessions nested under data sessions

use crate::tracks::{TrackAction, TrackEvent, TrackHistory};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gridlink_core::{
    GridError, LocalTrack, RemoteTrack, SessionPatch, SessionRegistry, TrackKind,
};
use gridlink_signaling::{
    MediaPeerFactory, PeerEvent, PeerSignalingRouter, SignalingChannel, SignalingEnvelope,
    TrackChange,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Media state of one data session
pub struct MediaSession {
    session_id: String,
    grid_id: String,
    peer_user_id: String,
    router: PeerSignalingRouter,
    remote_tracks: DashMap<String, RemoteTrack>,
    tracks_per_participant: DashMap<String, u32>,
    participant_count: AtomicU32,
    history: Mutex<TrackHistory>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("session_id", &self.session_id)
            .field("grid_id", &self.grid_id)
            .field("participant_count", &self.participant_count())
            .finish()
    }
}

impl MediaSession {
    /// Data session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Grid (signaling channel) ID
    pub fn grid_id(&self) -> &str {
        &self.grid_id
    }

    /// Signaling router of this session
    pub fn router(&self) -> &PeerSignalingRouter {
        &self.router
    }

    /// Remote participants currently sending at least one track
    pub fn participant_count(&self) -> u32 {
        self.participant_count.load(Ordering::SeqCst)
    }

    /// Remote tracks currently received
    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.iter().map(|t| t.value().clone()).collect()
    }

    /// Local tracks currently published
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.router.local_tracks()
    }

    /// Recorded track changes, oldest first
    pub fn history(&self) -> Vec<TrackEvent> {
        self.history.lock().events()
    }

    /// Whether at least one peer connection is connected
    pub fn is_media_connected(&self) -> bool {
        self.router.connected_peer_count() > 0
    }

    fn record(&self, event: TrackEvent) {
        self.history.lock().record(event);
    }

    /// Record a remote track; returns the participant count, or `None` for a duplicate
    fn add_remote_track(&self, track: RemoteTrack) -> Option<u32> {
        let participant_id = track.participant_id().to_string();
        match self.remote_tracks.entry(track.id().to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(track);
            }
        }

        let first_track = {
            let mut count = self
                .tracks_per_participant
                .entry(participant_id)
                .or_insert(0);
            *count += 1;
            *count == 1
        };
        if first_track {
            Some(self.participant_count.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            Some(self.participant_count())
        }
    }

    /// Drop a remote track; returns it with the participant count
    fn remove_remote_track(&self, track_id: &str) -> Option<(RemoteTrack, u32)> {
        let (_, track) = self.remote_tracks.remove(track_id)?;

        let last_track = match self.tracks_per_participant.get_mut(track.participant_id()) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        let count = if last_track {
            self.tracks_per_participant
                .remove_if(track.participant_id(), |_, c| *c == 0);
            self.participant_count.fetch_sub(1, Ordering::SeqCst) - 1
        } else {
            self.participant_count()
        };
        Some((track, count))
    }
}

/// Registry of media sessions, keyed by data session ID
pub struct MediaSessionRegistry {
    sessions: Arc<SessionRegistry>,
    factory: Arc<dyn MediaPeerFactory>,
    channel: Arc<dyn SignalingChannel>,
    local_user_id: String,
    media: DashMap<String, Arc<MediaSession>>,
    track_tx: broadcast::Sender<TrackEvent>,
}

impl std::fmt::Debug for MediaSessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSessionRegistry")
            .field("local_user_id", &self.local_user_id)
            .field("media_sessions", &self.media.len())
            .finish()
    }
}

impl MediaSessionRegistry {
    /// Create a registry writing into the given session registry
    pub fn new(
        sessions: Arc<SessionRegistry>,
        factory: Arc<dyn MediaPeerFactory>,
        channel: Arc<dyn SignalingChannel>,
        local_user_id: impl Into<String>,
    ) -> Self {
        let (track_tx, _) = broadcast::channel(256);
        Self {
            sessions,
            factory,
            channel,
            local_user_id: local_user_id.into(),
            media: DashMap::new(),
            track_tx,
        }
    }

    /// Local participant ID
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Open a media session for an existing data session; idempotent
    ///
    /// The router and its event pump are only built for the call that inserts
    /// the entry. If the data session disappears before it is marked, the new
    /// entry is discarded again.
    pub fn initialize(&self, session_id: &str) -> Result<Arc<MediaSession>, GridError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| GridError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        let media = match self.media.entry(session_id.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (router, peer_events) = PeerSignalingRouter::new(
                    session_id,
                    session.grid_id.clone(),
                    self.local_user_id.clone(),
                    self.factory.clone(),
                    self.channel.clone(),
                );
                let media = Arc::new(MediaSession {
                    session_id: session_id.to_string(),
                    grid_id: session.grid_id.clone(),
                    peer_user_id: session.peer_user_id.clone(),
                    router,
                    remote_tracks: DashMap::new(),
                    tracks_per_participant: DashMap::new(),
                    participant_count: AtomicU32::new(0),
                    history: Mutex::new(TrackHistory::new()),
                    pump: Mutex::new(None),
                });
                *media.pump.lock() = Some(tokio::spawn(pump_peer_events(
                    Arc::downgrade(&media),
                    self.sessions.clone(),
                    self.track_tx.clone(),
                    peer_events,
                )));
                slot.insert(media.clone());
                media
            }
        };

        if let Err(e) = self
            .sessions
            .update(session_id, SessionPatch::new().has_media_session(true))
        {
            self.discard(&media);
            return Err(e);
        }
        info!("Media session opened for {}", session_id);
        Ok(media)
    }

    /// Drop an entry whose data session vanished while it was being opened
    fn discard(&self, media: &Arc<MediaSession>) {
        self.media
            .remove_if(&media.session_id, |_, m| Arc::ptr_eq(m, media));
        if let Some(pump) = media.pump.lock().take() {
            pump.abort();
        }
        debug!(
            "Discarded media session for vanished session {}",
            media.session_id
        );
        // Peers may have been created by signaling that raced the open.
        let media = media.clone();
        tokio::spawn(async move {
            media.router.close_all().await;
        });
    }

    /// Close a media session; idempotent
    ///
    /// Stops event processing, closes every peer connection and resets the
    /// media fields of the data session if it still exists.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some((_, media)) = self.media.remove(session_id) else {
            return false;
        };

        let pump = media.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }
        media.router.close_all().await;

        let remote_ids: Vec<String> = media.remote_tracks.iter().map(|t| t.key().clone()).collect();
        for track_id in remote_ids {
            if let Some((track, _)) = media.remove_remote_track(&track_id) {
                self.publish(
                    &media,
                    TrackEvent::remote(
                        session_id,
                        track.participant_id(),
                        track.kind(),
                        track.id(),
                        TrackAction::Removed,
                    ),
                );
            }
        }

        let mut patch = SessionPatch::new()
            .has_media_session(false)
            .media_connected(false)
            .participant_count(0);
        for kind in TrackKind::ALL {
            patch = patch.track(kind, false);
        }
        if let Err(e) = self.sessions.update(session_id, patch) {
            debug!("Media close for {} without data session: {}", session_id, e);
        }

        info!("Media session closed for {}", session_id);
        true
    }

    /// Close every media session
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.media.iter().map(|m| m.key().clone()).collect();
        for session_id in ids {
            self.close(&session_id).await;
        }
    }

    /// Media session of a data session
    pub fn get(&self, session_id: &str) -> Option<Arc<MediaSession>> {
        self.media.get(session_id).map(|m| m.clone())
    }

    /// Whether a media session is open
    pub fn contains(&self, session_id: &str) -> bool {
        self.media.contains_key(session_id)
    }

    /// Number of open media sessions
    pub fn len(&self) -> usize {
        self.media.len()
    }

    /// Whether no media session is open
    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
    }

    /// Publish a local track
    ///
    /// A different track of the same kind is recorded as removed, then the new
    /// one as added.
    pub async fn add_local_track(
        &self,
        session_id: &str,
        track: LocalTrack,
    ) -> Result<TrackChange, GridError> {
        let media = self.require(session_id)?;
        let kind = track.kind();
        let track_id = track.id().to_string();

        let change = media.router.replace_local_track(track).await;
        match &change {
            TrackChange::Unchanged => {
                debug!("Track {} already published on {}", track_id, session_id);
                return Ok(change);
            }
            TrackChange::Replaced { previous_track_id } => {
                self.publish(
                    &media,
                    TrackEvent::local(session_id, kind, previous_track_id, TrackAction::Removed),
                );
            }
            TrackChange::Added => {}
        }
        self.publish(
            &media,
            TrackEvent::local(session_id, kind, &track_id, TrackAction::Added),
        );
        self.sessions
            .update(session_id, SessionPatch::new().track(kind, true))?;
        Ok(change)
    }

    /// Stop publishing the local track of a kind
    pub async fn remove_local_track(
        &self,
        session_id: &str,
        kind: TrackKind,
    ) -> Result<Option<LocalTrack>, GridError> {
        let media = self.require(session_id)?;
        let Some(removed) = media.router.remove_local_track(kind).await else {
            return Ok(None);
        };

        self.publish(
            &media,
            TrackEvent::local(session_id, kind, removed.id(), TrackAction::Removed),
        );
        self.sessions
            .update(session_id, SessionPatch::new().track(kind, false))?;
        Ok(Some(removed))
    }

    /// Swap a local track for one of a possibly different kind (camera to screen)
    ///
    /// Recorded as removal of the old kind followed by addition of the new one.
    pub async fn replace_local_track(
        &self,
        session_id: &str,
        old_kind: TrackKind,
        track: LocalTrack,
    ) -> Result<TrackChange, GridError> {
        if old_kind == track.kind() {
            return self.add_local_track(session_id, track).await;
        }
        let removed = self.remove_local_track(session_id, old_kind).await?;
        let change = self.add_local_track(session_id, track).await?;
        Ok(match (removed, change) {
            (Some(previous), TrackChange::Added) => TrackChange::Replaced {
                previous_track_id: previous.id().to_string(),
            },
            (_, change) => change,
        })
    }

    /// Start media with a remote participant of a session
    pub async fn connect_to(&self, session_id: &str, participant_id: &str) -> Result<(), GridError> {
        self.require(session_id)?
            .router
            .connect_to(participant_id)
            .await
    }

    /// Route an inbound signaling message to the media session it belongs to
    ///
    /// Sessions on the envelope's channel are tried in order: one that already
    /// has a peer for the sender, then one whose data session peer is the
    /// sender, then any.
    pub async fn handle_signaling(&self, envelope: SignalingEnvelope) -> Result<(), GridError> {
        let candidates: Vec<Arc<MediaSession>> = self
            .media
            .iter()
            .filter(|m| m.grid_id == envelope.channel_id)
            .map(|m| m.value().clone())
            .collect();

        let from = envelope.from_user_id.as_str();
        let target = candidates
            .iter()
            .find(|m| m.router.peer(from).is_some())
            .or_else(|| candidates.iter().find(|m| m.peer_user_id == from))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| GridError::MediaSessionNotFound {
                session_id: format!("channel {}", envelope.channel_id),
            })?;

        target.router.handle_message(envelope).await
    }

    /// Subscribe to local and remote track changes
    pub fn subscribe_tracks(&self) -> broadcast::Receiver<TrackEvent> {
        self.track_tx.subscribe()
    }

    fn require(&self, session_id: &str) -> Result<Arc<MediaSession>, GridError> {
        self.get(session_id)
            .ok_or_else(|| GridError::MediaSessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    fn publish(&self, media: &MediaSession, event: TrackEvent) {
        media.record(event.clone());
        let _ = self.track_tx.send(event);
    }
}

/// Drain peer events of one media session until it closes
async fn pump_peer_events(
    media: Weak<MediaSession>,
    sessions: Arc<SessionRegistry>,
    track_tx: broadcast::Sender<TrackEvent>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(media) = media.upgrade() else {
            break;
        };

        if let Err(e) = media.router.handle_peer_event(&event).await {
            warn!(
                "Session {}: peer event from {} failed: {}",
                media.session_id,
                event.participant_id(),
                e
            );
        }

        let patch = match event {
            PeerEvent::StateChanged { .. } => {
                SessionPatch::new().media_connected(media.is_media_connected())
            }
            PeerEvent::RemoteTrackAdded {
                participant_id,
                track,
            } => {
                let kind = track.kind();
                let track_id = track.id().to_string();
                let Some(count) = media.add_remote_track(track) else {
                    continue;
                };
                let event = TrackEvent::remote(
                    &media.session_id,
                    &participant_id,
                    kind,
                    &track_id,
                    TrackAction::Added,
                );
                media.record(event.clone());
                let _ = track_tx.send(event);
                SessionPatch::new().participant_count(count)
            }
            PeerEvent::RemoteTrackRemoved {
                participant_id,
                track_id,
            } => {
                let Some((track, count)) = media.remove_remote_track(&track_id) else {
                    continue;
                };
                let event = TrackEvent::remote(
                    &media.session_id,
                    &participant_id,
                    track.kind(),
                    &track_id,
                    TrackAction::Removed,
                );
                media.record(event.clone());
                let _ = track_tx.send(event);
                SessionPatch::new().participant_count(count)
            }
            PeerEvent::LocalCandidate { .. } => continue,
        };

        if let Err(e) = sessions.update(&media.session_id, patch) {
            debug!("Session {} gone while media active: {}", media.session_id, e);
        }
    }
}
