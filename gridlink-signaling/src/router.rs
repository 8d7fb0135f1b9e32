//! Routes offer/answer/ICE messages to per-participant peer connections

use crate::channel::SignalingChannel;
use crate::peer::{MediaPeerFactory, PeerConnection, PeerEvent, TrackChange};
use crate::protocol::{IceCandidate, SessionDescription, SignalingEnvelope, SignalingMessage};
use dashmap::DashMap;
use gridlink_core::{GridError, LocalTrack, TrackKind, TransportState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Candidates held per participant before its peer exists
pub const MAX_EARLY_CANDIDATES: usize = 64;

/// Participants whose candidates may be held at once
pub const MAX_EARLY_PARTICIPANTS: usize = 32;

/// Per-session signaling router
///
/// Owns one [`PeerConnection`] per remote participant. Failures are reported
/// per participant as [`GridError::Signaling`] and never affect other peers.
pub struct PeerSignalingRouter {
    session_id: String,
    channel_id: String,
    local_user_id: String,
    factory: Arc<dyn MediaPeerFactory>,
    channel: Arc<dyn SignalingChannel>,
    peers: DashMap<String, Arc<PeerConnection>>,
    early_candidates: DashMap<String, Vec<IceCandidate>>,
    local_tracks: parking_lot::RwLock<HashMap<TrackKind, LocalTrack>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    create_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PeerSignalingRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSignalingRouter")
            .field("session_id", &self.session_id)
            .field("channel_id", &self.channel_id)
            .field("peers", &self.peers.len())
            .finish()
    }
}

impl PeerSignalingRouter {
    /// Create a router; peer events of every created peer arrive on the returned receiver
    pub fn new(
        session_id: impl Into<String>,
        channel_id: impl Into<String>,
        local_user_id: impl Into<String>,
        factory: Arc<dyn MediaPeerFactory>,
        channel: Arc<dyn SignalingChannel>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id: session_id.into(),
                channel_id: channel_id.into(),
                local_user_id: local_user_id.into(),
                factory,
                channel,
                peers: DashMap::new(),
                early_candidates: DashMap::new(),
                local_tracks: parking_lot::RwLock::new(HashMap::new()),
                peer_events,
                create_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Session this router belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Signaling channel (grid) ID
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Local participant ID
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Handle an inbound signaling message
    pub async fn handle_message(&self, envelope: SignalingEnvelope) -> Result<(), GridError> {
        let from = envelope.from_user_id;
        debug!(
            "Session {}: {} from {}",
            self.session_id,
            envelope.message.kind(),
            from
        );

        match envelope.message {
            SignalingMessage::Offer { sdp } => {
                let result = self.answer_offer(&from, sdp).await;
                if result.is_err() {
                    // A half-negotiated peer is useless; drop it so a new offer starts clean.
                    self.close_peer(&from).await;
                }
                result
            }
            SignalingMessage::Answer { sdp } => {
                let peer = self.peer(&from).ok_or_else(|| GridError::Signaling {
                    participant_id: from.clone(),
                    reason: "answer without a pending offer".to_string(),
                })?;
                peer.apply_remote_description(SessionDescription::answer(sdp))
                    .await
                    .map_err(|e| signaling_error(&from, e))?;
                Ok(())
            }
            SignalingMessage::IceCandidate { candidate } => match self.peer(&from) {
                Some(peer) => {
                    peer.add_ice_candidate(candidate)
                        .await
                        .map_err(|e| signaling_error(&from, e))?;
                    Ok(())
                }
                None => {
                    // Peer creation drains held candidates under this lock.
                    let _guard = self.create_lock.lock().await;
                    if let Some(peer) = self.peer(&from) {
                        peer.add_ice_candidate(candidate)
                            .await
                            .map_err(|e| signaling_error(&from, e))?;
                        return Ok(());
                    }
                    self.hold_early_candidate(&from, candidate);
                    Ok(())
                }
            },
        }
    }

    /// Initiate media with a participant: create the peer, attach local tracks, send an offer
    pub async fn connect_to(&self, participant_id: &str) -> Result<(), GridError> {
        let result: Result<(), GridError> = async {
            let peer = self.get_or_create_peer(participant_id).await?;
            let sdp = peer.create_offer().await?;
            self.send(participant_id, SignalingMessage::Offer { sdp })
                .await
        }
        .await;

        if let Err(e) = result {
            self.close_peer(participant_id).await;
            return Err(signaling_error(participant_id, e));
        }
        info!(
            "Session {}: sent offer to {}",
            self.session_id, participant_id
        );
        Ok(())
    }

    /// Apply signaling side effects of a peer event
    ///
    /// Local candidates are forwarded to the remote participant and state
    /// changes are recorded on the peer connection.
    pub async fn handle_peer_event(&self, event: &PeerEvent) -> Result<(), GridError> {
        match event {
            PeerEvent::LocalCandidate {
                participant_id,
                candidate,
            } => {
                self.send(
                    participant_id,
                    SignalingMessage::IceCandidate {
                        candidate: candidate.clone(),
                    },
                )
                .await
            }
            PeerEvent::StateChanged {
                participant_id,
                state,
            } => {
                if let Some(peer) = self.peer(participant_id) {
                    peer.set_state(*state);
                }
                if matches!(state, TransportState::Failed) {
                    warn!(
                        "Session {}: media with {} failed",
                        self.session_id, participant_id
                    );
                }
                Ok(())
            }
            PeerEvent::RemoteTrackAdded { .. } | PeerEvent::RemoteTrackRemoved { .. } => Ok(()),
        }
    }

    /// Set the local track of a kind and push it to every peer
    ///
    /// Each peer removes its stale sender before adding the new one. A peer
    /// that fails is logged and skipped.
    pub async fn replace_local_track(&self, track: LocalTrack) -> TrackChange {
        let change = {
            let mut tracks = self.local_tracks.write();
            let change = match tracks.get(&track.kind()) {
                Some(existing) if existing.id() == track.id() => TrackChange::Unchanged,
                Some(existing) => TrackChange::Replaced {
                    previous_track_id: existing.id().to_string(),
                },
                None => TrackChange::Added,
            };
            tracks.insert(track.kind(), track.clone());
            change
        };

        if change == TrackChange::Unchanged {
            return change;
        }

        for peer in self.peers_snapshot() {
            if let Err(e) = peer.attach_track(&track).await {
                warn!(
                    "Session {}: failed to attach {} track for {}: {}",
                    self.session_id,
                    track.kind(),
                    peer.participant_id(),
                    e
                );
            }
        }
        change
    }

    /// Remove the local track of a kind from every peer
    pub async fn remove_local_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        let removed = self.local_tracks.write().remove(&kind)?;
        for peer in self.peers_snapshot() {
            if let Err(e) = peer.detach_track(kind).await {
                warn!(
                    "Session {}: failed to detach {} track for {}: {}",
                    self.session_id,
                    kind,
                    peer.participant_id(),
                    e
                );
            }
        }
        Some(removed)
    }

    /// Local tracks currently published
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.local_tracks.read().values().cloned().collect()
    }

    /// Peer connection for a participant
    pub fn peer(&self, participant_id: &str) -> Option<Arc<PeerConnection>> {
        self.peers.get(participant_id).map(|p| p.clone())
    }

    /// Remote participants with a peer connection
    pub fn participants(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.key().clone()).collect()
    }

    /// Number of peer connections
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of connected peers
    pub fn connected_peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.is_connected()).count()
    }

    /// Close and drop one participant's peer connection
    pub async fn close_peer(&self, participant_id: &str) -> bool {
        self.early_candidates.remove(participant_id);
        let Some((_, peer)) = self.peers.remove(participant_id) else {
            return false;
        };
        if let Err(e) = peer.close().await {
            warn!(
                "Session {}: error closing peer {}: {}",
                self.session_id, participant_id, e
            );
        }
        true
    }

    /// Close every peer connection
    ///
    /// The router stays closed: peers still being created are closed as soon
    /// as their factory returns and no new ones are accepted.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let participants = self.participants();
        for participant_id in &participants {
            self.close_peer(participant_id).await;
        }
        self.early_candidates.clear();
        if !participants.is_empty() {
            info!(
                "Session {}: closed {} peer connections",
                self.session_id,
                participants.len()
            );
        }
    }

    /// Whether [`close_all`](Self::close_all) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn hold_early_candidate(&self, from: &str, candidate: IceCandidate) {
        if self.is_closed() {
            debug!(
                "Session {}: dropping candidate from {} after close",
                self.session_id, from
            );
            return;
        }
        if !self.early_candidates.contains_key(from)
            && self.early_candidates.len() >= MAX_EARLY_PARTICIPANTS
        {
            warn!(
                "Session {}: early candidates held for {} participants, dropping candidate from {}",
                self.session_id, MAX_EARLY_PARTICIPANTS, from
            );
            return;
        }
        let mut held = self.early_candidates.entry(from.to_string()).or_default();
        if held.len() >= MAX_EARLY_CANDIDATES {
            debug!(
                "Session {}: {} early candidates held for {}, dropping newest",
                self.session_id, MAX_EARLY_CANDIDATES, from
            );
            return;
        }
        held.push(candidate);
        debug!("Holding early candidate from {}", from);
    }

    async fn answer_offer(&self, from: &str, sdp: String) -> Result<(), GridError> {
        let peer = self.get_or_create_peer(from).await?;
        peer.apply_remote_description(SessionDescription::offer(sdp))
            .await
            .map_err(|e| signaling_error(from, e))?;
        let answer = peer
            .create_answer()
            .await
            .map_err(|e| signaling_error(from, e))?;
        self.send(from, SignalingMessage::Answer { sdp: answer })
            .await
    }

    async fn get_or_create_peer(&self, participant_id: &str) -> Result<Arc<PeerConnection>, GridError> {
        if let Some(peer) = self.peer(participant_id) {
            return Ok(peer);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(peer) = self.peer(participant_id) {
            return Ok(peer);
        }
        if self.is_closed() {
            return Err(self.closed_error(participant_id));
        }

        let media_peer = self
            .factory
            .create(participant_id, self.peer_events.clone())
            .await
            .map_err(|e| signaling_error(participant_id, e))?;
        if self.is_closed() {
            if let Err(e) = media_peer.close().await {
                debug!(
                    "Session {}: error closing orphan peer {}: {}",
                    self.session_id, participant_id, e
                );
            }
            return Err(self.closed_error(participant_id));
        }
        let early = self
            .early_candidates
            .remove(participant_id)
            .map(|(_, c)| c)
            .unwrap_or_default();
        let peer = Arc::new(PeerConnection::new(participant_id, media_peer, early));

        let tracks = self.local_tracks();
        for track in &tracks {
            if let Err(e) = peer.attach_track(track).await {
                let _ = peer.close().await;
                return Err(signaling_error(participant_id, e));
            }
        }

        self.peers.insert(participant_id.to_string(), peer.clone());
        // close_all may have taken its snapshot before this insert
        if self.is_closed() {
            self.close_peer(participant_id).await;
            return Err(self.closed_error(participant_id));
        }
        info!(
            "Session {}: created peer connection for {} with {} local tracks",
            self.session_id,
            participant_id,
            tracks.len()
        );
        Ok(peer)
    }

    fn closed_error(&self, participant_id: &str) -> GridError {
        GridError::Signaling {
            participant_id: participant_id.to_string(),
            reason: format!("media session {} is closed", self.session_id),
        }
    }

    async fn send(&self, to: &str, message: SignalingMessage) -> Result<(), GridError> {
        self.channel
            .send(SignalingEnvelope {
                channel_id: self.channel_id.clone(),
                from_user_id: self.local_user_id.clone(),
                to_user_id: to.to_string(),
                message,
            })
            .await
            .map_err(|e| signaling_error(to, e))
    }

    fn peers_snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }
}

fn signaling_error(participant_id: &str, err: GridError) -> GridError {
    match err {
        GridError::Signaling { .. } => err,
        other => GridError::Signaling {
            participant_id: participant_id.to_string(),
            reason: other.to_string(),
        },
    }
}
