//! Per-participant media peer connections
//!
//! The media stack itself (descriptions, candidates, senders) is an external
//! capability behind [`MediaPeer`]. [`PeerConnection`] wraps one of them with
//! the bookkeeping signaling needs: candidates that arrive before the remote
//! description are held and flushed in arrival order, and there is at most
//! one sender per track kind.

use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use gridlink_core::{GridError, LocalTrack, RemoteTrack, TrackKind, TransportState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Handle of a track sender inside a media peer
pub type SenderId = String;

/// Notification raised by a media peer
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Connection state changed
    StateChanged {
        /// Remote participant
        participant_id: String,
        /// New state
        state: TransportState,
    },
    /// A local candidate was gathered and must reach the remote side
    LocalCandidate {
        /// Remote participant
        participant_id: String,
        /// Gathered candidate
        candidate: IceCandidate,
    },
    /// The remote side started sending a track
    RemoteTrackAdded {
        /// Remote participant
        participant_id: String,
        /// Track received
        track: RemoteTrack,
    },
    /// The remote side stopped sending a track
    RemoteTrackRemoved {
        /// Remote participant
        participant_id: String,
        /// Track ID that ended
        track_id: String,
    },
}

impl PeerEvent {
    /// Participant the event belongs to
    pub fn participant_id(&self) -> &str {
        match self {
            PeerEvent::StateChanged { participant_id, .. }
            | PeerEvent::LocalCandidate { participant_id, .. }
            | PeerEvent::RemoteTrackAdded { participant_id, .. }
            | PeerEvent::RemoteTrackRemoved { participant_id, .. } => participant_id,
        }
    }
}

/// Media peer primitive for one remote participant
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Apply the remote description
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), GridError>;

    /// Create an offer and apply it locally; returns the SDP
    async fn create_offer(&self) -> Result<String, GridError>;

    /// Create an answer and apply it locally; returns the SDP
    async fn create_answer(&self) -> Result<String, GridError>;

    /// Add a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), GridError>;

    /// Start sending a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, GridError>;

    /// Stop a sender
    async fn remove_track(&self, sender: &SenderId) -> Result<(), GridError>;

    /// Release the peer
    async fn close(&self) -> Result<(), GridError>;
}

/// Creates media peers; events of the created peer go to `events`
#[async_trait]
pub trait MediaPeerFactory: Send + Sync {
    /// Create a peer for a remote participant
    async fn create(
        &self,
        participant_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn MediaPeer>, GridError>;
}

/// Outcome of attaching a local track
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackChange {
    /// No track of this kind was attached before
    Added,
    /// A different track of the same kind was swapped out
    Replaced {
        /// Track that was removed
        previous_track_id: String,
    },
    /// The identical track was already attached
    Unchanged,
}

#[derive(Default)]
struct PeerInner {
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    senders: HashMap<TrackKind, (String, SenderId)>,
    closed: bool,
}

/// A media peer plus its signaling bookkeeping
pub struct PeerConnection {
    participant_id: String,
    peer: Arc<dyn MediaPeer>,
    inner: Mutex<PeerInner>,
    state: parking_lot::RwLock<TransportState>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("participant_id", &self.participant_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl PeerConnection {
    /// Wrap a media peer, seeding candidates that arrived before it existed
    pub fn new(
        participant_id: impl Into<String>,
        peer: Arc<dyn MediaPeer>,
        early_candidates: Vec<IceCandidate>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            peer,
            inner: Mutex::new(PeerInner {
                pending_candidates: early_candidates,
                ..Default::default()
            }),
            state: parking_lot::RwLock::new(TransportState::New),
        }
    }

    /// Remote participant
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Last reported state
    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    /// Record a state reported by the peer
    pub fn set_state(&self, state: TransportState) {
        *self.state.write() = state;
    }

    /// Whether media is flowing
    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Candidates waiting for the remote description
    pub async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// Apply the remote description, then flush held candidates in arrival order
    ///
    /// Returns the number of candidates flushed. A candidate the peer rejects
    /// is logged and skipped.
    pub async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<usize, GridError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        self.peer.set_remote_description(description).await?;
        inner.remote_description_set = true;

        let pending = std::mem::take(&mut inner.pending_candidates);
        let flushed = pending.len();
        for candidate in pending {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!(
                    "Dropping buffered candidate for {}: {}",
                    self.participant_id, e
                );
            }
        }
        if flushed > 0 {
            debug!(
                "Flushed {} buffered candidates for {}",
                flushed, self.participant_id
            );
        }
        Ok(flushed)
    }

    /// Add a remote candidate, holding it until the remote description is set
    ///
    /// Returns `true` when the candidate was applied immediately.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<bool, GridError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if !inner.remote_description_set {
            inner.pending_candidates.push(candidate);
            return Ok(false);
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Create and apply a local offer
    pub async fn create_offer(&self) -> Result<String, GridError> {
        let inner = self.inner.lock().await;
        self.ensure_open(&inner)?;
        self.peer.create_offer().await
    }

    /// Create and apply a local answer
    pub async fn create_answer(&self) -> Result<String, GridError> {
        let inner = self.inner.lock().await;
        self.ensure_open(&inner)?;
        self.peer.create_answer().await
    }

    /// Attach a local track, removing the stale sender of the same kind first
    pub async fn attach_track(&self, track: &LocalTrack) -> Result<TrackChange, GridError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let same_track = inner
            .senders
            .get(&track.kind())
            .map(|(track_id, _)| track_id == track.id());
        let previous = match same_track {
            Some(true) => return Ok(TrackChange::Unchanged),
            Some(false) => inner.senders.remove(&track.kind()),
            None => None,
        };

        if let Some((_, sender)) = &previous {
            self.peer.remove_track(sender).await?;
        }
        let sender = self.peer.add_track(track).await?;
        inner
            .senders
            .insert(track.kind(), (track.id().to_string(), sender));

        Ok(match previous {
            Some((previous_track_id, _)) => TrackChange::Replaced { previous_track_id },
            None => TrackChange::Added,
        })
    }

    /// Detach the local track of a kind; returns whether one was attached
    pub async fn detach_track(&self, kind: TrackKind) -> Result<bool, GridError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        match inner.senders.remove(&kind) {
            Some((_, sender)) => {
                self.peer.remove_track(&sender).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of active senders
    pub async fn sender_count(&self) -> usize {
        self.inner.lock().await.senders.len()
    }

    /// Close the peer; idempotent
    pub async fn close(&self) -> Result<(), GridError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.pending_candidates.clear();
        inner.senders.clear();
        self.set_state(TransportState::Closed);

        info!("Closing peer connection with {}", self.participant_id);
        self.peer.close().await
    }

    fn ensure_open(&self, inner: &PeerInner) -> Result<(), GridError> {
        if inner.closed {
            return Err(GridError::Signaling {
                participant_id: self.participant_id.clone(),
                reason: "peer connection closed".to_string(),
            });
        }
        Ok(())
    }
}
