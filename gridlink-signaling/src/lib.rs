//! # Gridlink Signaling
//!
//! Offer/answer/ICE plumbing for gridlink media sessions.
//! Provides the signaling wire protocol, a WebSocket signaling channel, the
//! per-participant peer connection wrapper and the router that ties them
//! together.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod peer;
pub mod protocol;
pub mod router;

// Re-export main types
pub use channel::{SignalingChannel, WebSocketSignalingChannel};
pub use peer::{MediaPeer, MediaPeerFactory, PeerConnection, PeerEvent, SenderId, TrackChange};
pub use protocol::{IceCandidate, SdpType, SessionDescription, SignalingEnvelope, SignalingMessage};
pub use router::{PeerSignalingRouter, MAX_EARLY_CANDIDATES, MAX_EARLY_PARTICIPANTS};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gridlink_core::{GridError, LocalTrack, TrackKind};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingPeer {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaPeer for RecordingPeer {
        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), GridError> {
            self.calls.lock().push(format!("remote:{}", description.sdp));
            Ok(())
        }

        async fn create_offer(&self) -> Result<String, GridError> {
            Ok("offer".to_string())
        }

        async fn create_answer(&self) -> Result<String, GridError> {
            Ok("answer".to_string())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), GridError> {
            self.calls.lock().push(format!("ice:{}", candidate.candidate));
            Ok(())
        }

        async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, GridError> {
            self.calls.lock().push(format!("add:{}", track.id()));
            Ok(format!("sender-{}", track.id()))
        }

        async fn remove_track(&self, sender: &SenderId) -> Result<(), GridError> {
            self.calls.lock().push(format!("remove:{}", sender));
            Ok(())
        }

        async fn close(&self) -> Result<(), GridError> {
            self.calls.lock().push("close".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_candidates_flush_in_arrival_order() {
        let media = Arc::new(RecordingPeer::default());
        let peer = PeerConnection::new("bob", media.clone(), vec![IceCandidate::new("A")]);

        assert!(!peer.add_ice_candidate(IceCandidate::new("B")).await.unwrap());
        assert_eq!(peer.pending_candidate_count().await, 2);

        let flushed = peer
            .apply_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(flushed, 2);
        assert!(peer.add_ice_candidate(IceCandidate::new("C")).await.unwrap());

        assert_eq!(
            *media.calls.lock(),
            vec!["remote:v=0", "ice:A", "ice:B", "ice:C"]
        );
    }

    #[tokio::test]
    async fn test_replacing_track_removes_stale_sender_first() {
        let media = Arc::new(RecordingPeer::default());
        let peer = PeerConnection::new("bob", media.clone(), vec![]);

        assert_eq!(
            peer.attach_track(&LocalTrack::video("cam-1")).await.unwrap(),
            TrackChange::Added
        );
        assert_eq!(
            peer.attach_track(&LocalTrack::video("cam-1")).await.unwrap(),
            TrackChange::Unchanged
        );
        assert_eq!(
            peer.attach_track(&LocalTrack::video("cam-2")).await.unwrap(),
            TrackChange::Replaced {
                previous_track_id: "cam-1".to_string()
            }
        );
        assert_eq!(peer.sender_count().await, 1);
        assert_eq!(
            *media.calls.lock(),
            vec!["add:cam-1", "remove:sender-cam-1", "add:cam-2"]
        );

        assert!(peer.detach_track(TrackKind::Video).await.unwrap());
        assert!(!peer.detach_track(TrackKind::Video).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_peer_rejects_operations() {
        let media = Arc::new(RecordingPeer::default());
        let peer = PeerConnection::new("bob", media.clone(), vec![]);

        peer.close().await.unwrap();
        peer.close().await.unwrap();

        let err = peer
            .add_ice_candidate(IceCandidate::new("A"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SIGNALING_ERROR");
        assert_eq!(*media.calls.lock(), vec!["close"]);
    }
}
