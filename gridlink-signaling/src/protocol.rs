//! Signaling protocol messages

use gridlink_core::GridError;
use serde::{Deserialize, Serialize};

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with only the candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description handed to a media peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Media negotiation message between two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Offer to start or renegotiate media
    Offer {
        /// SDP body
        sdp: String,
    },
    /// Answer to a received offer
    Answer {
        /// SDP body
        sdp: String,
    },
    /// Trickled ICE candidate
    IceCandidate {
        /// Candidate details
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Addressed signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    /// Channel (grid) the message travels on
    pub channel_id: String,
    /// Sending participant
    pub from_user_id: String,
    /// Receiving participant
    pub to_user_id: String,
    /// Payload
    pub message: SignalingMessage,
}

impl SignalingEnvelope {
    /// Encode as JSON
    pub fn to_json(&self) -> Result<String, GridError> {
        serde_json::to_string(self).map_err(|e| GridError::InvalidMessage {
            message: format!("{} envelope for {}", self.message.kind(), self.to_user_id),
            source: e.into(),
        })
    }

    /// Decode from JSON
    pub fn from_json(text: &str) -> Result<Self, GridError> {
        serde_json::from_str(text).map_err(|e| GridError::InvalidMessage {
            message: text.to_string(),
            source: e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_format() {
        let json = serde_json::to_value(SignalingMessage::Offer {
            sdp: "v=0".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_wire_format() {
        let message: SignalingMessage = serde_json::from_str(
            r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        match message {
            SignalingMessage::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_envelope_rejects_unknown_type() {
        let err = SignalingEnvelope::from_json(
            r#"{"channel_id":"g1","from_user_id":"a","to_user_id":"b","message":{"type":"bye"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
    }
}
