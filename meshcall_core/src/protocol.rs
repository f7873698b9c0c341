//! Signaling envelopes and their JSON wire format
//!
//! Every message on the relay is one JSON object whose tag is the name of the
//! single populated field:
//!
//! ```json
//! {"announce": "10.0.0.7"}
//! {"offer": {"type": "offer", "sdp": "..."}, "senderId": "10.0.0.7", "target": "10.0.0.9"}
//! {"answer": {"type": "answer", "sdp": "..."}, "senderId": "10.0.0.9", "target": "10.0.0.7"}
//! {"candidate": {"candidate": "candidate:1 1 udp ...", "sdpMid": "0", "sdpMLineIndex": 0}, "senderId": "10.0.0.9"}
//! {"action": "call_started"}
//! ```
//!
//! `target` is optional; relays broadcast everything, so receivers drop
//! messages addressed to someone else.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one call participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn random() -> Self {
        uuid::Uuid::new_v4().into()
    }

    /// Key used for the single remote peer in pairwise topology, where
    /// envelopes do not have to name their sender.
    pub fn implicit_remote() -> Self {
        Self("remote".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<uuid::Uuid> for ParticipantId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// SDP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged during offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in browser JSON form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Connection address of the candidate line
    /// (`candidate:<foundation> <component> <transport> <priority> <address> ...`).
    pub fn address(&self) -> Option<&str> {
        self.candidate.split_whitespace().nth(4)
    }
}

/// Call presence flags understood by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    CallStarted,
    CallEnded,
}

/// One signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum SignalingEnvelope {
    Announce {
        participant: ParticipantId,
    },
    Offer {
        description: SessionDescription,
        sender: Option<ParticipantId>,
        target: Option<ParticipantId>,
    },
    Answer {
        description: SessionDescription,
        sender: Option<ParticipantId>,
        target: Option<ParticipantId>,
    },
    Candidate {
        candidate: IceCandidate,
        sender: Option<ParticipantId>,
        target: Option<ParticipantId>,
    },
    Action {
        action: CallAction,
        sender: Option<ParticipantId>,
    },
}

impl SignalingEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::Announce { .. } => "announce",
            SignalingEnvelope::Offer { .. } => "offer",
            SignalingEnvelope::Answer { .. } => "answer",
            SignalingEnvelope::Candidate { .. } => "candidate",
            SignalingEnvelope::Action { .. } => "action",
        }
    }

    /// Originating participant. An announce names its own sender.
    pub fn sender(&self) -> Option<&ParticipantId> {
        match self {
            SignalingEnvelope::Announce { participant } => Some(participant),
            SignalingEnvelope::Offer { sender, .. }
            | SignalingEnvelope::Answer { sender, .. }
            | SignalingEnvelope::Candidate { sender, .. }
            | SignalingEnvelope::Action { sender, .. } => sender.as_ref(),
        }
    }

    pub fn target(&self) -> Option<&ParticipantId> {
        match self {
            SignalingEnvelope::Offer { target, .. }
            | SignalingEnvelope::Answer { target, .. }
            | SignalingEnvelope::Candidate { target, .. } => target.as_ref(),
            SignalingEnvelope::Announce { .. } | SignalingEnvelope::Action { .. } => None,
        }
    }

    pub fn announce(participant: ParticipantId) -> Self {
        SignalingEnvelope::Announce { participant }
    }

    pub fn offer(
        description: SessionDescription,
        sender: &ParticipantId,
        target: Option<&ParticipantId>,
    ) -> Self {
        SignalingEnvelope::Offer {
            description,
            sender: Some(sender.clone()),
            target: target.cloned(),
        }
    }

    pub fn answer(
        description: SessionDescription,
        sender: &ParticipantId,
        target: Option<&ParticipantId>,
    ) -> Self {
        SignalingEnvelope::Answer {
            description,
            sender: Some(sender.clone()),
            target: target.cloned(),
        }
    }

    pub fn candidate(
        candidate: IceCandidate,
        sender: &ParticipantId,
        target: Option<&ParticipantId>,
    ) -> Self {
        SignalingEnvelope::Candidate {
            candidate,
            sender: Some(sender.clone()),
            target: target.cloned(),
        }
    }

    pub fn action(action: CallAction, sender: Option<&ParticipantId>) -> Self {
        SignalingEnvelope::Action {
            action,
            sender: sender.cloned(),
        }
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl FromStr for SignalingEnvelope {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wire: WireMessage = serde_json::from_str(s)?;
        Self::try_from(wire)
    }
}

impl fmt::Display for SignalingEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Flat form of an envelope as it appears on the wire
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) announce: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) action: Option<CallAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) sender_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) target: Option<ParticipantId>,
}

impl TryFrom<WireMessage> for SignalingEnvelope {
    type Error = ChannelError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let WireMessage {
            announce,
            offer,
            answer,
            candidate,
            action,
            sender_id: sender,
            target,
        } = wire;

        // First populated tag wins
        if let Some(participant) = announce.filter(|id| !id.is_empty()) {
            return Ok(SignalingEnvelope::Announce { participant });
        }
        if let Some(description) = offer {
            return Ok(SignalingEnvelope::Offer {
                description,
                sender,
                target,
            });
        }
        if let Some(description) = answer {
            return Ok(SignalingEnvelope::Answer {
                description,
                sender,
                target,
            });
        }
        if let Some(candidate) = candidate {
            return Ok(SignalingEnvelope::Candidate {
                candidate,
                sender,
                target,
            });
        }
        if let Some(action) = action {
            return Ok(SignalingEnvelope::Action { action, sender });
        }
        Err(ChannelError::UnsupportedType)
    }
}

impl From<SignalingEnvelope> for WireMessage {
    fn from(envelope: SignalingEnvelope) -> Self {
        match envelope {
            SignalingEnvelope::Announce { participant } => WireMessage {
                announce: Some(participant),
                ..Default::default()
            },
            SignalingEnvelope::Offer {
                description,
                sender,
                target,
            } => WireMessage {
                offer: Some(description),
                sender_id: sender,
                target,
                ..Default::default()
            },
            SignalingEnvelope::Answer {
                description,
                sender,
                target,
            } => WireMessage {
                answer: Some(description),
                sender_id: sender,
                target,
                ..Default::default()
            },
            SignalingEnvelope::Candidate {
                candidate,
                sender,
                target,
            } => WireMessage {
                candidate: Some(candidate),
                sender_id: sender,
                target,
                ..Default::default()
            },
            SignalingEnvelope::Action { action, sender } => WireMessage {
                action: Some(action),
                sender_id: sender,
                ..Default::default()
            },
        }
    }
}
