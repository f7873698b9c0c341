//! Error types for the call core

use crate::negotiation::{NegotiationState, Trigger};
use crate::protocol::ParticipantId;
use thiserror::Error;

/// Errors surfaced by the mesh coordinator and its components
#[derive(Error, Debug)]
pub enum CallError {
    /// No local participant identifier could be derived
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// Local audio could not be captured
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),

    /// Offer/answer applied out of order for a session
    #[error("Invalid negotiation transition for {participant}: {trigger} in state {state}")]
    InvalidNegotiationTransition {
        participant: ParticipantId,
        state: NegotiationState,
        trigger: Trigger,
    },

    /// Envelope references a participant with no live session
    #[error("Stale {kind} from {participant}")]
    StaleSignalingMessage {
        participant: ParticipantId,
        kind: &'static str,
    },

    /// Signaling channel dropped
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Operation requires an active call
    #[error("No active call")]
    NotInCall,

    /// Call start requested while a call is active
    #[error("Call already active")]
    AlreadyInCall,

    /// Attempt to register the local participant as a remote peer
    #[error("Refusing to create a session for the local participant {0}")]
    SelfSession(ParticipantId),

    /// Transport engine failure scoped to one session
    #[error("Transport error for {participant}: {source}")]
    Transport {
        participant: ParticipantId,
        #[source]
        source: TransportError,
    },

    /// Signaling channel failure other than closure
    #[error("Channel error: {0}")]
    Channel(ChannelError),

    /// Invalid configuration value
    #[error("Config error: {0}")]
    Config(String),
}

impl From<ChannelError> for CallError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Close => CallError::ChannelClosed,
            other => CallError::Channel(other),
        }
    }
}

/// Errors from a signaling channel
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Connection was closed
    #[error("Connection closed")]
    Close,

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message carried no recognised tag
    #[error("Unsupported message type")]
    UnsupportedType,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Login gate rejected the credentials
    #[error("Login rejected")]
    Unauthorized,
}

/// Errors reported by a transport engine
#[derive(Error, Debug)]
pub enum TransportError {
    /// The engine rejected an operation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Session was already released
    #[error("Transport session closed")]
    Closed,
}
