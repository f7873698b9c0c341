//! Seams to the real-time transport engine and the local audio source
//!
//! The core never touches media. It drives an engine through the capability
//! set below and receives the engine's callbacks as [`TransportEvent`]s on the
//! coordinator's event queue.

use crate::error::{CallError, TransportError};
use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Factory for per-peer transport sessions
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Create a session whose callbacks are delivered through `sink`.
    async fn create_session(
        &self,
        sink: EventSink,
    ) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Create a throwaway session that only gathers candidates. Used for
    /// identity discovery; never carries media.
    async fn create_probe(
        &self,
        sink: EventSink,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// One negotiated transport towards one remote participant
#[async_trait]
pub trait TransportSession: Send {
    async fn attach_media(&mut self, media: &LocalMedia) -> Result<(), TransportError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Apply a remote candidate. Already known candidates must be tolerated.
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Engine callback, tagged with the session it came from
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub participant: ParticipantId,
    pub session: u64,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Local candidate discovered, to be sent to the remote side
    IceCandidate(IceCandidate),
    /// Remote media track arrived
    Track { track_id: String },
    /// Transport reached the connected state
    Connected,
    /// Transport failed or was torn down by the remote side
    Disconnected,
}

/// Callback registration handed to the engine once per session
#[derive(Debug, Clone)]
pub struct EventSink {
    participant: ParticipantId,
    session: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(
        participant: ParticipantId,
        session: u64,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            participant,
            session,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEventKind::IceCandidate(candidate));
    }

    pub fn track(&self, track_id: impl Into<String>) {
        self.emit(TransportEventKind::Track {
            track_id: track_id.into(),
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEventKind::Connected);
    }

    pub fn disconnected(&self) {
        self.emit(TransportEventKind::Disconnected);
    }

    fn emit(&self, kind: TransportEventKind) {
        // Receiver is gone once the call is torn down; late callbacks are dropped.
        let _ = self.tx.send(TransportEvent {
            participant: self.participant.clone(),
            session: self.session,
            kind,
        });
    }
}

/// Captured local audio, shared read-only by every peer session
#[derive(Clone)]
pub struct LocalMedia {
    id: String,
    track: Arc<dyn Any + Send + Sync>,
}

impl LocalMedia {
    pub fn new(id: impl Into<String>, track: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: id.into(),
            track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Engine-specific track handle
    pub fn track<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.track.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia").field("id", &self.id).finish()
    }
}

/// Audio capture collaborator
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Capture local audio. Fails with [`CallError::MediaAcquisitionFailed`].
    async fn acquire(&self) -> Result<LocalMedia, CallError>;

    /// Stop capture. Called exactly once per successful `acquire`.
    fn release(&self, media: LocalMedia);
}
