//! Peer session registry
//!
//! Owns one [`PeerSession`] per remote participant for the lifetime of a
//! single call. The coordinator creates a registry when a call starts and
//! tears it down with [`PeerSessionRegistry::close_all`] when it ends.

use crate::error::CallError;
use crate::negotiation::NegotiationState;
use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};
use crate::transport::TransportSession;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Negotiation state for one remote participant
pub struct PeerSession {
    pub(crate) participant: ParticipantId,
    pub(crate) serial: u64,
    pub(crate) state: NegotiationState,
    pub(crate) transport: Option<Box<dyn TransportSession>>,
    /// Remote candidates waiting for the remote description
    pub(crate) pending_candidates: VecDeque<IceCandidate>,
    pub(crate) local_description: Option<SessionDescription>,
    pub(crate) remote_description_set: bool,
    pub(crate) remote_tracks: Vec<String>,
}

impl PeerSession {
    fn new(participant: ParticipantId, serial: u64) -> Self {
        Self {
            participant,
            serial,
            state: NegotiationState::Idle,
            transport: None,
            pending_candidates: VecDeque::new(),
            local_description: None,
            remote_description_set: false,
            remote_tracks: Vec::new(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Registry-unique number, distinguishes a replaced session from its successor
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn pending_candidates(&self) -> &VecDeque<IceCandidate> {
        &self.pending_candidates
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Offer or answer this side applied
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn remote_tracks(&self) -> &[String] {
        &self.remote_tracks
    }

    /// Release the transport and drop buffered candidates. Safe from any state.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Failed to release transport for {}: {}", self.participant, e);
            }
        }
        self.pending_candidates.clear();
        self.state = NegotiationState::Closed;
        debug!("Session {} with {} closed", self.serial, self.participant);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("participant", &self.participant)
            .field("serial", &self.serial)
            .field("state", &self.state)
            .field("transport", &self.transport.is_some())
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}

/// Map of remote participant -> session for one call
pub struct PeerSessionRegistry {
    local: ParticipantId,
    sessions: HashMap<ParticipantId, PeerSession>,
    next_serial: u64,
}

impl PeerSessionRegistry {
    /// Create an empty registry. Session serials start after `serial_base`.
    pub fn new(local: ParticipantId, serial_base: u64) -> Self {
        Self {
            local,
            sessions: HashMap::new(),
            next_serial: serial_base,
        }
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Last serial handed out
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Existing session for `participant`, or a fresh `Idle` one.
    pub fn get_or_create(&mut self, participant: &ParticipantId) -> Result<&mut PeerSession, CallError> {
        if *participant == self.local {
            return Err(CallError::SelfSession(participant.clone()));
        }
        let serial = &mut self.next_serial;
        Ok(self
            .sessions
            .entry(participant.clone())
            .or_insert_with(|| {
                *serial += 1;
                debug!("Created session {} for {}", serial, participant);
                PeerSession::new(participant.clone(), *serial)
            }))
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(participant)
    }

    pub fn get_mut(&mut self, participant: &ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(participant)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.sessions.contains_key(participant)
    }

    /// Close and drop the session for `participant`, returning it.
    pub async fn remove(&mut self, participant: &ParticipantId) -> Option<PeerSession> {
        let mut session = self.sessions.remove(participant)?;
        session.close().await;
        Some(session)
    }

    pub fn all(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    /// Participants with a session, sorted
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session and clear the registry. Returns the closed sessions.
    pub async fn close_all(&mut self) -> Vec<PeerSession> {
        let mut closed: Vec<PeerSession> = self.sessions.drain().map(|(_, s)| s).collect();
        closed.sort_by(|a, b| a.participant.cmp(&b.participant));
        for session in &mut closed {
            session.close().await;
        }
        closed
    }
}
