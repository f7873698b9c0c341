//! Offer/answer/candidate state machine for one peer session
//!
//! ```text
//! Idle --local initiate--> OfferSent --inbound answer--> Connected
//! Idle --inbound offer--> OfferReceived --answer generated--> Answered --transport up--> Connected
//! any non-terminal --terminate--> Closed
//! ```

use crate::error::{CallError, TransportError};
use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};
use crate::registry::PeerSession;
use crate::transport::{EventSink, LocalMedia, TransportEngine, TransportEvent, TransportSession};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Negotiation progress of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::OfferSent => write!(f, "offer-sent"),
            NegotiationState::OfferReceived => write!(f, "offer-received"),
            NegotiationState::Answered => write!(f, "answered"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Event driving a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    LocalInitiate,
    InboundOffer,
    InboundAnswer,
    InboundCandidate,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::LocalInitiate => write!(f, "local initiate"),
            Trigger::InboundOffer => write!(f, "inbound offer"),
            Trigger::InboundAnswer => write!(f, "inbound answer"),
            Trigger::InboundCandidate => write!(f, "inbound candidate"),
        }
    }
}

/// What happened to an inbound candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
}

/// Drives peer sessions through the transport engine
pub struct NegotiationEngine {
    engine: Arc<dyn TransportEngine>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl NegotiationEngine {
    /// `events` receives the callbacks of every transport this engine opens.
    pub fn new(engine: Arc<dyn TransportEngine>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { engine, events }
    }

    /// Idle -> OfferSent. Returns the offer to send.
    pub async fn initiate(
        &self,
        session: &mut PeerSession,
        media: &LocalMedia,
    ) -> Result<SessionDescription, CallError> {
        require_state(session, Trigger::LocalInitiate, NegotiationState::Idle)?;
        self.open_transport(session, media).await?;

        let participant = session.participant.clone();
        let transport = transport_mut(session)?;
        let offer = transport
            .create_offer()
            .await
            .map_err(|e| transport_error(&participant, e))?;
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| transport_error(&participant, e))?;

        session.local_description = Some(offer.clone());
        session.state = NegotiationState::OfferSent;
        debug!("Offer created for {}", participant);
        Ok(offer)
    }

    /// Idle -> OfferReceived -> Answered. Returns the answer to send.
    pub async fn accept_offer(
        &self,
        session: &mut PeerSession,
        offer: SessionDescription,
        media: &LocalMedia,
    ) -> Result<SessionDescription, CallError> {
        require_state(session, Trigger::InboundOffer, NegotiationState::Idle)?;
        self.open_transport(session, media).await?;

        let participant = session.participant.clone();
        transport_mut(session)?
            .set_remote_description(offer)
            .await
            .map_err(|e| transport_error(&participant, e))?;
        session.remote_description_set = true;
        session.state = NegotiationState::OfferReceived;
        flush_candidates(session).await?;

        let transport = transport_mut(session)?;
        let answer = transport
            .create_answer()
            .await
            .map_err(|e| transport_error(&participant, e))?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| transport_error(&participant, e))?;

        session.local_description = Some(answer.clone());
        session.state = NegotiationState::Answered;
        debug!("Answer created for {}", participant);
        Ok(answer)
    }

    /// OfferSent -> Connected
    pub async fn accept_answer(
        &self,
        session: &mut PeerSession,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        require_state(session, Trigger::InboundAnswer, NegotiationState::OfferSent)?;

        let participant = session.participant.clone();
        transport_mut(session)?
            .set_remote_description(answer)
            .await
            .map_err(|e| transport_error(&participant, e))?;
        session.remote_description_set = true;
        flush_candidates(session).await?;

        session.state = NegotiationState::Connected;
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description is set.
    pub async fn add_candidate(
        &self,
        session: &mut PeerSession,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, CallError> {
        if session.state == NegotiationState::Closed {
            return Err(CallError::InvalidNegotiationTransition {
                participant: session.participant.clone(),
                state: session.state,
                trigger: Trigger::InboundCandidate,
            });
        }
        if !session.remote_description_set {
            session.pending_candidates.push_back(candidate);
            return Ok(CandidateDisposition::Buffered);
        }

        let participant = session.participant.clone();
        transport_mut(session)?
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| transport_error(&participant, e))?;
        Ok(CandidateDisposition::Applied)
    }

    /// Answered -> Connected once the transport reports connectivity.
    /// Returns whether the state changed.
    pub fn mark_connected(&self, session: &mut PeerSession) -> bool {
        if session.state == NegotiationState::Answered {
            session.state = NegotiationState::Connected;
            true
        } else {
            false
        }
    }

    /// Any state -> Closed
    pub async fn terminate(&self, session: &mut PeerSession) {
        session.close().await;
    }

    async fn open_transport(&self, session: &mut PeerSession, media: &LocalMedia) -> Result<(), CallError> {
        let sink = EventSink::new(session.participant.clone(), session.serial, self.events.clone());
        let mut transport = self
            .engine
            .create_session(sink)
            .await
            .map_err(|e| transport_error(&session.participant, e))?;

        if let Err(e) = transport.attach_media(media).await {
            if let Err(close_err) = transport.close().await {
                warn!("Failed to release transport for {}: {}", session.participant, close_err);
            }
            return Err(transport_error(&session.participant, e));
        }

        session.transport = Some(transport);
        Ok(())
    }
}

fn require_state(session: &PeerSession, trigger: Trigger, allowed: NegotiationState) -> Result<(), CallError> {
    if session.state == allowed {
        Ok(())
    } else {
        Err(CallError::InvalidNegotiationTransition {
            participant: session.participant.clone(),
            state: session.state,
            trigger,
        })
    }
}

fn transport_mut(session: &mut PeerSession) -> Result<&mut Box<dyn TransportSession>, CallError> {
    let participant = session.participant.clone();
    session
        .transport
        .as_mut()
        .ok_or_else(|| transport_error(&participant, TransportError::Closed))
}

fn transport_error(participant: &ParticipantId, source: TransportError) -> CallError {
    CallError::Transport {
        participant: participant.clone(),
        source,
    }
}

/// Apply buffered candidates in arrival order. A rejected candidate is
/// skipped; it never fails the session.
async fn flush_candidates(session: &mut PeerSession) -> Result<(), CallError> {
    let participant = session.participant.clone();
    let pending: Vec<IceCandidate> = session.pending_candidates.drain(..).collect();
    if pending.is_empty() {
        return Ok(());
    }
    debug!("Applying {} buffered candidates for {}", pending.len(), participant);

    let transport = transport_mut(session)?;
    for candidate in pending {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Skipping buffered candidate for {}: {}", participant, e);
        }
    }
    Ok(())
}
