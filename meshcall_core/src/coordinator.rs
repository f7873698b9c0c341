//! Mesh coordinator
//!
//! Owns one call at a time and reacts to three input sources: local commands,
//! transport events and inbound signaling envelopes. Every input is processed
//! to completion before the next one is taken, so the registry and the
//! negotiation state never need locking.
//!
//! In a mesh every participant announces itself after `call_started`; whoever
//! hears an announce from a participant it has no session with sends the
//! offer. When two participants offer to each other at the same time the one
//! with the lower id keeps its offer and the other answers it.

use crate::channel::SignalingChannel;
use crate::config::{MeshConfig, Topology};
use crate::error::{CallError, ChannelError};
use crate::identity::IdentityResolver;
use crate::negotiation::{CandidateDisposition, NegotiationEngine, NegotiationState};
use crate::protocol::{CallAction, IceCandidate, ParticipantId, SessionDescription, SignalingEnvelope};
use crate::registry::{PeerSession, PeerSessionRegistry};
use crate::transport::{LocalMedia, MediaSource, TransportEngine, TransportEvent, TransportEventKind};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Request from the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    StartCall,
    EndCall,
    /// End any active call and stop [`MeshCoordinator::run`]
    Shutdown,
}

/// Cloneable handle for issuing [`LocalCommand`]s to a running coordinator
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<LocalCommand>,
}

impl CallHandle {
    /// Returns false once the coordinator is gone.
    pub fn send(&self, command: LocalCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn start_call(&self) -> bool {
        self.send(LocalCommand::StartCall)
    }

    pub fn end_call(&self) -> bool {
        self.send(LocalCommand::EndCall)
    }

    pub fn shutdown(&self) -> bool {
        self.send(LocalCommand::Shutdown)
    }
}

/// State that only exists while a call is active
struct ActiveCall {
    local_id: ParticipantId,
    media: LocalMedia,
    registry: PeerSessionRegistry,
    /// Own announces the relay may still echo back
    unechoed_announces: usize,
    /// Announces from another participant using our id
    identity_collisions: usize,
}

enum Input {
    Command(LocalCommand),
    Event(TransportEvent),
    Envelope(Result<SignalingEnvelope, ChannelError>),
}

/// Drives every peer session of the local participant
pub struct MeshCoordinator<C: SignalingChannel> {
    config: MeshConfig,
    channel: C,
    identity: IdentityResolver,
    negotiation: NegotiationEngine,
    media_source: Arc<dyn MediaSource>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands_tx: mpsc::UnboundedSender<LocalCommand>,
    commands_rx: mpsc::UnboundedReceiver<LocalCommand>,
    /// Last session serial of the previous call
    serial_base: u64,
    call: Option<ActiveCall>,
}

impl<C: SignalingChannel> MeshCoordinator<C> {
    pub fn new(
        config: MeshConfig,
        channel: C,
        engine: Arc<dyn TransportEngine>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let identity =
            IdentityResolver::new(engine.clone(), config.identity, config.identity_timeout());
        Self {
            identity,
            negotiation: NegotiationEngine::new(engine, events_tx),
            config,
            channel,
            media_source,
            events_rx,
            commands_tx,
            commands_rx,
            serial_base: 0,
            call: None,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn in_call(&self) -> bool {
        self.call.is_some()
    }

    pub fn local_id(&self) -> Option<&ParticipantId> {
        self.call.as_ref().map(|call| &call.local_id)
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.call.as_ref().map(|call| &call.media)
    }

    pub fn registry(&self) -> Option<&PeerSessionRegistry> {
        self.call.as_ref().map(|call| &call.registry)
    }

    pub fn session(&self, participant: &ParticipantId) -> Option<&PeerSession> {
        self.registry()?.get(participant)
    }

    /// Announces seen in this call from someone else resolving to our id
    pub fn identity_collisions(&self) -> usize {
        self.call.as_ref().map_or(0, |call| call.identity_collisions)
    }

    /// Remote participants with a connected session, sorted
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let Some(registry) = self.registry() else {
            return Vec::new();
        };
        let mut peers: Vec<ParticipantId> = registry
            .all()
            .filter(|session| session.state() == NegotiationState::Connected)
            .map(|session| session.participant().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Resolve the local identity, capture audio and announce the call.
    pub async fn start_call(&mut self) -> Result<ParticipantId, CallError> {
        if self.call.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let local_id = self.identity.resolve_local_id().await?;
        let media = self.media_source.acquire().await?;
        info!("Call started as {} with media {}", local_id, media.id());

        self.call = Some(ActiveCall {
            registry: PeerSessionRegistry::new(local_id.clone(), self.serial_base),
            local_id: local_id.clone(),
            media,
            unechoed_announces: 0,
            identity_collisions: 0,
        });

        if let Err(e) = self.announce_start(&local_id).await {
            self.abort_call().await;
            return Err(e);
        }
        Ok(local_id)
    }

    async fn announce_start(&mut self, local_id: &ParticipantId) -> Result<(), CallError> {
        self.send(SignalingEnvelope::action(CallAction::CallStarted, Some(local_id)))
            .await?;
        if self.config.topology == Topology::Mesh {
            self.send(SignalingEnvelope::announce(local_id.clone())).await?;
            if let Some(call) = self.call.as_mut() {
                call.unechoed_announces += 1;
            }
        }
        Ok(())
    }

    /// Close every session, release the audio and tell the others.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        let call = self.call.take().ok_or(CallError::NotInCall)?;
        let local_id = call.local_id.clone();
        let closed = self.teardown(call).await;
        info!("Call ended, {} sessions closed", closed);

        if self.config.announce_hangup {
            self.send(SignalingEnvelope::action(CallAction::CallEnded, Some(&local_id)))
                .await?;
        }
        Ok(())
    }

    /// Dispatch one inbound envelope
    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            debug!("Ignoring {} outside a call", envelope.kind());
            return Ok(());
        };
        if envelope.sender() == Some(&call.local_id) {
            if matches!(envelope, SignalingEnvelope::Announce { .. }) {
                if call.unechoed_announces > 0 {
                    call.unechoed_announces -= 1;
                } else {
                    call.identity_collisions += 1;
                    warn!(
                        "Another participant announced as {}; identities collide",
                        call.local_id
                    );
                    return Ok(());
                }
            }
            debug!("Ignoring echo of own {}", envelope.kind());
            return Ok(());
        }
        if let Some(target) = envelope.target() {
            if *target != call.local_id {
                debug!("Ignoring {} addressed to {}", envelope.kind(), target);
                return Ok(());
            }
        }

        match envelope {
            SignalingEnvelope::Announce { participant } => self.on_announce(participant).await,
            SignalingEnvelope::Offer {
                description, sender, ..
            } => self.on_offer(description, sender).await,
            SignalingEnvelope::Answer {
                description, sender, ..
            } => self.on_answer(description, sender).await,
            SignalingEnvelope::Candidate {
                candidate, sender, ..
            } => self.on_candidate(candidate, sender).await,
            SignalingEnvelope::Action { action, sender } => self.on_action(action, sender).await,
        }
    }

    /// Dispatch one transport callback
    pub async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            debug!("Dropping transport event outside a call");
            return Ok(());
        };
        let local_id = call.local_id.clone();
        let Some(session) = call
            .registry
            .get_mut(&event.participant)
            .filter(|session| session.serial() == event.session)
        else {
            debug!(
                "Dropping event from replaced session {} of {}",
                event.session, event.participant
            );
            return Ok(());
        };

        match event.kind {
            TransportEventKind::IceCandidate(candidate) => {
                let target = self.target_for(&event.participant);
                self.send(SignalingEnvelope::candidate(candidate, &local_id, target.as_ref()))
                    .await
            }
            TransportEventKind::Track { track_id } => {
                info!("Receiving track {} from {}", track_id, event.participant);
                session.remote_tracks.push(track_id);
                Ok(())
            }
            TransportEventKind::Connected => {
                if self.negotiation.mark_connected(session) {
                    info!("Connected to {}", event.participant);
                }
                Ok(())
            }
            TransportEventKind::Disconnected => {
                warn!("Transport to {} went down", event.participant);
                call.registry.remove(&event.participant).await;
                Ok(())
            }
        }
    }

    /// Process inputs until shut down. Fails with `ChannelClosed` when the
    /// signaling channel drops.
    pub async fn run(&mut self) -> Result<(), CallError> {
        loop {
            let input = self.next_input().await;
            if !self.react(input).await? {
                return Ok(());
            }
        }
    }

    /// Process every input that is ready without waiting. Returns how many
    /// were handled.
    pub async fn drain_ready(&mut self) -> Result<usize, CallError> {
        let mut handled = 0;
        while let Some(input) = tokio::task::unconstrained(self.next_input()).now_or_never() {
            handled += 1;
            if !self.react(input).await? {
                break;
            }
        }
        Ok(handled)
    }

    async fn next_input(&mut self) -> Input {
        tokio::select! {
            biased;
            Some(command) = self.commands_rx.recv() => Input::Command(command),
            Some(event) = self.events_rx.recv() => Input::Event(event),
            result = self.channel.recv() => Input::Envelope(result),
        }
    }

    /// Handle one input. Returns whether to keep running.
    async fn react(&mut self, input: Input) -> Result<bool, CallError> {
        let result = match input {
            Input::Command(LocalCommand::StartCall) => self.start_call().await.map(|_| ()),
            Input::Command(LocalCommand::EndCall) => self.end_call().await,
            Input::Command(LocalCommand::Shutdown) => {
                if self.call.is_some() {
                    settle(self.end_call().await)?;
                }
                info!("Coordinator shut down");
                return Ok(false);
            }
            Input::Event(event) => self.handle_transport_event(event).await,
            Input::Envelope(Ok(envelope)) => self.handle_envelope(envelope).await,
            Input::Envelope(Err(ChannelError::Close)) => {
                warn!("Signaling channel closed");
                self.abort_call().await;
                Err(CallError::ChannelClosed)
            }
            Input::Envelope(Err(e)) => {
                debug!("Ignoring unreadable signaling message: {}", e);
                Ok(())
            }
        };
        settle(result)?;
        Ok(true)
    }

    async fn on_announce(&mut self, participant: ParticipantId) -> Result<(), CallError> {
        if self.config.topology == Topology::Pairwise {
            debug!("Ignoring announce from {} in a pairwise call", participant);
            return Ok(());
        }
        if self.registry().is_some_and(|r| r.contains(&participant)) {
            debug!("Already have a session with {}", participant);
            return Ok(());
        }
        self.connect_to(participant).await
    }

    async fn on_offer(
        &mut self,
        description: SessionDescription,
        sender: Option<ParticipantId>,
    ) -> Result<(), CallError> {
        let Some(remote) = self.route(sender.as_ref(), "offer") else {
            return Ok(());
        };
        let call = self.call.as_mut().ok_or(CallError::NotInCall)?;

        let mut carried = Vec::new();
        if let Some(existing) = call.registry.get_mut(&remote) {
            if existing.state() == NegotiationState::OfferSent {
                let keep_ours = match sender.as_ref() {
                    Some(sender) => call.local_id < *sender,
                    None => {
                        warn!("Offer collision with {} without a sender id", remote);
                        // Both sides see the same two offers
                        existing
                            .local_description()
                            .is_some_and(|ours| ours.sdp < description.sdp)
                    }
                };
                if keep_ours {
                    debug!("Offer collision with {}: keeping own offer", remote);
                    return Ok(());
                }
                info!("Offer collision with {}: answering theirs", remote);
                carried.extend(existing.pending_candidates.drain(..));
                call.registry.remove(&remote).await;
            }
        }

        let session = call.registry.get_or_create(&remote)?;
        session.pending_candidates.extend(carried);
        let local_id = call.local_id.clone();
        match self
            .negotiation
            .accept_offer(session, description, &call.media)
            .await
        {
            Ok(answer) => {
                let target = self.target_for(&remote);
                self.send(SignalingEnvelope::answer(answer, &local_id, target.as_ref()))
                    .await
            }
            Err(e) => self.isolate(&remote, e).await,
        }
    }

    async fn on_answer(
        &mut self,
        description: SessionDescription,
        sender: Option<ParticipantId>,
    ) -> Result<(), CallError> {
        let Some(remote) = self.route(sender.as_ref(), "answer") else {
            return Ok(());
        };
        let call = self.call.as_mut().ok_or(CallError::NotInCall)?;
        let Some(session) = call.registry.get_mut(&remote) else {
            return Err(CallError::StaleSignalingMessage {
                participant: remote,
                kind: "answer",
            });
        };

        match self.negotiation.accept_answer(session, description).await {
            Ok(()) => {
                info!("Connected to {}", remote);
                Ok(())
            }
            Err(e) => self.isolate(&remote, e).await,
        }
    }

    async fn on_candidate(
        &mut self,
        candidate: IceCandidate,
        sender: Option<ParticipantId>,
    ) -> Result<(), CallError> {
        let Some(remote) = self.route(sender.as_ref(), "candidate") else {
            return Ok(());
        };
        let call = self.call.as_mut().ok_or(CallError::NotInCall)?;
        let Some(session) = call.registry.get_mut(&remote) else {
            return Err(CallError::StaleSignalingMessage {
                participant: remote,
                kind: "candidate",
            });
        };

        match self.negotiation.add_candidate(session, candidate).await {
            Ok(CandidateDisposition::Applied) => {
                debug!("Applied candidate from {}", remote);
                Ok(())
            }
            Ok(CandidateDisposition::Buffered) => {
                debug!("Buffered candidate from {}", remote);
                Ok(())
            }
            // A single bad candidate does not doom the session
            Err(CallError::Transport { source, .. }) => {
                warn!("Rejected candidate from {}: {}", remote, source);
                Ok(())
            }
            Err(e) => self.isolate(&remote, e).await,
        }
    }

    async fn on_action(
        &mut self,
        action: CallAction,
        sender: Option<ParticipantId>,
    ) -> Result<(), CallError> {
        match (action, self.config.topology) {
            (CallAction::CallStarted, Topology::Pairwise) => {
                let remote = ParticipantId::implicit_remote();
                self.forget_restarted(&remote).await;
                self.connect_to(remote).await
            }
            (CallAction::CallStarted, Topology::Mesh) => {
                // The announce that follows opens the new session
                if let Some(sender) = &sender {
                    self.forget_restarted(sender).await;
                }
                debug!("Waiting for announce after call start of {:?}", sender);
                Ok(())
            }
            (CallAction::CallEnded, _) => {
                let Some(remote) = self.route(sender.as_ref(), "call_ended") else {
                    return Ok(());
                };
                let call = self.call.as_mut().ok_or(CallError::NotInCall)?;
                if call.registry.remove(&remote).await.is_some() {
                    info!("{} left the call", remote);
                }
                Ok(())
            }
        }
    }

    /// A participant only sends `call_started` when its call begins, so a
    /// session we still hold with it belongs to its previous call.
    async fn forget_restarted(&mut self, remote: &ParticipantId) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.registry.remove(remote).await.is_some() {
            info!("{} started a new call, dropping the old session", remote);
        }
    }

    /// Create a session towards `remote` and send it an offer
    async fn connect_to(&mut self, remote: ParticipantId) -> Result<(), CallError> {
        let call = self.call.as_mut().ok_or(CallError::NotInCall)?;
        let session = call.registry.get_or_create(&remote)?;
        if session.state() != NegotiationState::Idle {
            debug!("Session with {} already {}", remote, session.state());
            return Ok(());
        }

        let local_id = call.local_id.clone();
        match self.negotiation.initiate(session, &call.media).await {
            Ok(offer) => {
                info!("Offering to {}", remote);
                let target = self.target_for(&remote);
                self.send(SignalingEnvelope::offer(offer, &local_id, target.as_ref()))
                    .await
            }
            Err(e) => self.isolate(&remote, e).await,
        }
    }

    /// Drop the session with `remote` after a negotiation failure
    async fn isolate(&mut self, remote: &ParticipantId, err: CallError) -> Result<(), CallError> {
        warn!("Closing session with {}: {}", remote, err);
        if let Some(call) = self.call.as_mut() {
            call.registry.remove(remote).await;
        }
        Err(err)
    }

    /// Registry key for an inbound message, `None` when it cannot be routed
    fn route(&self, sender: Option<&ParticipantId>, kind: &str) -> Option<ParticipantId> {
        match (self.config.topology, sender) {
            (Topology::Pairwise, _) => Some(ParticipantId::implicit_remote()),
            (Topology::Mesh, Some(sender)) => Some(sender.clone()),
            (Topology::Mesh, None) => {
                warn!("Dropping {} without a sender", kind);
                None
            }
        }
    }

    /// Addressee of outgoing peer messages; pairwise peers are unaddressed
    fn target_for(&self, remote: &ParticipantId) -> Option<ParticipantId> {
        match self.config.topology {
            Topology::Pairwise => None,
            Topology::Mesh => Some(remote.clone()),
        }
    }

    async fn send(&mut self, envelope: SignalingEnvelope) -> Result<(), CallError> {
        debug!("Sending {}", envelope.kind());
        match self.channel.send(&envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = CallError::from(e);
                if matches!(err, CallError::ChannelClosed) {
                    self.abort_call().await;
                }
                Err(err)
            }
        }
    }

    /// Tear down the active call without telling anyone
    async fn abort_call(&mut self) {
        if let Some(call) = self.call.take() {
            let closed = self.teardown(call).await;
            warn!("Call aborted, {} sessions closed", closed);
        }
    }

    async fn teardown(&mut self, call: ActiveCall) -> usize {
        let ActiveCall {
            media, mut registry, ..
        } = call;
        let closed = registry.close_all().await.len();
        self.serial_base = registry.next_serial();
        self.media_source.release(media);
        while self.events_rx.try_recv().is_ok() {}
        closed
    }
}

/// Keep only errors that end the coordinator
fn settle(result: Result<(), CallError>) -> Result<(), CallError> {
    match result {
        Err(CallError::ChannelClosed) => Err(CallError::ChannelClosed),
        Err(CallError::StaleSignalingMessage { participant, kind }) => {
            warn!("Ignoring stale {} from {}", kind, participant);
            Ok(())
        }
        Err(e) => {
            warn!("{}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
