//! In-memory transport engine and media source
//!
//! Produces synthetic SDP and host candidates so the signaling core can run
//! without a network stack. Used by the simulator and the test-suite.

use crate::error::{CallError, TransportError};
use crate::protocol::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use crate::transport::{EventSink, LocalMedia, MediaSource, TransportEngine, TransportSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Host candidates gathered per local description
const CANDIDATES_PER_DESCRIPTION: u16 = 2;

#[derive(Default)]
struct EngineState {
    created: usize,
    open: usize,
    probes: usize,
    applied: HashMap<ParticipantId, Vec<IceCandidate>>,
    failing: HashSet<ParticipantId>,
    rejecting_media: HashSet<ParticipantId>,
    /// Sink of the latest open session per participant
    sinks: HashMap<ParticipantId, EventSink>,
}

/// Transport engine bound to one fake host address
#[derive(Clone)]
pub struct LoopbackEngine {
    address: String,
    gather: bool,
    state: Arc<Mutex<EngineState>>,
}

impl LoopbackEngine {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            gather: true,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    /// Engine that never discovers candidates
    pub fn without_candidates(address: impl Into<String>) -> Self {
        Self {
            gather: false,
            ..Self::new(address)
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Make offer/answer generation fail for sessions towards `participant`.
    pub fn fail_sessions_for(&self, participant: &ParticipantId) {
        self.state.lock().failing.insert(participant.clone());
    }

    /// Make `attach_media` fail for sessions towards `participant`.
    pub fn reject_media_for(&self, participant: &ParticipantId) {
        self.state.lock().rejecting_media.insert(participant.clone());
    }

    /// Report the open session towards `participant` as lost. Returns false
    /// when there is none.
    pub fn drop_connection(&self, participant: &ParticipantId) -> bool {
        match self.state.lock().sinks.get(participant) {
            Some(sink) => {
                sink.disconnected();
                true
            }
            None => false,
        }
    }

    /// Sessions (probes included) created and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().created
    }

    pub fn probes_created(&self) -> usize {
        self.state.lock().probes
    }

    /// Distinct remote candidates applied to sessions towards `participant`, in order
    pub fn applied_candidates(&self, participant: &ParticipantId) -> Vec<IceCandidate> {
        self.state
            .lock()
            .applied
            .get(participant)
            .cloned()
            .unwrap_or_default()
    }

    fn open(&self, sink: EventSink, probe: bool) -> Box<dyn TransportSession> {
        let mut state = self.state.lock();
        state.created += 1;
        state.open += 1;
        if probe {
            state.probes += 1;
        }
        let failing = !probe && state.failing.contains(sink.participant());
        let rejecting_media = !probe && state.rejecting_media.contains(sink.participant());
        if !probe {
            state.sinks.insert(sink.participant().clone(), sink.clone());
        }
        Box::new(LoopbackSession {
            address: self.address.clone(),
            gather: self.gather,
            probe,
            failing,
            rejecting_media,
            sink,
            engine: self.state.clone(),
            media: None,
            local: None,
            remote: None,
            known: HashSet::new(),
            gathered: 0,
            closed: false,
        })
    }
}

#[async_trait]
impl TransportEngine for LoopbackEngine {
    async fn create_session(&self, sink: EventSink) -> Result<Box<dyn TransportSession>, TransportError> {
        Ok(self.open(sink, false))
    }

    async fn create_probe(&self, sink: EventSink) -> Result<Box<dyn TransportSession>, TransportError> {
        Ok(self.open(sink, true))
    }
}

struct LoopbackSession {
    address: String,
    gather: bool,
    probe: bool,
    failing: bool,
    rejecting_media: bool,
    sink: EventSink,
    engine: Arc<Mutex<EngineState>>,
    media: Option<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    known: HashSet<IceCandidate>,
    gathered: u16,
    closed: bool,
}

impl LoopbackSession {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_failing(&self) -> Result<(), TransportError> {
        if self.failing {
            Err(TransportError::Engine(format!(
                "injected failure towards {}",
                self.sink.participant()
            )))
        } else {
            Ok(())
        }
    }

    fn sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=- {} 1 IN IP4 {}\r\ns=meshcall-{}\r\nc=IN IP4 {}\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:{}\r\n",
            self.sink.session(),
            self.address,
            kind,
            self.address,
            self.media.as_deref().unwrap_or("-"),
        )
    }

    fn gather_candidates(&mut self) {
        if !self.gather {
            return;
        }
        for _ in 0..CANDIDATES_PER_DESCRIPTION {
            self.gathered += 1;
            let n = self.gathered;
            let port = 5000 + (self.sink.session() as u16 % 1000) * 10 + n;
            self.sink.ice_candidate(IceCandidate::new(format!(
                "candidate:{n} 1 udp {} {} {port} typ host",
                2130706432 - u32::from(n),
                self.address,
            )));
        }
    }

    fn maybe_connected(&self) {
        if !self.probe && self.local.is_some() && self.remote.is_some() {
            self.sink.connected();
        }
    }
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn attach_media(&mut self, media: &LocalMedia) -> Result<(), TransportError> {
        self.check_open()?;
        if self.rejecting_media {
            return Err(TransportError::Engine(format!("no audio codec for {}", media.id())));
        }
        self.media = Some(media.id().to_string());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        self.check_failing()?;
        if self.remote.is_some() {
            return Err(TransportError::Engine("offer requested in have-remote-offer".into()));
        }
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        self.check_failing()?;
        match &self.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(self.sdp("answer")))
            }
            _ => Err(TransportError::Engine("answer requested without remote offer".into())),
        }
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        let valid = match description.sdp_type {
            SdpType::Offer => self.remote.is_none(),
            SdpType::Answer => self.remote.is_some(),
            _ => false,
        };
        if !valid || self.local.is_some() {
            return Err(TransportError::Engine(format!(
                "unexpected local {:?}",
                description.sdp_type
            )));
        }
        self.local = Some(description);
        self.gather_candidates();
        self.maybe_connected();
        Ok(())
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        let valid = match description.sdp_type {
            SdpType::Offer => self.local.is_none(),
            SdpType::Answer => matches!(&self.local, Some(l) if l.sdp_type == SdpType::Offer),
            _ => false,
        };
        if !valid || self.remote.is_some() {
            return Err(TransportError::Engine(format!(
                "unexpected remote {:?}",
                description.sdp_type
            )));
        }
        self.remote = Some(description);
        if !self.probe {
            self.sink.track(format!("{}-audio", self.sink.participant()));
        }
        self.maybe_connected();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check_open()?;
        if self.remote.is_none() {
            return Err(TransportError::Engine("candidate before remote description".into()));
        }
        if self.known.insert(candidate.clone()) {
            self.engine
                .lock()
                .applied
                .entry(self.sink.participant().clone())
                .or_default()
                .push(candidate);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.engine.lock();
            state.open -= 1;
            let current = state
                .sinks
                .get(self.sink.participant())
                .is_some_and(|sink| sink.session() == self.sink.session());
            if current {
                state.sinks.remove(self.sink.participant());
            }
        }
        Ok(())
    }
}

/// Marker track handed out by [`LoopbackMedia`]
#[derive(Debug)]
pub struct LoopbackTrack {
    pub label: String,
}

#[derive(Default)]
struct MediaState {
    acquired: usize,
    released: usize,
    failing: bool,
}

/// Media source that captures nothing
#[derive(Clone, Default)]
pub struct LoopbackMedia {
    state: Arc<Mutex<MediaState>>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `acquire` fail
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn acquired(&self) -> usize {
        self.state.lock().acquired
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    /// Captures currently held
    pub fn held(&self) -> usize {
        let state = self.state.lock();
        state.acquired - state.released
    }
}

#[async_trait]
impl MediaSource for LoopbackMedia {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(CallError::MediaAcquisitionFailed("microphone unavailable".into()));
        }
        state.acquired += 1;
        let label = format!("loopback-audio-{}", state.acquired);
        Ok(LocalMedia::new(
            label.clone(),
            Arc::new(LoopbackTrack { label }),
        ))
    }

    fn release(&self, _media: LocalMedia) {
        self.state.lock().released += 1;
    }
}
