//! Local participant identity

use crate::error::CallError;
use crate::protocol::ParticipantId;
use crate::transport::{EventSink, TransportEngine, TransportEvent, TransportEventKind, TransportSession};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Where the local participant id comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    /// Network address of the first candidate a throwaway probe discovers
    #[default]
    Probe,
    /// Random v4 UUID
    Random,
}

impl FromStr for IdentitySource {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "probe" => Ok(IdentitySource::Probe),
            "random" | "uuid" => Ok(IdentitySource::Random),
            other => Err(CallError::Config(format!("unknown identity source '{other}'"))),
        }
    }
}

/// Derives the id this peer is addressed by in signaling messages
pub struct IdentityResolver {
    engine: Arc<dyn TransportEngine>,
    source: IdentitySource,
    timeout: Duration,
}

impl IdentityResolver {
    pub fn new(engine: Arc<dyn TransportEngine>, source: IdentitySource, timeout: Duration) -> Self {
        Self {
            engine,
            source,
            timeout,
        }
    }

    pub async fn resolve_local_id(&self) -> Result<ParticipantId, CallError> {
        let id = match self.source {
            IdentitySource::Random => ParticipantId::random(),
            IdentitySource::Probe => self.probe().await?,
        };
        info!("Local participant id: {}", id);
        Ok(id)
    }

    async fn probe(&self) -> Result<ParticipantId, CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(ParticipantId::new("probe"), 0, tx);
        let mut probe = self
            .engine
            .create_probe(sink)
            .await
            .map_err(|e| CallError::IdentityUnavailable(e.to_string()))?;

        let discovered = tokio::time::timeout(self.timeout, discover(&mut probe, &mut rx)).await;

        // The probe never carries media
        if let Err(e) = probe.close().await {
            debug!("Failed to close identity probe: {}", e);
        }

        match discovered {
            Ok(result) => result,
            Err(_) => Err(CallError::IdentityUnavailable(format!(
                "no candidate discovered within {:?}",
                self.timeout
            ))),
        }
    }
}

async fn discover(
    probe: &mut Box<dyn TransportSession>,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Result<ParticipantId, CallError> {
    let offer = probe
        .create_offer()
        .await
        .map_err(|e| CallError::IdentityUnavailable(e.to_string()))?;
    probe
        .set_local_description(offer)
        .await
        .map_err(|e| CallError::IdentityUnavailable(e.to_string()))?;

    while let Some(event) = events.recv().await {
        if let TransportEventKind::IceCandidate(candidate) = event.kind {
            if let Some(address) = candidate.address() {
                return Ok(ParticipantId::new(address));
            }
        }
    }
    Err(CallError::IdentityUnavailable("probe stopped before discovering a candidate".into()))
}
