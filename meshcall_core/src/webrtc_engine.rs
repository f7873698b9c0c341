//! Transport engine backed by webrtc-rs
//!
//! Enabled with the `webrtc-engine` feature. Every peer session is one
//! `RTCPeerConnection` sharing the Opus track produced by [`WebRtcMicrophone`].

use crate::config::MeshConfig;
use crate::error::{CallError, TransportError};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{EventSink, LocalMedia, MediaSource, TransportEngine, TransportSession};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

fn engine_error(err: webrtc::Error) -> TransportError {
    TransportError::Engine(err.to_string())
}

/// Peer connection factory
pub struct WebRtcEngine {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[String]) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Ok(Self { api, config })
    }

    pub fn from_config(config: &MeshConfig) -> Result<Self, TransportError> {
        Self::new(&config.ice_servers)
    }

    async fn peer_connection(&self, sink: &EventSink) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(engine_error)?,
        );

        let ice_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = ice_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.ice_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                debug!("Peer connection to {} is {}", sink.participant(), state);
                match state {
                    RTCPeerConnectionState::Connected => sink.connected(),
                    RTCPeerConnectionState::Failed => sink.disconnected(),
                    _ => {}
                }
            })
        }));

        Ok(pc)
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn create_session(&self, sink: EventSink) -> Result<Box<dyn TransportSession>, TransportError> {
        let pc = self.peer_connection(&sink).await?;

        let track_sink = sink.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = track_sink.clone();
            Box::pin(async move {
                sink.track(track.id());
            })
        }));

        Ok(Box::new(WebRtcSession { pc }))
    }

    async fn create_probe(&self, sink: EventSink) -> Result<Box<dyn TransportSession>, TransportError> {
        let pc = self.peer_connection(&sink).await?;
        // Gathering needs at least one m-line
        pc.create_data_channel("probe", None)
            .await
            .map_err(engine_error)?;
        Ok(Box::new(WebRtcSession { pc }))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(TransportError::Engine("rollback is not supported".into()));
        }
    };
    converted.map_err(engine_error)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(TransportError::Engine(format!("unexpected description type {other}")));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

#[async_trait]
impl TransportSession for WebRtcSession {
    async fn attach_media(&mut self, media: &LocalMedia) -> Result<(), TransportError> {
        let track = media
            .track::<TrackLocalStaticSample>()
            .ok_or_else(|| TransportError::Engine(format!("media {} has no webrtc track", media.id())))?;
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        from_rtc(offer)
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        from_rtc(answer)
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(engine_error)
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(engine_error)
    }
}

/// Opus track shared by every peer connection of a call. The application
/// writes captured samples through `LocalMedia::track::<TrackLocalStaticSample>()`.
#[derive(Debug, Default)]
pub struct WebRtcMicrophone {
    captures: AtomicU64,
}

impl WebRtcMicrophone {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaSource for WebRtcMicrophone {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        let n = self.captures.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("meshcall-audio-{n}");
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "meshcall".to_owned(),
        ));
        Ok(LocalMedia::new(id, track))
    }

    fn release(&self, media: LocalMedia) {
        debug!("Released local audio {}", media.id());
    }
}
