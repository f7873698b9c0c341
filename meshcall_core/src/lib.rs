//! Signaling and connection orchestration for peer-to-peer audio calls
//!
//! Participants find each other through a broadcast relay and build a full
//! mesh of transport sessions, one per remote participant. Media flows
//! directly between peers; the relay only carries signaling.
//!
//! # Protocol
//!
//! Every relay message is a JSON object tagged by its single populated field:
//!
//! - `{"action": "call_started", "senderId": "<id>"}` - presence accounting
//! - `{"announce": "<id>"}` - join the mesh
//! - `{"offer": {...}, "senderId": "<id>", "target": "<id>"}`
//! - `{"answer": {...}, "senderId": "<id>", "target": "<id>"}`
//! - `{"candidate": {...}, "senderId": "<id>", "target": "<id>"}`
//! - `{"action": "call_ended", "senderId": "<id>"}` - leave the mesh
//!
//! # Example
//!
//! ```no_run
//! use meshcall_core::{LoopbackEngine, LoopbackMedia, MeshConfig, MeshCoordinator, RelayHub};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), meshcall_core::CallError> {
//! let hub = RelayHub::new();
//! let mut coordinator = MeshCoordinator::new(
//!     MeshConfig::default(),
//!     hub.connect(),
//!     Arc::new(LoopbackEngine::new("10.0.0.1")),
//!     Arc::new(LoopbackMedia::new()),
//! );
//! let handle = coordinator.handle();
//! handle.start_call();
//! coordinator.run().await
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod loopback;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod transport;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

pub use channel::{SignalingChannel, WebSocketChannel};
pub use config::{MeshConfig, Topology};
pub use coordinator::{CallHandle, LocalCommand, MeshCoordinator};
pub use error::{CallError, ChannelError, TransportError};
pub use identity::{IdentityResolver, IdentitySource};
pub use loopback::{LoopbackEngine, LoopbackMedia};
pub use negotiation::{NegotiationEngine, NegotiationState};
pub use protocol::{CallAction, IceCandidate, ParticipantId, SessionDescription, SignalingEnvelope};
pub use registry::{PeerSession, PeerSessionRegistry};
pub use relay::{RelayConnection, RelayHub};
pub use transport::{LocalMedia, MediaSource, TransportEngine, TransportEvent, TransportSession};
#[cfg(feature = "webrtc-engine")]
pub use webrtc_engine::{WebRtcEngine, WebRtcMicrophone};
