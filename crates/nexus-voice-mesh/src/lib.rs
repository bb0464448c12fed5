//! # nexus-voice-mesh
//!
//! Client-side voice for Nexus voice channels, peer-to-peer.
//!
//! Architecture: full mesh
//! - Every participant holds one WebRTC link to every other participant
//! - Negotiation (offer/answer/ICE) goes through the Nexus signaling relay
//! - The lower user id offers, so two peers never both offer on a fresh link
//! - Mute/deafen is applied to local tracks and announced to every peer
//! - Speaking indicators come from a local energy detector, no server round trip
//!
//! Entry point is [`VoiceClient`]: it owns a session loop that drives the
//! [`MeshCoordinator`] and publishes [`VoiceSessionState`] snapshots.
//! Capture and the WebRTC stack are provided by the embedding app through
//! [`MediaDevices`] and [`TransportFactory`].

pub mod client;
pub mod error;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod relay;
pub mod signaling;
pub mod speech;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testkit;

pub use client::VoiceClient;
pub use error::{MediaError, RelayError, TransportError, VoiceError, VoiceResult};
pub use media::{AudioAnalyser, AudioStream, AudioStreamHandle, MediaDevices};
pub use mesh::MeshCoordinator;
pub use peer::{NegotiationState, PeerLink};
pub use relay::{MemoryRelay, SignalRelayClient, WsRelayClient};
pub use signaling::{MemberInfo, SignalKind, SignalingMessage};
pub use speech::{SpeechActivityDetector, SpeechMonitor};
pub use state::{ConnectionStatus, ParticipantView, VoiceSessionState};
pub use transport::{PeerConnection, PeerEventSink, TransportFactory};
