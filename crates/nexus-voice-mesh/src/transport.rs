//! Peer connection seam.
//!
//! The real-time transport (ICE, DTLS, SRTP, codecs) belongs to whatever
//! WebRTC stack the embedding application ships. The mesh only needs the
//! negotiation surface below, plus a way for the backend to report
//! asynchronous events (gathered candidates, arriving tracks, connection
//! state) back into the coordinator's queue.

use crate::error::TransportError;
use crate::media::{AudioStream, AudioStreamHandle};
use crate::mesh::MeshEvent;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use nexus_common::config::IceServerConfig;
use nexus_common::UserId;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one PeerLink instance. A replaced or closed link never reuses it.
pub type LinkId = Uuid;

/// Which side of the exchange a remote description came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the link cannot carry audio any more.
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// One peer connection, exclusively owned by its PeerLink.
#[async_trait]
pub trait PeerConnection: Send {
    /// Attach an outbound track.
    fn add_track(&mut self, track: AudioStreamHandle) -> Result<(), TransportError>;

    /// Generate an offer and apply it as the local description.
    async fn create_offer(&mut self) -> Result<String, TransportError>;

    /// Generate an answer to the applied remote offer and apply it locally.
    async fn create_answer(&mut self) -> Result<String, TransportError>;

    async fn set_remote_description(&mut self, kind: SdpKind, sdp: &str)
        -> Result<(), TransportError>;

    /// Discard a local offer that has not been answered.
    async fn rollback(&mut self) -> Result<(), TransportError>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Stop all tracks and release the connection. Must be idempotent.
    fn close(&mut self);
}

/// Creates peer connections for new links.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        peer: UserId,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError>;
}

/// Asynchronous transport events, tagged with the link they belong to.
#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: UserId,
    pub link_id: LinkId,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    /// A local candidate was gathered and must be sent to the peer.
    LocalCandidate(IceCandidate),
    /// The remote audio track arrived. Ownership moves to the PeerLink.
    RemoteTrack(AudioStream),
    ConnectionState(ConnectionState),
}

/// Event sender handed to a transport backend for one link.
///
/// Sending never blocks, so it is safe to call from backend callbacks.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: UserId,
    link_id: LinkId,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(peer_id: UserId, link_id: LinkId, tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            peer_id,
            link_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn local_candidate(&self, candidate: IceCandidate) -> bool {
        self.send(PeerEventKind::LocalCandidate(candidate))
    }

    pub fn remote_track(&self, stream: AudioStream) -> bool {
        self.send(PeerEventKind::RemoteTrack(stream))
    }

    pub fn connection_state(&self, state: ConnectionState) -> bool {
        self.send(PeerEventKind::ConnectionState(state))
    }

    /// Returns `false` once the session loop has gone away.
    fn send(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(MeshEvent::Peer(PeerEvent {
                peer_id: self.peer_id,
                link_id: self.link_id,
                kind,
            }))
            .is_ok()
    }
}
