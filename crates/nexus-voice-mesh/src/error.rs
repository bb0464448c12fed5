//! Error types for the voice mesh.
//!
//! `VoiceError` is what callers of the session API see. The backend errors
//! (`MediaError`, `RelayError`, `TransportError`) come out of the trait seams
//! and are folded into `VoiceError` by the coordinator.

use nexus_common::UserId;

/// Session-level errors.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Local capture could not be acquired. Fatal to `join`, retryable.
    #[error("Microphone unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    /// The signaling subscription could not be established. Fatal to `join`, retryable.
    #[error("Signaling relay unreachable: {0}")]
    RelayUnreachable(#[from] RelayError),

    /// A single peer link could not negotiate or lost its connection.
    #[error("Negotiation with {peer} failed: {reason}")]
    PeerNegotiationFailed { peer: UserId, reason: String },

    /// Malformed or out-of-sequence signaling message; dropped.
    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    /// `leave` was called while `join` was still waiting.
    #[error("Join cancelled")]
    Cancelled,

    /// The session loop has shut down.
    #[error("Voice session closed")]
    SessionClosed,
}

impl VoiceError {
    /// Whether this error ends the join attempt (as opposed to a per-peer soft error).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MediaUnavailable(_) | Self::RelayUnreachable(_) | Self::SessionClosed
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSignalingMessage(message.into())
    }
}

/// Errors from the capture backend.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("no capture device found")]
    NoDevice,

    #[error("{0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors from the signaling relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out connecting to relay")]
    Timeout,

    /// No subscription is open, or it was closed.
    #[error("Relay is not connected")]
    NotConnected,

    #[error("Peer {0} is not reachable through the relay")]
    UnknownPeer(UserId),
}

/// Errors from a peer connection backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("Connection closed")]
    Closed,

    #[error("{0}")]
    Backend(#[from] anyhow::Error),
}

/// Convenience type alias for Results using VoiceError.
pub type VoiceResult<T> = Result<T, VoiceError>;
