//! Voice signaling records exchanged through the relay.
//!
//! The relay only carries negotiation metadata:
//! - SDP offers and answers
//! - ICE candidates
//! - mute/deafen announcements
//! - channel membership snapshots (relay → client)
//!
//! Audio never travels over this channel. Offer/answer/candidate payloads are
//! opaque strings owned by the transport backend.

use nexus_common::{ChannelId, UserId};
use serde::{Deserialize, Serialize};

/// What a signaling message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    /// JSON-encoded [`PeerMediaState`].
    State,
}

/// A peer-to-peer signaling record, routed by the relay to `to_peer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub from_peer: UserId,
    pub to_peer: UserId,
    pub channel_id: ChannelId,
    pub payload: String,
}

impl SignalingMessage {
    pub fn new(
        kind: SignalKind,
        channel_id: ChannelId,
        from_peer: UserId,
        to_peer: UserId,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            from_peer,
            to_peer,
            channel_id,
            payload: payload.into(),
        }
    }
}

/// An ICE candidate as produced by the transport backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate(pub String);

impl IceCandidate {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Self mute/deafen state announced to every linked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMediaState {
    pub muted: bool,
    pub deafened: bool,
}

impl PeerMediaState {
    /// Payload of a `State` signaling message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// A member of a voice channel as reported by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub display_name: String,
}

impl MemberInfo {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// Events delivered by a relay subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Signal(SignalingMessage),
    /// Full membership of the channel, the local user included.
    Members {
        channel_id: ChannelId,
        members: Vec<MemberInfo>,
    },
}

/// Frames on the relay WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum RelayFrame {
    // === Client → Relay ===
    /// Join the channel's signaling group.
    Subscribe {
        channel_id: ChannelId,
        user_id: UserId,
        display_name: String,
    },

    /// Leave the channel's signaling group.
    Unsubscribe { channel_id: ChannelId },

    // === Bidirectional ===
    Signal(SignalingMessage),

    // === Relay → Client ===
    Members {
        channel_id: ChannelId,
        members: Vec<MemberInfo>,
    },

    Error { code: u32, message: String },
}

impl RelayFrame {
    /// Inbound frames that carry a session event.
    pub fn into_event(self) -> Option<RelayEvent> {
        match self {
            Self::Signal(msg) => Some(RelayEvent::Signal(msg)),
            Self::Members {
                channel_id,
                members,
            } => Some(RelayEvent::Members {
                channel_id,
                members,
            }),
            Self::Subscribe { .. } | Self::Unsubscribe { .. } | Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn signal_frame_wire_shape() {
        let channel = ChannelId(Uuid::nil());
        let from = UserId(Uuid::from_u128(1));
        let to = UserId(Uuid::from_u128(2));
        let frame = RelayFrame::Signal(SignalingMessage::new(
            SignalKind::Candidate,
            channel,
            from,
            to,
            "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
        ));

        let json = serde_json::to_value(&frame).expect("should serialize");
        assert_eq!(json["op"], "Signal");
        assert_eq!(json["d"]["kind"], "candidate");
        assert_eq!(json["d"]["to_peer"], to.to_string());
        assert_eq!(json["d"]["channel_id"], channel.to_string());
    }

    #[test]
    fn members_frame_becomes_event() {
        let channel = ChannelId::new();
        let member = MemberInfo::new(UserId::new(), "alice");
        let text = serde_json::json!({
            "op": "Members",
            "d": { "channel_id": channel, "members": [member.clone()] }
        })
        .to_string();

        let frame: RelayFrame = serde_json::from_str(&text).expect("should parse");
        assert_eq!(
            frame.into_event(),
            Some(RelayEvent::Members {
                channel_id: channel,
                members: vec![member],
            })
        );
    }

    #[test]
    fn error_frame_is_not_an_event() {
        let frame = RelayFrame::Error {
            code: 4003,
            message: "Not subscribed".into(),
        };
        assert!(frame.into_event().is_none());
    }
}
