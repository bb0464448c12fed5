//! Observable voice session state.
//!
//! [`VoiceSessionState`] is what the UI renders. It is only ever written by
//! the mesh coordinator and published as a whole through a `watch` channel,
//! so observers always see a consistent snapshot.

use crate::media::AudioStreamHandle;
use crate::peer::NegotiationState;
use chrono::{DateTime, Utc};
use nexus_common::{ChannelId, UserId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the local voice session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VoiceSessionState {
    pub channel_id: Option<ChannelId>,
    pub connection_status: ConnectionStatus,
    pub self_muted: bool,
    pub self_deafened: bool,
    pub self_speaking: bool,
    #[serde(skip)]
    pub local_stream: Option<AudioStreamHandle>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Remote participants with a live link, in the order they were first seen.
    pub participants: Vec<ParticipantView>,
}

impl VoiceSessionState {
    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }

    pub fn participant(&self, user_id: UserId) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub(crate) fn participant_mut(&mut self, user_id: UserId) -> Option<&mut ParticipantView> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub(crate) fn remove_participant(&mut self, user_id: UserId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.user_id != user_id);
        self.participants.len() != before
    }

    /// Users currently speaking, the local user included.
    pub fn speaking(&self, local_id: UserId) -> Vec<UserId> {
        let local = self.self_speaking.then_some(local_id);
        local
            .into_iter()
            .chain(
                self.participants
                    .iter()
                    .filter(|p| p.is_speaking)
                    .map(|p| p.user_id),
            )
            .collect()
    }
}

/// One remote participant as seen by the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantView {
    pub user_id: UserId,
    pub display_name: String,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_speaking: bool,
    pub link_state: NegotiationState,
    #[serde(skip)]
    pub remote_stream: Option<AudioStreamHandle>,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantView {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            is_muted: false,
            is_deafened: false,
            is_speaking: false,
            link_state: NegotiationState::Idle,
            remote_stream: None,
            joined_at: Utc::now(),
        }
    }
}
