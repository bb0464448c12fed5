//! PeerLink: negotiation state machine for exactly one remote participant.
//!
//! ```text
//!   Idle ──offer──▶ OfferSent ──answer──▶ AnswerReceived ──▶ Stable
//!   Idle ──inbound offer──▶ OfferReceived ──▶ AnswerSent ──connected──▶ Stable
//!   any ──transport lost──▶ Failed          any ──close──▶ Closed
//! ```
//!
//! A link owns its connection, its buffered remote candidates and the remote
//! audio stream once it arrives. It never talks to the relay: every step
//! returns what has to be sent and the coordinator sends it.

use crate::error::TransportError;
use crate::media::{AudioStream, AudioStreamHandle};
use crate::signaling::IceCandidate;
use crate::transport::{ConnectionState, LinkId, PeerConnection, SdpKind};
use nexus_common::UserId;
use serde::Serialize;
use std::collections::VecDeque;

/// Negotiation state of a PeerLink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Stable,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Glare tie-break: the lower identity sends the offer.
pub fn should_offer(local_id: UserId, peer_id: UserId) -> bool {
    local_id < peer_id
}

/// Errors from a link step.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The message does not fit the current state. The link is unchanged.
    #[error("{0}")]
    OutOfSequence(String),

    /// The connection rejected a step. The link is now `Failed`.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result of applying an inbound offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Send this answer to the peer.
    Answer(String),
    /// Glare, and our own offer wins; the inbound offer was discarded.
    KeptLocalOffer,
    /// The link is already closed.
    Ignored,
}

/// Result of a transport connection-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Unchanged,
    BecameStable,
    Lost,
}

pub struct PeerLink {
    peer_id: UserId,
    local_id: UserId,
    link_id: LinkId,
    state: NegotiationState,
    connection: Box<dyn PeerConnection>,
    pending_candidates: VecDeque<IceCandidate>,
    has_remote_description: bool,
    remote_stream: Option<AudioStream>,
}

impl PeerLink {
    /// Wrap a fresh connection and attach the local outbound track.
    pub fn new(
        local_id: UserId,
        peer_id: UserId,
        link_id: LinkId,
        mut connection: Box<dyn PeerConnection>,
        local_track: AudioStreamHandle,
    ) -> Result<Self, TransportError> {
        if let Err(e) = connection.add_track(local_track) {
            connection.close();
            return Err(e);
        }
        Ok(Self {
            peer_id,
            local_id,
            link_id,
            state: NegotiationState::Idle,
            connection,
            pending_candidates: VecDeque::new(),
            has_remote_description: false,
            remote_stream: None,
        })
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_stream(&self) -> Option<AudioStreamHandle> {
        self.remote_stream.as_ref().map(AudioStream::handle)
    }

    /// `Idle → OfferSent`. Returns the offer to send.
    pub async fn start_offer(&mut self) -> Result<String, LinkError> {
        if self.state != NegotiationState::Idle {
            return Err(LinkError::OutOfSequence(format!(
                "cannot offer from {:?}",
                self.state
            )));
        }
        let offer = self.connection.create_offer().await;
        let offer = self.guard(offer)?;
        self.state = NegotiationState::OfferSent;
        tracing::debug!(peer = %self.peer_id, "Offer created");
        Ok(offer)
    }

    /// Apply an inbound offer, resolving glare by identity order.
    pub async fn handle_offer(&mut self, sdp: &str) -> Result<OfferOutcome, LinkError> {
        match self.state {
            NegotiationState::Closed | NegotiationState::Failed => return Ok(OfferOutcome::Ignored),
            NegotiationState::Idle => {}
            NegotiationState::OfferSent => {
                if should_offer(self.local_id, self.peer_id) {
                    tracing::debug!(peer = %self.peer_id, "Glare: keeping local offer");
                    return Ok(OfferOutcome::KeptLocalOffer);
                }
                tracing::debug!(peer = %self.peer_id, "Glare: discarding local offer");
                let rolled_back = self.connection.rollback().await;
                self.guard(rolled_back)?;
                self.state = NegotiationState::Idle;
            }
            other => {
                return Err(LinkError::OutOfSequence(format!(
                    "offer received in {other:?}"
                )));
            }
        }

        let applied = self
            .connection
            .set_remote_description(SdpKind::Offer, sdp)
            .await;
        self.guard(applied)?;
        self.has_remote_description = true;
        self.state = NegotiationState::OfferReceived;
        self.flush_candidates().await;

        let answer = self.connection.create_answer().await;
        let answer = self.guard(answer)?;
        self.state = NegotiationState::AnswerSent;
        tracing::debug!(peer = %self.peer_id, "Answer created");
        Ok(OfferOutcome::Answer(answer))
    }

    /// `OfferSent → AnswerReceived → Stable`.
    pub async fn handle_answer(&mut self, sdp: &str) -> Result<(), LinkError> {
        match self.state {
            NegotiationState::Closed | NegotiationState::Failed => return Ok(()),
            NegotiationState::OfferSent => {}
            other => {
                return Err(LinkError::OutOfSequence(format!(
                    "answer without a pending offer ({other:?})"
                )));
            }
        }

        let applied = self
            .connection
            .set_remote_description(SdpKind::Answer, sdp)
            .await;
        self.guard(applied)?;
        self.has_remote_description = true;
        self.state = NegotiationState::AnswerReceived;
        self.flush_candidates().await;
        self.state = NegotiationState::Stable;
        tracing::debug!(peer = %self.peer_id, "Answer applied, link stable");
        Ok(())
    }

    /// Apply a remote candidate, or queue it until a remote description exists.
    /// Returns `true` if it was applied right away.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if !self.has_remote_description {
            self.pending_candidates.push_back(candidate);
            return false;
        }
        self.apply_candidate(&candidate).await;
        true
    }

    /// React to a transport connection-state report.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> ConnectionOutcome {
        if self.state.is_terminal() {
            return ConnectionOutcome::Unchanged;
        }
        match state {
            ConnectionState::Connected => match self.state {
                NegotiationState::AnswerSent | NegotiationState::AnswerReceived => {
                    self.state = NegotiationState::Stable;
                    ConnectionOutcome::BecameStable
                }
                _ => ConnectionOutcome::Unchanged,
            },
            s if s.is_lost() => {
                self.fail(&format!("transport {s:?}"));
                ConnectionOutcome::Lost
            }
            // Closed from the far side counts as loss; we never close without going terminal first.
            ConnectionState::Closed => {
                self.fail("transport closed");
                ConnectionOutcome::Lost
            }
            _ => ConnectionOutcome::Unchanged,
        }
    }

    /// Take ownership of the remote track. Returns a playback handle, or
    /// `None` if the link is already finished (the stream is stopped).
    pub fn attach_remote_stream(&mut self, stream: AudioStream) -> Option<AudioStreamHandle> {
        if self.state.is_terminal() {
            stream.stop();
            return None;
        }
        let handle = stream.handle();
        if let Some(old) = self.remote_stream.replace(stream) {
            old.stop();
        }
        Some(handle)
    }

    pub fn set_playback(&self, enabled: bool) {
        if let Some(stream) = &self.remote_stream {
            stream.set_enabled(enabled);
        }
    }

    /// Move to `Failed` and release everything. No-op once terminal.
    pub fn fail(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!(peer = %self.peer_id, reason, "Peer link failed");
        self.state = NegotiationState::Failed;
        self.release();
    }

    /// Move to `Closed` and release everything. Idempotent.
    pub fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.release();
    }

    fn release(&mut self) {
        self.pending_candidates.clear();
        if let Some(stream) = self.remote_stream.take() {
            stream.stop();
        }
        self.connection.close();
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(&candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            tracing::warn!(peer = %self.peer_id, error = %e, "Remote ICE candidate rejected");
        }
    }

    /// A failed negotiation step fails the link.
    fn guard<T>(&mut self, result: Result<T, TransportError>) -> Result<T, LinkError> {
        result.map_err(|e| {
            self.fail(&e.to_string());
            LinkError::Transport(e)
        })
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.close();
        }
    }
}
