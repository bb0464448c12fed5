//! MeshCoordinator: the full-mesh voice engine for one local user.
//!
//! Architecture:
//! ```text
//!   A ◀──WebRTC──▶ B
//!   ▲              ▲
//!   └───WebRTC──▶ C ◀┘      one PeerLink per remote participant
//! ```
//!
//! The coordinator owns the local capture stream, the relay subscription and
//! every PeerLink. It is the only writer of [`VoiceSessionState`]. All input
//! (relay events, transport events, speech edges, timers) arrives as
//! [`MeshEvent`]s on a single queue drained by the session loop, so each
//! mutation completes before the next one starts.
//!
//! Relay and speech events carry the session epoch; transport events carry
//! the link id. Events from a previous session or a replaced link are
//! dropped.

use crate::error::{VoiceError, VoiceResult};
use crate::media::{AudioStream, AudioStreamHandle, MediaDevices};
use crate::peer::{
    should_offer, ConnectionOutcome, LinkError, NegotiationState, OfferOutcome, PeerLink,
};
use crate::relay::{SignalRelayClient, SubscriptionGuard};
use crate::signaling::{
    IceCandidate, MemberInfo, PeerMediaState, RelayEvent, SignalKind, SignalingMessage,
};
use crate::speech::SpeechMonitor;
use crate::state::{ConnectionStatus, ParticipantView, VoiceSessionState};
use crate::transport::{LinkId, PeerEvent, PeerEventKind, PeerEventSink, TransportFactory};
use chrono::Utc;
use nexus_common::config::VoiceConfig;
use nexus_common::ids::generate_id;
use nexus_common::{ChannelId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the session loop feeds into the coordinator besides commands.
#[derive(Debug)]
pub enum MeshEvent {
    Relay { epoch: u64, event: RelayEvent },
    /// The relay side of the subscription went away.
    RelayClosed { epoch: u64 },
    Peer(PeerEvent),
    LocalSpeaking { epoch: u64, speaking: bool },
    RemoteSpeaking { peer_id: UserId, link_id: LinkId, speaking: bool },
    Retry { epoch: u64, peer_id: UserId },
    NegotiationDeadline { peer_id: UserId, link_id: LinkId },
}

/// Resources held only while joined.
struct ActiveSession {
    channel_id: ChannelId,
    local: AudioStream,
    subscription: SubscriptionGuard,
    pump: JoinHandle<()>,
    monitor: SpeechMonitor,
}

impl ActiveSession {
    fn close(mut self) {
        self.monitor.stop();
        self.pump.abort();
        self.subscription.close();
        self.local.stop();
    }
}

struct LinkSlot {
    link: PeerLink,
    monitor: Option<SpeechMonitor>,
    deadline: Option<JoinHandle<()>>,
}

impl Drop for LinkSlot {
    fn drop(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }
}

pub struct MeshCoordinator {
    local_id: UserId,
    config: VoiceConfig,
    media: Arc<dyn MediaDevices>,
    relay: Arc<dyn SignalRelayClient>,
    transports: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<MeshEvent>,
    session: Option<ActiveSession>,
    links: HashMap<UserId, LinkSlot>,
    /// Remote members of the current channel, as last reported by the relay.
    members: HashMap<UserId, MemberInfo>,
    retries: HashMap<UserId, u32>,
    epoch: u64,
    state: VoiceSessionState,
    state_tx: watch::Sender<VoiceSessionState>,
}

impl MeshCoordinator {
    /// Create an idle coordinator. The returned receiver is the event queue
    /// the session loop must drain into [`MeshCoordinator::handle_event`].
    pub fn new(
        config: VoiceConfig,
        media: Arc<dyn MediaDevices>,
        relay: Arc<dyn SignalRelayClient>,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(VoiceSessionState::default());
        let coordinator = Self {
            local_id: relay.local_id(),
            config,
            media,
            relay,
            transports,
            events,
            session: None,
            links: HashMap::new(),
            members: HashMap::new(),
            retries: HashMap::new(),
            epoch: 0,
            state: VoiceSessionState::default(),
            state_tx,
        };
        (coordinator, events_rx)
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    pub fn subscribe(&self) -> watch::Receiver<VoiceSessionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> VoiceSessionState {
        self.state.clone()
    }

    pub fn link_state(&self, peer: UserId) -> Option<NegotiationState> {
        self.links.get(&peer).map(|slot| slot.link.state())
    }

    pub fn link_id(&self, peer: UserId) -> Option<LinkId> {
        self.links.get(&peer).map(|slot| slot.link.link_id())
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Join a voice channel: acquire the microphone and subscribe to the
    /// relay concurrently. Nothing stays open if either fails or `cancel`
    /// fires first.
    pub async fn join(&mut self, channel_id: ChannelId, cancel: &CancellationToken) -> VoiceResult<()> {
        if self.session.as_ref().is_some_and(|s| s.channel_id == channel_id) {
            return Ok(());
        }
        if self.session.is_some() {
            self.leave();
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.state.channel_id = Some(channel_id);
        self.state.connection_status = ConnectionStatus::Connecting;
        self.publish();
        tracing::info!(channel = %channel_id, user = %self.local_id, "Joining voice channel");

        let media = self.media.clone();
        let relay = self.relay.clone();
        let acquire = async move { media.open_microphone().await };
        let subscribe = async move { relay.subscribe(channel_id).await };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            both = async { tokio::join!(acquire, subscribe) } => Some(both),
        };

        // Dropping the join future above also drops whichever half had
        // already completed, which stops the stream or closes the subscription.
        let Some((captured, subscribed)) = outcome else {
            tracing::info!(channel = %channel_id, "Join cancelled");
            self.reset_connection();
            return Err(VoiceError::Cancelled);
        };

        let (local, subscription) = match (captured, subscribed) {
            (Ok(local), Ok(subscription)) => (local, subscription),
            (Err(e), subscribed) => {
                if let Ok(subscription) = subscribed {
                    let (_, mut guard) = subscription.into_parts();
                    guard.close();
                }
                tracing::warn!(channel = %channel_id, error = %e, "Join failed: microphone unavailable");
                self.reset_connection();
                return Err(VoiceError::MediaUnavailable(e));
            }
            (Ok(local), Err(e)) => {
                local.stop();
                tracing::warn!(channel = %channel_id, error = %e, "Join failed: relay unreachable");
                self.reset_connection();
                return Err(VoiceError::RelayUnreachable(e));
            }
        };

        local.set_enabled(!self.state.self_muted);

        let (mut relay_events, guard) = subscription.into_parts();
        let tx = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = relay_events.recv().await {
                if tx.send(MeshEvent::Relay { epoch, event }).is_err() {
                    return;
                }
            }
            let _ = tx.send(MeshEvent::RelayClosed { epoch });
        });

        let tx = self.events.clone();
        let monitor = SpeechMonitor::spawn(local.handle(), &self.config.speech, true, move |speaking| {
            tx.send(MeshEvent::LocalSpeaking { epoch, speaking }).is_ok()
        });

        self.state.local_stream = Some(local.handle());
        self.session = Some(ActiveSession {
            channel_id,
            local,
            subscription: guard,
            pump,
            monitor,
        });
        self.state.connection_status = ConnectionStatus::Connected;
        self.state.connected_at = Some(Utc::now());
        self.publish();

        tracing::info!(channel = %channel_id, user = %self.local_id, "Joined voice channel");
        Ok(())
    }

    /// Leave the current channel. Idempotent and safe before any join.
    pub fn leave(&mut self) {
        self.epoch += 1;

        for (_, mut slot) in self.links.drain() {
            slot.link.close();
        }
        self.members.clear();
        self.retries.clear();

        if let Some(session) = self.session.take() {
            let channel_id = session.channel_id;
            session.close();
            tracing::info!(channel = %channel_id, user = %self.local_id, "Left voice channel");
        }

        self.state = VoiceSessionState::default();
        self.publish();
    }

    fn reset_connection(&mut self) {
        self.state.channel_id = None;
        self.state.connection_status = ConnectionStatus::Disconnected;
        self.state.connected_at = None;
        self.state.local_stream = None;
        self.state.self_speaking = false;
        self.state.participants.clear();
        self.publish();
    }

    // ── membership ──────────────────────────────────────────────────────────

    /// Reconcile links with the channel membership. The local user is ignored,
    /// and a peer listed more than once keeps its first entry.
    pub async fn on_membership_changed(&mut self, members: Vec<MemberInfo>) {
        if self.session.is_none() {
            tracing::debug!("Membership update ignored while not joined");
            return;
        }

        let mut seen = HashSet::new();
        let remote: Vec<MemberInfo> = members
            .into_iter()
            .filter(|m| m.user_id != self.local_id && seen.insert(m.user_id))
            .collect();

        let departed: Vec<UserId> = self
            .links
            .keys()
            .filter(|peer| !remote.iter().any(|m| m.user_id == **peer))
            .copied()
            .collect();
        for peer in departed {
            if let Some(mut slot) = self.links.remove(&peer) {
                slot.link.close();
            }
            self.state.remove_participant(peer);
            tracing::info!(peer = %peer, "Peer left voice channel");
        }

        for member in &remote {
            if let Some(view) = self.state.participant_mut(member.user_id) {
                view.display_name.clone_from(&member.display_name);
            }
        }

        let arrived: Vec<MemberInfo> = remote
            .iter()
            .filter(|m| !self.links.contains_key(&m.user_id))
            .cloned()
            .collect();

        self.members = remote.into_iter().map(|m| (m.user_id, m)).collect();
        self.retries.retain(|peer, _| self.members.contains_key(peer));

        for member in arrived {
            let initiate = should_offer(self.local_id, member.user_id);
            if let Err(e) = self.open_link(member.user_id, &member.display_name, initiate).await {
                tracing::warn!(peer = %member.user_id, error = %e, "Could not open peer link");
            }
        }

        self.publish();
    }

    // ── signaling ───────────────────────────────────────────────────────────

    /// Route one inbound signaling message to its link.
    pub async fn on_signaling_message(&mut self, msg: SignalingMessage) -> VoiceResult<()> {
        let Some(channel_id) = self.session.as_ref().map(|s| s.channel_id) else {
            return Err(VoiceError::invalid("not joined to a voice channel"));
        };
        if msg.channel_id != channel_id {
            return Err(VoiceError::invalid(format!(
                "message for channel {} while in {channel_id}",
                msg.channel_id
            )));
        }
        if msg.to_peer != self.local_id {
            return Err(VoiceError::invalid(format!("message addressed to {}", msg.to_peer)));
        }
        if msg.from_peer == self.local_id {
            return Err(VoiceError::invalid("message from ourselves"));
        }

        let from = msg.from_peer;
        match msg.kind {
            SignalKind::Offer => self.accept_offer(from, msg.payload).await,
            SignalKind::Answer => {
                let Some(slot) = self.links.get_mut(&from) else {
                    return Err(VoiceError::invalid(format!("answer from unlinked peer {from}")));
                };
                match slot.link.handle_answer(&msg.payload).await {
                    Ok(()) => {
                        if slot.link.state() == NegotiationState::Stable {
                            self.on_link_stable(from).await;
                        }
                        Ok(())
                    }
                    Err(e) => Err(self.link_error(from, e)),
                }
            }
            SignalKind::Candidate => {
                let Some(slot) = self.links.get_mut(&from) else {
                    return Err(VoiceError::invalid(format!("candidate from unlinked peer {from}")));
                };
                slot.link.add_remote_candidate(IceCandidate(msg.payload)).await;
                Ok(())
            }
            SignalKind::State => {
                let remote = PeerMediaState::decode(&msg.payload)
                    .map_err(|e| VoiceError::invalid(format!("bad state payload: {e}")))?;
                let Some(view) = self.state.participant_mut(from) else {
                    return Err(VoiceError::invalid(format!("state from unlinked peer {from}")));
                };
                view.is_muted = remote.muted;
                view.is_deafened = remote.deafened;
                if remote.muted {
                    view.is_speaking = false;
                }
                self.publish();
                Ok(())
            }
        }
    }

    async fn accept_offer(&mut self, from: UserId, sdp: String) -> VoiceResult<()> {
        // An offer to a link that is already past its own offer means the
        // peer restarted negotiation; start over with a fresh link.
        let replace = self.links.get(&from).is_none_or(|slot| {
            !matches!(
                slot.link.state(),
                NegotiationState::Idle | NegotiationState::OfferSent
            )
        });
        if replace {
            let display_name = self
                .members
                .entry(from)
                .or_insert_with(|| MemberInfo::new(from, from.to_string()))
                .display_name
                .clone();
            self.open_link(from, &display_name, false).await?;
        }

        let Some(slot) = self.links.get_mut(&from) else {
            return Ok(());
        };
        match slot.link.handle_offer(&sdp).await {
            Ok(OfferOutcome::Answer(answer)) => {
                self.publish();
                self.send_signal(from, SignalKind::Answer, answer).await
            }
            Ok(OfferOutcome::KeptLocalOffer | OfferOutcome::Ignored) => Ok(()),
            Err(e) => Err(self.link_error(from, e)),
        }
    }

    // ── self state ──────────────────────────────────────────────────────────

    /// Mute or unmute capture. Playback and the deafen flag are left alone.
    pub async fn set_muted(&mut self, muted: bool) {
        self.apply_mute(muted);
        self.publish();
        self.announce_state().await;
    }

    /// Deafen forces mute; undeafen leaves mute as it is.
    pub async fn set_deafened(&mut self, deafened: bool) {
        self.state.self_deafened = deafened;
        self.set_playback(!deafened);
        if deafened {
            self.apply_mute(true);
        }
        self.publish();
        self.announce_state().await;
    }

    pub async fn toggle_mute(&mut self) {
        self.set_muted(!self.state.self_muted).await;
    }

    pub async fn toggle_deafen(&mut self) {
        self.set_deafened(!self.state.self_deafened).await;
    }

    fn apply_mute(&mut self, muted: bool) {
        self.state.self_muted = muted;
        if muted {
            self.state.self_speaking = false;
        }
        if let Some(session) = &self.session {
            session.local.set_enabled(!muted);
        }
    }

    fn set_playback(&self, enabled: bool) {
        for slot in self.links.values() {
            slot.link.set_playback(enabled);
        }
    }

    async fn announce_state(&mut self) {
        let peers: Vec<UserId> = self
            .links
            .iter()
            .filter(|(_, slot)| slot.link.state() == NegotiationState::Stable)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in peers {
            self.send_state(peer).await;
        }
    }

    async fn send_state(&mut self, peer: UserId) {
        let state = PeerMediaState {
            muted: self.state.self_muted,
            deafened: self.state.self_deafened,
        };
        match state.encode() {
            Ok(payload) => {
                let _ = self.send_signal(peer, SignalKind::State, payload).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode media state"),
        }
    }

    // ── events ──────────────────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Relay { epoch, event } => {
                if epoch != self.epoch {
                    return;
                }
                match event {
                    RelayEvent::Signal(msg) => {
                        let (kind, from) = (msg.kind, msg.from_peer);
                        match self.on_signaling_message(msg).await {
                            Ok(()) => {}
                            Err(e @ VoiceError::PeerNegotiationFailed { .. }) => {
                                tracing::warn!(peer = %from, error = %e, "Peer negotiation failed");
                            }
                            Err(e) => {
                                tracing::warn!(peer = %from, kind = ?kind, error = %e, "Dropped signaling message");
                            }
                        }
                    }
                    RelayEvent::Members {
                        channel_id,
                        members,
                    } => {
                        if self.session.as_ref().is_some_and(|s| s.channel_id == channel_id) {
                            self.on_membership_changed(members).await;
                        }
                    }
                }
            }

            MeshEvent::RelayClosed { epoch } => {
                if epoch == self.epoch && self.session.is_some() {
                    tracing::warn!("Relay subscription ended, leaving voice channel");
                    self.leave();
                }
            }

            MeshEvent::Peer(PeerEvent {
                peer_id,
                link_id,
                kind,
            }) => self.on_peer_event(peer_id, link_id, kind).await,

            MeshEvent::LocalSpeaking { epoch, speaking } => {
                if epoch != self.epoch || self.session.is_none() {
                    return;
                }
                self.state.self_speaking = speaking && !self.state.self_muted;
                self.publish();
            }

            MeshEvent::RemoteSpeaking {
                peer_id,
                link_id,
                speaking,
            } => {
                if self.link_id(peer_id) != Some(link_id) {
                    return;
                }
                if let Some(view) = self.state.participant_mut(peer_id) {
                    view.is_speaking = speaking && !view.is_muted;
                    self.publish();
                }
            }

            MeshEvent::Retry { epoch, peer_id } => {
                if epoch != self.epoch || self.links.contains_key(&peer_id) {
                    return;
                }
                let Some(member) = self.members.get(&peer_id).cloned() else {
                    return;
                };
                tracing::info!(peer = %peer_id, "Reconnecting peer link");
                let initiate = should_offer(self.local_id, peer_id);
                if let Err(e) = self.open_link(peer_id, &member.display_name, initiate).await {
                    tracing::warn!(peer = %peer_id, error = %e, "Reconnect failed");
                }
            }

            MeshEvent::NegotiationDeadline { peer_id, link_id } => {
                let expired = self.links.get(&peer_id).is_some_and(|slot| {
                    slot.link.link_id() == link_id
                        && slot.link.state() != NegotiationState::Stable
                        && !slot.link.state().is_terminal()
                });
                if expired {
                    self.drop_failed_link(peer_id, "negotiation timed out");
                }
            }
        }
    }

    async fn on_peer_event(&mut self, peer_id: UserId, link_id: LinkId, kind: PeerEventKind) {
        let Some(slot) = self
            .links
            .get_mut(&peer_id)
            .filter(|slot| slot.link.link_id() == link_id)
        else {
            tracing::trace!(peer = %peer_id, link = %link_id, "Event for a retired link dropped");
            return;
        };

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                if !slot.link.state().is_terminal() {
                    let _ = self
                        .send_signal(peer_id, SignalKind::Candidate, candidate.0)
                        .await;
                }
            }
            PeerEventKind::RemoteTrack(stream) => {
                stream.set_enabled(!self.state.self_deafened);
                if let Some(handle) = slot.link.attach_remote_stream(stream) {
                    let tx = self.events.clone();
                    slot.monitor = Some(SpeechMonitor::spawn(
                        handle,
                        &self.config.speech,
                        false,
                        move |speaking| {
                            tx.send(MeshEvent::RemoteSpeaking {
                                peer_id,
                                link_id,
                                speaking,
                            })
                            .is_ok()
                        },
                    ));
                    tracing::debug!(peer = %peer_id, "Remote audio track attached");
                }
                self.publish();
            }
            PeerEventKind::ConnectionState(state) => match slot.link.on_connection_state(state) {
                ConnectionOutcome::BecameStable => self.on_link_stable(peer_id).await,
                ConnectionOutcome::Lost => {
                    self.drop_failed_link(peer_id, &format!("connection {state:?}"));
                }
                ConnectionOutcome::Unchanged => {}
            },
        }
    }

    // ── links ───────────────────────────────────────────────────────────────

    /// Create (or replace) the link to `peer` and optionally send the offer.
    async fn open_link(&mut self, peer: UserId, display_name: &str, initiate: bool) -> VoiceResult<()> {
        let Some(local_track) = self.session.as_ref().map(|s| s.local.handle()) else {
            return Err(VoiceError::SessionClosed);
        };

        if let Some(mut old) = self.links.remove(&peer) {
            tracing::debug!(peer = %peer, link = %old.link.link_id(), "Replacing peer link");
            old.link.close();
        }

        let link_id = generate_id();
        let sink = PeerEventSink::new(peer, link_id, self.events.clone());
        let link = self
            .transports
            .create(peer, &self.config.ice_servers, sink)
            .and_then(|conn| PeerLink::new(self.local_id, peer, link_id, conn, local_track));
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                let reason = e.to_string();
                self.state.remove_participant(peer);
                tracing::warn!(peer = %peer, error = %e, "Peer connection could not be created");
                self.schedule_retry(peer);
                self.publish();
                return Err(VoiceError::PeerNegotiationFailed { peer, reason });
            }
        };

        let deadline = self.spawn_deadline(peer, link_id);
        self.links.insert(
            peer,
            LinkSlot {
                link,
                monitor: None,
                deadline: Some(deadline),
            },
        );

        match self.state.participant_mut(peer) {
            Some(view) => {
                view.display_name = display_name.to_string();
                view.is_speaking = false;
            }
            None => self
                .state
                .participants
                .push(ParticipantView::new(peer, display_name)),
        }
        tracing::debug!(peer = %peer, link = %link_id, initiate, "Peer link created");

        if initiate {
            self.send_offer(peer).await?;
        }
        self.publish();
        Ok(())
    }

    async fn send_offer(&mut self, peer: UserId) -> VoiceResult<()> {
        let Some(slot) = self.links.get_mut(&peer) else {
            return Ok(());
        };
        match slot.link.start_offer().await {
            Ok(offer) => self.send_signal(peer, SignalKind::Offer, offer).await,
            Err(e) => Err(self.link_error(peer, e)),
        }
    }

    async fn on_link_stable(&mut self, peer: UserId) {
        if let Some(slot) = self.links.get_mut(&peer) {
            if let Some(deadline) = slot.deadline.take() {
                deadline.abort();
            }
        }
        self.retries.remove(&peer);
        tracing::info!(peer = %peer, "Peer link established");
        self.publish();
        self.send_state(peer).await;
    }

    /// Send through the relay. A lost offer or answer fails the link; a lost
    /// candidate or state update is only logged.
    async fn send_signal(&mut self, peer: UserId, kind: SignalKind, payload: String) -> VoiceResult<()> {
        let Some(channel_id) = self.session.as_ref().map(|s| s.channel_id) else {
            return Ok(());
        };
        let message = SignalingMessage::new(kind, channel_id, self.local_id, peer, payload);
        match self.relay.send(peer, message).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(kind, SignalKind::Offer | SignalKind::Answer) => {
                let reason = format!("relay send failed: {e}");
                self.drop_failed_link(peer, &reason);
                Err(VoiceError::PeerNegotiationFailed { peer, reason })
            }
            Err(e) => {
                tracing::debug!(peer = %peer, kind = ?kind, error = %e, "Relay send failed");
                Ok(())
            }
        }
    }

    fn link_error(&mut self, peer: UserId, error: LinkError) -> VoiceError {
        match error {
            LinkError::OutOfSequence(reason) => {
                VoiceError::InvalidSignalingMessage(format!("from {peer}: {reason}"))
            }
            LinkError::Transport(e) => {
                let reason = e.to_string();
                self.drop_failed_link(peer, &reason);
                VoiceError::PeerNegotiationFailed { peer, reason }
            }
        }
    }

    /// Remove a failed link; the rest of the mesh carries on.
    fn drop_failed_link(&mut self, peer: UserId, reason: &str) {
        if let Some(mut slot) = self.links.remove(&peer) {
            slot.link.fail(reason);
        }
        self.state.remove_participant(peer);
        tracing::warn!(peer = %peer, reason, "Peer link failed");
        self.schedule_retry(peer);
        self.publish();
    }

    fn schedule_retry(&mut self, peer: UserId) {
        if self.session.is_none() || !self.members.contains_key(&peer) {
            return;
        }
        let limit = self.config.mesh.reconnect_attempts;
        let attempts = self.retries.entry(peer).or_insert(0);
        if *attempts >= limit {
            tracing::warn!(peer = %peer, attempts = *attempts, "Giving up on peer link");
            return;
        }
        *attempts += 1;
        let attempt = *attempts;

        let tx = self.events.clone();
        let epoch = self.epoch;
        let delay = self.config.mesh.reconnect_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(MeshEvent::Retry {
                epoch,
                peer_id: peer,
            });
        });
        tracing::debug!(peer = %peer, attempt, "Peer reconnect scheduled");
    }

    fn spawn_deadline(&self, peer: UserId, link_id: LinkId) -> JoinHandle<()> {
        let tx = self.events.clone();
        let timeout = self.config.mesh.negotiation_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(MeshEvent::NegotiationDeadline {
                peer_id: peer,
                link_id,
            });
        })
    }

    /// Refresh per-link fields and publish if anything changed.
    fn publish(&mut self) {
        for view in &mut self.state.participants {
            if let Some(slot) = self.links.get(&view.user_id) {
                view.link_state = slot.link.state();
                view.remote_stream = slot.link.remote_stream();
            }
        }
        let next = self.state.clone();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Read-only handle to the local capture stream, while joined.
    pub fn local_stream(&self) -> Option<AudioStreamHandle> {
        self.session.as_ref().map(|s| s.local.handle())
    }
}

impl Drop for MeshCoordinator {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}
