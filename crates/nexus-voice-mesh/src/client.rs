//! VoiceClient: the handle the UI layer talks to.
//!
//! The coordinator lives inside one spawned session loop. The handle only
//! queues commands and reads published snapshots, so it is cheap to clone
//! and never blocks on negotiation work.

use crate::error::{VoiceError, VoiceResult};
use crate::media::MediaDevices;
use crate::mesh::{MeshCoordinator, MeshEvent};
use crate::relay::SignalRelayClient;
use crate::signaling::MemberInfo;
use crate::state::VoiceSessionState;
use crate::transport::TransportFactory;
use nexus_common::config::VoiceConfig;
use nexus_common::{ChannelId, UserId};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_CAPACITY: usize = 64;

/// Commands processed by the session loop.
#[derive(Debug)]
pub enum VoiceCommand {
    Join {
        channel_id: ChannelId,
        cancel: CancellationToken,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    SetMuted(bool),
    SetDeafened(bool),
    ToggleMute,
    ToggleDeafen,
    MembershipChanged(Vec<MemberInfo>),
    Shutdown,
}

/// Cloneable handle to a running voice session loop.
#[derive(Clone)]
pub struct VoiceClient {
    local_id: UserId,
    tx: mpsc::Sender<VoiceCommand>,
    state: watch::Receiver<VoiceSessionState>,
    pending_join: Arc<Mutex<Option<CancellationToken>>>,
}

impl VoiceClient {
    /// Spawn the session loop on the current runtime.
    pub fn spawn(
        config: VoiceConfig,
        media: Arc<dyn MediaDevices>,
        relay: Arc<dyn SignalRelayClient>,
        transports: Arc<dyn TransportFactory>,
    ) -> (Self, JoinHandle<()>) {
        let (mesh, events) = MeshCoordinator::new(config, media, relay, transports);
        let local_id = mesh.local_id();
        let state = mesh.subscribe();
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(run_session(mesh, events, rx));

        let client = Self {
            local_id,
            tx,
            state,
            pending_join: Arc::new(Mutex::new(None)),
        };
        (client, task)
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    /// Join a channel. Resolves once media and the relay subscription are
    /// up, or with the reason they are not.
    pub async fn join_channel(&self, channel_id: ChannelId) -> VoiceResult<()> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.pending().replace(cancel.clone()) {
            previous.cancel();
        }

        let (reply, rx) = oneshot::channel();
        let sent = self
            .send(VoiceCommand::Join {
                channel_id,
                cancel: cancel.clone(),
                reply,
            })
            .await;
        let result = match sent {
            Ok(()) => rx.await.unwrap_or(Err(VoiceError::SessionClosed)),
            Err(e) => Err(e),
        };

        // The join is over; retire its token unless a newer join replaced it.
        cancel.cancel();
        let mut pending = self.pending();
        if pending.as_ref().is_some_and(CancellationToken::is_cancelled) {
            *pending = None;
        }
        result
    }

    /// Leave the current channel, cancelling a join that is still waiting.
    pub async fn leave_channel(&self) -> VoiceResult<()> {
        if let Some(pending) = self.pending().take() {
            pending.cancel();
        }
        let (reply, rx) = oneshot::channel();
        self.send(VoiceCommand::Leave { reply }).await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    pub async fn set_muted(&self, muted: bool) -> VoiceResult<()> {
        self.send(VoiceCommand::SetMuted(muted)).await
    }

    pub async fn set_deafened(&self, deafened: bool) -> VoiceResult<()> {
        self.send(VoiceCommand::SetDeafened(deafened)).await
    }

    pub async fn toggle_mute(&self) -> VoiceResult<()> {
        self.send(VoiceCommand::ToggleMute).await
    }

    pub async fn toggle_deafen(&self) -> VoiceResult<()> {
        self.send(VoiceCommand::ToggleDeafen).await
    }

    /// Feed a membership snapshot from outside the relay, e.g. the gateway's
    /// voice-state events.
    pub async fn membership_changed(&self, members: Vec<MemberInfo>) -> VoiceResult<()> {
        self.send(VoiceCommand::MembershipChanged(members)).await
    }

    /// Leave and stop the session loop.
    pub async fn shutdown(&self) {
        if let Some(pending) = self.pending().take() {
            pending.cancel();
        }
        let _ = self.tx.send(VoiceCommand::Shutdown).await;
    }

    /// Receiver for every published snapshot.
    pub fn state(&self) -> watch::Receiver<VoiceSessionState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> VoiceSessionState {
        self.state.borrow().clone()
    }

    async fn send(&self, command: VoiceCommand) -> VoiceResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| VoiceError::SessionClosed)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.pending_join.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// The session loop: the single owner of the coordinator.
async fn run_session(
    mut mesh: MeshCoordinator,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
    mut commands: mpsc::Receiver<VoiceCommand>,
) {
    tracing::debug!(user = %mesh.local_id(), "Voice session loop started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if !handle_command(&mut mesh, command).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                mesh.handle_event(event).await;
            }
        }
    }

    mesh.leave();
    tracing::debug!(user = %mesh.local_id(), "Voice session loop stopped");
}

/// Returns `false` when the loop should stop.
async fn handle_command(mesh: &mut MeshCoordinator, command: VoiceCommand) -> bool {
    match command {
        VoiceCommand::Join {
            channel_id,
            cancel,
            reply,
        } => {
            let result = mesh.join(channel_id, &cancel).await;
            let _ = reply.send(result);
        }
        VoiceCommand::Leave { reply } => {
            mesh.leave();
            let _ = reply.send(());
        }
        VoiceCommand::SetMuted(muted) => mesh.set_muted(muted).await,
        VoiceCommand::SetDeafened(deafened) => mesh.set_deafened(deafened).await,
        VoiceCommand::ToggleMute => mesh.toggle_mute().await,
        VoiceCommand::ToggleDeafen => mesh.toggle_deafen().await,
        VoiceCommand::MembershipChanged(members) => mesh.on_membership_changed(members).await,
        VoiceCommand::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::NegotiationState;
    use crate::relay::MemoryRelay;
    use crate::state::ConnectionStatus;
    use crate::testkit::{init_tracing, user, FakeMedia, FakeTransport, MediaMode};
    use crate::transport::ConnectionState;
    use std::time::Duration;

    struct Node {
        client: VoiceClient,
        transport: Arc<FakeTransport>,
        _task: JoinHandle<()>,
    }

    fn node(relay: &MemoryRelay, id: UserId, name: &str, mode: MediaMode) -> Node {
        init_tracing();
        let transport = Arc::new(FakeTransport::default());
        let (client, task) = VoiceClient::spawn(
            VoiceConfig::default(),
            FakeMedia::new(mode),
            Arc::new(relay.client(id, name)),
            transport.clone(),
        );
        Node {
            client,
            transport,
            _task: task,
        }
    }

    async fn wait_for(
        client: &VoiceClient,
        what: &str,
        predicate: impl FnMut(&VoiceSessionState) -> bool,
    ) -> VoiceSessionState {
        let mut rx = client.state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("session loop alive")
            .clone()
    }

    #[tokio::test]
    async fn two_nodes_form_a_link_through_the_relay() {
        let relay = MemoryRelay::new();
        let channel = ChannelId::new();
        let (a_id, b_id) = (user(1), user(2));
        let a = node(&relay, a_id, "alice", MediaMode::Grant);
        let b = node(&relay, b_id, "bob", MediaMode::Grant);

        a.client.join_channel(channel).await.unwrap();
        b.client.join_channel(channel).await.unwrap();

        // Alice has the lower id, so she offers and becomes stable on Bob's answer.
        let a_state = wait_for(&a.client, "alice stable", |s| {
            s.participant(b_id)
                .is_some_and(|p| p.link_state == NegotiationState::Stable)
        })
        .await;
        assert_eq!(a_state.participants[0].display_name, "bob");

        // Bob answered and waits for the transport to connect.
        wait_for(&b.client, "bob answered", |s| {
            s.participant(a_id)
                .is_some_and(|p| p.link_state == NegotiationState::AnswerSent)
        })
        .await;
        b.transport
            .latest(a_id)
            .unwrap()
            .events
            .connection_state(ConnectionState::Connected);
        wait_for(&b.client, "bob stable", |s| {
            s.participant(a_id)
                .is_some_and(|p| p.link_state == NegotiationState::Stable)
        })
        .await;

        // Mute state propagates to the other side.
        a.client.set_muted(true).await.unwrap();
        let b_state = wait_for(&b.client, "alice muted", |s| {
            s.participant(a_id).is_some_and(|p| p.is_muted)
        })
        .await;
        assert!(!b_state.participant(a_id).unwrap().is_deafened);

        // Bob leaves; Alice's link is torn down.
        b.client.leave_channel().await.unwrap();
        wait_for(&a.client, "bob gone", |s| s.participants.is_empty()).await;
        assert!(a.transport.latest(b_id).unwrap().log().closed);
        assert_eq!(relay.subscriber_count(channel), 1);
    }

    #[tokio::test]
    async fn leave_cancels_pending_join() {
        let relay = MemoryRelay::new();
        let channel = ChannelId::new();
        let n = node(&relay, user(1), "alice", MediaMode::Hang);

        let joining = {
            let client = n.client.clone();
            tokio::spawn(async move { client.join_channel(channel).await })
        };
        wait_for(&n.client, "connecting", |s| {
            s.connection_status == ConnectionStatus::Connecting
        })
        .await;

        n.client.leave_channel().await.unwrap();
        let result = joining.await.unwrap();
        assert!(matches!(result, Err(VoiceError::Cancelled)));

        let state = n.client.snapshot();
        assert_eq!(state.connection_status, ConnectionStatus::Disconnected);
        assert_eq!(relay.subscriber_count(channel), 0);
    }

    #[tokio::test]
    async fn toggles_flip_self_state() {
        let relay = MemoryRelay::new();
        let n = node(&relay, user(1), "alice", MediaMode::Grant);
        n.client.join_channel(ChannelId::new()).await.unwrap();

        n.client.toggle_deafen().await.unwrap();
        let state = wait_for(&n.client, "deafened", |s| s.self_deafened).await;
        assert!(state.self_muted);

        n.client.toggle_deafen().await.unwrap();
        let state = wait_for(&n.client, "undeafened", |s| !s.self_deafened).await;
        assert!(state.self_muted);

        n.client.toggle_mute().await.unwrap();
        wait_for(&n.client, "unmuted", |s| !s.self_muted).await;
    }

    #[tokio::test]
    async fn denied_microphone_fails_join() {
        let relay = MemoryRelay::new();
        let channel = ChannelId::new();
        let n = node(&relay, user(1), "alice", MediaMode::Deny);

        let err = n.client.join_channel(channel).await.unwrap_err();
        assert!(matches!(err, VoiceError::MediaUnavailable(_)));
        assert_eq!(relay.subscriber_count(channel), 0);
        assert!(!n.client.snapshot().is_connected());
    }

    #[tokio::test]
    async fn commands_after_shutdown_report_closed_session() {
        let relay = MemoryRelay::new();
        let (client, task) = VoiceClient::spawn(
            VoiceConfig::default(),
            FakeMedia::new(MediaMode::Grant),
            Arc::new(relay.client(user(1), "alice")),
            Arc::new(FakeTransport::default()),
        );

        client.shutdown().await;
        task.await.unwrap();

        let err = client.toggle_mute().await.unwrap_err();
        assert!(matches!(err, VoiceError::SessionClosed));
    }
}
