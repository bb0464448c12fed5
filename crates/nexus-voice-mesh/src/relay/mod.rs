//! Signaling relay clients.
//!
//! The relay is an external service; this module only defines how the mesh
//! talks to it. Two clients are provided:
//! - [`MemoryRelay`]: an in-process hub (single-process deployments, tests)
//! - [`WsRelayClient`]: the Nexus relay over WebSocket
//!
//! Delivery is assumed ordered per sender/receiver pair; nothing here
//! reorders or retries messages.

pub mod memory;
pub mod ws;

pub use memory::{MemoryRelay, MemoryRelayClient};
pub use ws::WsRelayClient;

use crate::error::RelayError;
use crate::signaling::{RelayEvent, SignalingMessage};
use async_trait::async_trait;
use nexus_common::{ChannelId, UserId};
use tokio::sync::mpsc;

/// Client side of the signaling relay, bound to the local user's identity.
#[async_trait]
pub trait SignalRelayClient: Send + Sync + 'static {
    /// The identity this client is authenticated as.
    fn local_id(&self) -> UserId;

    /// Join the channel's signaling group and start receiving its events.
    async fn subscribe(&self, channel_id: ChannelId) -> Result<RelaySubscription, RelayError>;

    /// Send a message to one peer of the subscribed channel.
    async fn send(&self, target: UserId, message: SignalingMessage) -> Result<(), RelayError>;
}

/// A live subscription. Dropping it (or closing its guard) unsubscribes
/// from the channel.
pub struct RelaySubscription {
    events: mpsc::Receiver<RelayEvent>,
    guard: SubscriptionGuard,
}

impl RelaySubscription {
    pub fn new(
        channel_id: ChannelId,
        events: mpsc::Receiver<RelayEvent>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            guard: SubscriptionGuard {
                channel_id,
                on_close: Some(Box::new(on_close)),
            },
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.guard.channel_id
    }

    /// Next event, or `None` once the relay side has gone away.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Split into the event stream and the guard that keeps the subscription open.
    pub fn into_parts(self) -> (mpsc::Receiver<RelayEvent>, SubscriptionGuard) {
        (self.events, self.guard)
    }
}

/// Keeps a relay subscription open until closed or dropped.
pub struct SubscriptionGuard {
    channel_id: ChannelId,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn is_open(&self) -> bool {
        self.on_close.is_some()
    }

    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
            tracing::debug!(channel = %self.channel_id, "Relay subscription closed");
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.close();
    }
}
