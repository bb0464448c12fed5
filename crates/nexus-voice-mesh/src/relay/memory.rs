//! In-process signaling relay.
//!
//! Every client of one [`MemoryRelay`] shares a hub of channel → subscriber
//! queues. Subscribing or closing a subscription re-broadcasts the channel's
//! membership to every subscriber, the same way the Nexus relay does.

use super::{RelaySubscription, SignalRelayClient};
use crate::error::RelayError;
use crate::signaling::{MemberInfo, RelayEvent, SignalingMessage};
use async_trait::async_trait;
use nexus_common::{ChannelId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const DEFAULT_CAPACITY: usize = 256;

struct Subscriber {
    member: MemberInfo,
    token: u64,
    tx: mpsc::Sender<RelayEvent>,
}

#[derive(Default)]
struct Hub {
    channels: HashMap<ChannelId, Vec<Subscriber>>,
}

impl Hub {
    fn broadcast_members(&self, channel_id: ChannelId) {
        let Some(subscribers) = self.channels.get(&channel_id) else {
            return;
        };
        let members: Vec<MemberInfo> = subscribers.iter().map(|s| s.member.clone()).collect();

        for sub in subscribers {
            let event = RelayEvent::Members {
                channel_id,
                members: members.clone(),
            };
            if sub.tx.try_send(event).is_err() {
                tracing::warn!(
                    channel = %channel_id,
                    user = %sub.member.user_id,
                    "Dropped membership update for slow subscriber"
                );
            }
        }
    }
}

/// In-process relay hub. Cheap to clone; clones share the hub.
#[derive(Clone)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
    next_token: Arc<AtomicU64>,
    capacity: usize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            next_token: Arc::new(AtomicU64::new(1)),
            capacity: capacity.max(1),
        }
    }

    /// A client authenticated as `user_id`.
    pub fn client(&self, user_id: UserId, display_name: impl Into<String>) -> MemoryRelayClient {
        MemoryRelayClient {
            relay: self.clone(),
            member: MemberInfo::new(user_id, display_name),
        }
    }

    /// Number of open subscriptions on a channel.
    pub fn subscriber_count(&self, channel_id: ChannelId) -> usize {
        self.lock()
            .channels
            .get(&channel_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Current membership of a channel, in subscription order.
    pub fn members(&self, channel_id: ChannelId) -> Vec<MemberInfo> {
        self.lock()
            .channels
            .get(&channel_id)
            .map(|subs| subs.iter().map(|s| s.member.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        // A panic while holding the lock cannot leave the hub half-updated.
        self.hub.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unsubscribe(&self, channel_id: ChannelId, token: u64) {
        let mut hub = self.lock();
        let Some(subscribers) = hub.channels.get_mut(&channel_id) else {
            return;
        };
        subscribers.retain(|s| s.token != token);
        if subscribers.is_empty() {
            hub.channels.remove(&channel_id);
        } else {
            hub.broadcast_members(channel_id);
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// One user's view of a [`MemoryRelay`].
#[derive(Clone)]
pub struct MemoryRelayClient {
    relay: MemoryRelay,
    member: MemberInfo,
}

#[async_trait]
impl SignalRelayClient for MemoryRelayClient {
    fn local_id(&self) -> UserId {
        self.member.user_id
    }

    async fn subscribe(&self, channel_id: ChannelId) -> Result<RelaySubscription, RelayError> {
        let (tx, rx) = mpsc::channel(self.relay.capacity);
        let token = self.relay.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut hub = self.relay.lock();
            let subscribers = hub.channels.entry(channel_id).or_default();
            // One subscription per user per channel; a resubscribe replaces the old one.
            subscribers.retain(|s| s.member.user_id != self.member.user_id);
            subscribers.push(Subscriber {
                member: self.member.clone(),
                token,
                tx,
            });
            hub.broadcast_members(channel_id);
        }

        tracing::debug!(
            channel = %channel_id,
            user = %self.member.user_id,
            "Subscribed to in-process relay"
        );

        let relay = self.relay.clone();
        Ok(RelaySubscription::new(channel_id, rx, move || {
            relay.unsubscribe(channel_id, token)
        }))
    }

    async fn send(&self, target: UserId, message: SignalingMessage) -> Result<(), RelayError> {
        let tx = {
            let hub = self.relay.lock();
            let subscribers = hub
                .channels
                .get(&message.channel_id)
                .ok_or(RelayError::NotConnected)?;
            if !subscribers.iter().any(|s| s.member.user_id == self.member.user_id) {
                return Err(RelayError::NotConnected);
            }
            subscribers
                .iter()
                .find(|s| s.member.user_id == target)
                .map(|s| s.tx.clone())
                .ok_or(RelayError::UnknownPeer(target))?
        };

        tx.send(RelayEvent::Signal(message))
            .await
            .map_err(|_| RelayError::UnknownPeer(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalKind;

    fn member_ids(event: Option<RelayEvent>) -> Vec<UserId> {
        match event {
            Some(RelayEvent::Members { members, .. }) => members.iter().map(|m| m.user_id).collect(),
            other => panic!("expected membership, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_broadcasts_membership() {
        let relay = MemoryRelay::new();
        let channel = ChannelId::new();
        let (a, b) = (UserId::new(), UserId::new());

        let mut sub_a = relay.client(a, "a").subscribe(channel).await.unwrap();
        assert_eq!(member_ids(sub_a.recv().await), vec![a]);

        let mut sub_b = relay.client(b, "b").subscribe(channel).await.unwrap();
        assert_eq!(member_ids(sub_a.recv().await), vec![a, b]);
        assert_eq!(member_ids(sub_b.recv().await), vec![a, b]);

        drop(sub_b);
        assert_eq!(member_ids(sub_a.recv().await), vec![a]);
        assert_eq!(relay.subscriber_count(channel), 1);
    }

    #[tokio::test]
    async fn routes_to_target_only() {
        let relay = MemoryRelay::new();
        let channel = ChannelId::new();
        let (a, b) = (UserId::new(), UserId::new());
        let client_a = relay.client(a, "a");

        let _sub_a = client_a.subscribe(channel).await.unwrap();
        let mut sub_b = relay.client(b, "b").subscribe(channel).await.unwrap();
        let _ = sub_b.recv().await;

        let msg = SignalingMessage::new(SignalKind::Offer, channel, a, b, "v=0");
        client_a.send(b, msg.clone()).await.unwrap();
        assert_eq!(sub_b.recv().await, Some(RelayEvent::Signal(msg)));

        let stranger = UserId::new();
        let err = client_a
            .send(stranger, SignalingMessage::new(SignalKind::Offer, channel, a, stranger, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownPeer(id) if id == stranger));
    }

    #[tokio::test]
    async fn closed_guard_unsubscribes() {
        let relay = MemoryRelay::new();
        let channel = ChannelId::new();
        let sub = relay.client(UserId::new(), "a").subscribe(channel).await.unwrap();

        let (_events, mut guard) = sub.into_parts();
        assert_eq!(relay.subscriber_count(channel), 1);
        guard.close();
        assert!(!guard.is_open());
        assert_eq!(relay.subscriber_count(channel), 0);
    }
}
