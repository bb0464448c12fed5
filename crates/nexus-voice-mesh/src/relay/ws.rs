//! WebSocket signaling relay client.
//!
//! One WebSocket per subscription. Frames are JSON `{"op": .., "d": ..}`
//! ([`RelayFrame`]). A reader task turns inbound frames into
//! [`RelayEvent`]s; a writer task drains the outbound queue so `send` never
//! holds the socket across an await.

use super::{RelaySubscription, SignalRelayClient};
use crate::error::RelayError;
use crate::signaling::{MemberInfo, RelayEvent, RelayFrame, SignalingMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nexus_common::config::RelayConfig;
use nexus_common::{ChannelId, UserId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct Outbound {
    channel_id: ChannelId,
    tx: mpsc::Sender<RelayFrame>,
}

/// Relay client speaking the Nexus voice relay protocol.
pub struct WsRelayClient {
    url: String,
    member: MemberInfo,
    connect_timeout: Duration,
    capacity: usize,
    outbound: Arc<Mutex<Option<Outbound>>>,
}

impl WsRelayClient {
    pub fn new(config: &RelayConfig, user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            url: config.url.clone(),
            member: MemberInfo::new(user_id, display_name),
            connect_timeout: config.connect_timeout(),
            capacity: config.channel_capacity.max(1),
            outbound: Arc::new(Mutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn sender_for(&self, channel_id: ChannelId) -> Result<mpsc::Sender<RelayFrame>, RelayError> {
        let slot = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            Some(out) if out.channel_id == channel_id => Ok(out.tx.clone()),
            _ => Err(RelayError::NotConnected),
        }
    }
}

#[async_trait]
impl SignalRelayClient for WsRelayClient {
    fn local_id(&self) -> UserId {
        self.member.user_id
    }

    async fn subscribe(&self, channel_id: ChannelId) -> Result<RelaySubscription, RelayError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| RelayError::Timeout)??;
        let (mut sink, mut stream) = ws.split();

        let subscribe = RelayFrame::Subscribe {
            channel_id,
            user_id: self.member.user_id,
            display_name: self.member.display_name.clone(),
        };
        sink.send(Message::Text(serde_json::to_string(&subscribe)?.into()))
            .await?;

        tracing::info!(
            channel = %channel_id,
            url = %self.url,
            "Subscribed to voice relay"
        );

        // Writer task: drains outbound frames; stops after Unsubscribe.
        let (out_tx, mut out_rx) = mpsc::channel::<RelayFrame>(self.capacity);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let last = matches!(frame, RelayFrame::Unsubscribe { .. });
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode relay frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "Relay write failed");
                    break;
                }
                if last {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        });

        // Reader task: inbound frames → session events.
        let (event_tx, event_rx) = mpsc::channel::<RelayEvent>(self.capacity);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay read failed");
                        break;
                    }
                };
                let frame = match serde_json::from_str::<RelayFrame>(text.as_str()) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping malformed relay frame");
                        continue;
                    }
                };
                if let RelayFrame::Error { code, message } = &frame {
                    tracing::warn!(code, message = %message, "Relay reported an error");
                    continue;
                }
                if let Some(event) = frame.into_event() {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(channel = %channel_id, "Relay reader stopped");
        });

        *self.outbound.lock().unwrap_or_else(|p| p.into_inner()) = Some(Outbound {
            channel_id,
            tx: out_tx.clone(),
        });

        let outbound = self.outbound.clone();
        Ok(RelaySubscription::new(channel_id, event_rx, move || {
            reader.abort();
            {
                let mut slot = outbound.lock().unwrap_or_else(|p| p.into_inner());
                if slot.as_ref().is_some_and(|o| o.channel_id == channel_id) {
                    *slot = None;
                }
            }
            if out_tx.try_send(RelayFrame::Unsubscribe { channel_id }).is_err() {
                writer.abort();
            }
        }))
    }

    async fn send(&self, target: UserId, message: SignalingMessage) -> Result<(), RelayError> {
        if message.to_peer != target {
            return Err(RelayError::UnknownPeer(target));
        }
        let tx = self.sender_for(message.channel_id)?;
        tx.send(RelayFrame::Signal(message))
            .await
            .map_err(|_| RelayError::NotConnected)
    }
}
