//! # nexus-voice-probe
//!
//! Subscribes to one voice channel on the signaling relay and logs what
//! flows through it: membership snapshots and signaling records addressed
//! to the probe. Handy for checking a relay deployment without a client.

use clap::Parser;
use nexus_common::{ChannelId, UserId};
use nexus_voice_mesh::signaling::{PeerMediaState, RelayEvent, SignalKind};
use nexus_voice_mesh::{MemberInfo, SignalRelayClient, SignalingMessage, WsRelayClient};

#[derive(Debug, Parser)]
#[command(name = "nexus-voice-probe", version, about)]
struct Args {
    /// Voice channel to subscribe to.
    #[arg(long, env = "NEXUS_VOICE_PROBE_CHANNEL")]
    channel: ChannelId,

    /// Identity to subscribe as. A fresh id is generated if omitted.
    #[arg(long)]
    user: Option<UserId>,

    #[arg(long, default_value = "voice-probe")]
    name: String,

    /// Announce a muted state to every member that shows up.
    #[arg(long)]
    announce: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = nexus_common::config::init()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "nexus_voice_probe=debug,nexus_voice_mesh=debug".into());
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    let user = args.user.unwrap_or_default();
    let relay = WsRelayClient::new(&config.relay, user, &args.name);
    tracing::info!(
        url = %relay.url(),
        channel = %args.channel,
        user = %user,
        "Probing voice relay"
    );

    let mut subscription = relay.subscribe(args.channel).await?;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    tracing::warn!("Relay closed the subscription");
                    break;
                };
                match event {
                    RelayEvent::Members { channel_id, members } => {
                        tracing::info!(channel = %channel_id, count = members.len(), "Membership");
                        for member in &members {
                            tracing::info!(user = %member.user_id, name = %member.display_name, "  member");
                        }
                        if args.announce {
                            announce(&relay, args.channel, user, &members).await;
                        }
                    }
                    RelayEvent::Signal(msg) => {
                        tracing::info!(
                            from = %msg.from_peer,
                            kind = ?msg.kind,
                            bytes = msg.payload.len(),
                            "Signal"
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    Ok(())
}

async fn announce(
    relay: &WsRelayClient,
    channel_id: ChannelId,
    local: UserId,
    members: &[MemberInfo],
) {
    let state = PeerMediaState {
        muted: true,
        deafened: false,
    };
    let payload = match state.encode() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode media state");
            return;
        }
    };
    for member in members.iter().filter(|m| m.user_id != local) {
        let msg = SignalingMessage::new(SignalKind::State, channel_id, local, member.user_id, payload.clone());
        if let Err(e) = relay.send(member.user_id, msg).await {
            tracing::warn!(peer = %member.user_id, error = %e, "Announce failed");
        }
    }
}
