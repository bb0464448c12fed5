//! Voice client configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > voice.toml > defaults

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<VoiceConfig> = OnceLock::new();

const DEFAULT_RELAY_URL: &str = "ws://localhost:8082/voice/relay";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_SPEECH_THRESHOLD: f64 = 12.0;
const DEFAULT_SPEECH_WINDOW: usize = 4;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 50;
const DEFAULT_SPEECH_BINS: usize = 128;
const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;
const MIN_SAMPLE_INTERVAL_MS: u64 = 1;

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup. Later calls return the
/// configuration loaded by the first one.
pub fn init() -> Result<&'static VoiceConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = load(
        // Environment variables (NEXUS_VOICE__RELAY__URL, NEXUS_VOICE__MESH__RECONNECT_ATTEMPTS, etc.)
        config::Environment::with_prefix("NEXUS_VOICE")
            .separator("__")
            .try_parsing(true),
    )?;
    Ok(CONFIG.get_or_init(|| cfg))
}

/// Build a configuration from defaults, the optional `voice.toml` and the given
/// environment source.
pub fn load(env: config::Environment) -> Result<VoiceConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("relay.url", DEFAULT_RELAY_URL)?
        .set_default("relay.connect_timeout_ms", DEFAULT_CONNECT_TIMEOUT_MS as i64)?
        .set_default("relay.channel_capacity", DEFAULT_CHANNEL_CAPACITY as i64)?
        .set_default("speech.threshold", DEFAULT_SPEECH_THRESHOLD)?
        .set_default("speech.window", DEFAULT_SPEECH_WINDOW as i64)?
        .set_default("speech.sample_interval_ms", DEFAULT_SAMPLE_INTERVAL_MS as i64)?
        .set_default("speech.bins", DEFAULT_SPEECH_BINS as i64)?
        .set_default("mesh.negotiation_timeout_ms", DEFAULT_NEGOTIATION_TIMEOUT_MS as i64)?
        .set_default("mesh.reconnect_attempts", DEFAULT_RECONNECT_ATTEMPTS as i64)?
        .set_default("mesh.reconnect_delay_ms", DEFAULT_RECONNECT_DELAY_MS as i64)?
        // Optional config file
        .add_source(config::File::with_name("voice").required(false))
        .add_source(env)
        .build()?;

    cfg.try_deserialize()
}

/// Load with an explicit map standing in for the process environment.
pub fn load_with_env(vars: HashMap<String, String>) -> Result<VoiceConfig, config::ConfigError> {
    load(
        config::Environment::with_prefix("NEXUS_VOICE")
            .separator("__")
            .try_parsing(true)
            .source(Some(vars)),
    )
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    pub relay: RelayConfig,
    pub speech: SpeechConfig,
    pub mesh: MeshConfig,
    /// STUN/TURN servers handed to every new peer connection.
    #[serde(default = "IceServerConfig::defaults")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig {
                url: DEFAULT_RELAY_URL.to_string(),
                connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            },
            speech: SpeechConfig {
                threshold: DEFAULT_SPEECH_THRESHOLD,
                window: DEFAULT_SPEECH_WINDOW,
                sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
                bins: DEFAULT_SPEECH_BINS,
            },
            mesh: MeshConfig {
                negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
                reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
                reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            },
            ice_servers: IceServerConfig::defaults(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the signaling relay.
    pub url: String,
    pub connect_timeout_ms: u64,
    /// Buffer size of the inbound/outbound relay queues.
    pub channel_capacity: usize,
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpeechConfig {
    /// Average frequency magnitude (0-255 scale) above which a sample counts as speech.
    pub threshold: f64,
    /// Number of samples in the moving average.
    pub window: usize,
    pub sample_interval_ms: u64,
    /// Number of frequency bins read per sample.
    pub bins: usize,
}

impl SpeechConfig {
    /// Sampling period, never zero.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(MIN_SAMPLE_INTERVAL_MS))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MeshConfig {
    /// A link that is not `Stable` after this long is failed.
    pub negotiation_timeout_ms: u64,
    /// Retries per peer after a link failure (0 disables reconnection).
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl MeshConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// ICE server configuration (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    /// In production, add TURN servers for NAT traversal.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun1.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun.cloudflare.com:3478".into()],
                username: None,
                credential: None,
            },
        ]
    }
}
