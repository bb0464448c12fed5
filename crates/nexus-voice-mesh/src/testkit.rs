//! In-process fakes for the media, transport and relay seams.

use crate::error::{MediaError, RelayError, TransportError};
use crate::media::{AudioAnalyser, AudioStream, AudioStreamHandle, MediaDevices};
use crate::mesh::MeshEvent;
use crate::relay::{RelaySubscription, SignalRelayClient};
use crate::signaling::{IceCandidate, RelayEvent, SignalKind, SignalingMessage};
use crate::transport::{PeerConnection, PeerEventSink, SdpKind, TransportFactory};
use async_trait::async_trait;
use nexus_common::config::IceServerConfig;
use nexus_common::{ChannelId, UserId};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Route `tracing` output through the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic identity; ordering follows `n`.
pub fn user(n: u128) -> UserId {
    UserId(Uuid::from_u128(n))
}

pub fn sink(peer: UserId) -> (PeerEventSink, mpsc::UnboundedReceiver<MeshEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeerEventSink::new(peer, Uuid::new_v4(), tx), rx)
}

// ── media ────────────────────────────────────────────────────────────────────

pub struct Level(AtomicU8);

impl Level {
    pub fn set(&self, level: u8) {
        self.0.store(level, Ordering::SeqCst);
    }
}

impl AudioAnalyser for Level {
    fn frequency_data(&self, bins: &mut [u8]) {
        bins.fill(self.0.load(Ordering::SeqCst));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaMode {
    Grant,
    Deny,
    /// Never resolves, like an unanswered permission prompt.
    Hang,
}

pub struct FakeMedia {
    mode: MediaMode,
    pub level: Arc<Level>,
    opened: AtomicUsize,
}

impl FakeMedia {
    pub fn new(mode: MediaMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            level: Arc::new(Level(AtomicU8::new(0))),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn open_microphone(&self) -> Result<AudioStream, MediaError> {
        match self.mode {
            MediaMode::Grant => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(AudioStream::new(Some(self.level.clone())))
            }
            MediaMode::Deny => Err(MediaError::PermissionDenied),
            MediaMode::Hang => std::future::pending().await,
        }
    }
}

// ── transport ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct ConnLog {
    pub tracks: usize,
    pub offers: usize,
    pub answers: usize,
    pub rollbacks: usize,
    pub remote: Vec<(SdpKind, String)>,
    pub candidates: Vec<String>,
    /// For each applied candidate, whether a remote description was set first.
    pub candidate_seen_remote: Vec<bool>,
    pub closed: bool,
}

/// A connection created by [`FakeTransport`]: its call log and its event sink.
#[derive(Clone)]
pub struct ConnRecord {
    pub peer: UserId,
    pub events: PeerEventSink,
    log: Arc<Mutex<ConnLog>>,
}

impl ConnRecord {
    pub fn log(&self) -> ConnLog {
        self.log.lock().unwrap().clone()
    }

    pub fn link_id(&self) -> Uuid {
        self.events.link_id()
    }
}

#[derive(Default)]
pub struct FakeTransport {
    records: Mutex<Vec<ConnRecord>>,
    fail_offers: Arc<AtomicBool>,
    fail_create: AtomicBool,
}

impl FakeTransport {
    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// The most recent connection created for `peer`.
    pub fn latest(&self, peer: UserId) -> Option<ConnRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.peer == peer)
            .cloned()
    }

    pub fn created_for(&self, peer: UserId) -> usize {
        self.records.lock().unwrap().iter().filter(|r| r.peer == peer).count()
    }

    pub fn created(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl TransportFactory for FakeTransport {
    fn create(
        &self,
        peer: UserId,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let log = Arc::new(Mutex::new(ConnLog::default()));
        self.records.lock().unwrap().push(ConnRecord {
            peer,
            events,
            log: log.clone(),
        });
        Ok(Box::new(FakeConnection {
            log,
            fail_offers: self.fail_offers.clone(),
            tracks: Vec::new(),
        }))
    }
}

struct FakeConnection {
    log: Arc<Mutex<ConnLog>>,
    fail_offers: Arc<AtomicBool>,
    tracks: Vec<AudioStreamHandle>,
}

#[async_trait]
impl PeerConnection for FakeConnection {
    fn add_track(&mut self, track: AudioStreamHandle) -> Result<(), TransportError> {
        self.tracks.push(track);
        self.log.lock().unwrap().tracks += 1;
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String, TransportError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(TransportError::Sdp("offer rejected".into()));
        }
        let mut log = self.log.lock().unwrap();
        log.offers += 1;
        Ok(format!("offer-{}", log.offers))
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        let mut log = self.log.lock().unwrap();
        log.answers += 1;
        Ok(format!("answer-{}", log.answers))
    }

    async fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        self.log.lock().unwrap().remote.push((kind, sdp.to_string()));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransportError> {
        self.log.lock().unwrap().rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        let seen_remote = !log.remote.is_empty();
        log.candidates.push(candidate.as_str().to_string());
        log.candidate_seen_remote.push(seen_remote);
        Ok(())
    }

    fn close(&mut self) {
        self.tracks.clear();
        self.log.lock().unwrap().closed = true;
    }
}

// ── relay ────────────────────────────────────────────────────────────────────

/// Relay that records outbound messages and lets the test inject events.
pub struct FakeRelay {
    local: UserId,
    fail: AtomicBool,
    open: Arc<AtomicUsize>,
    inbound: Mutex<Option<mpsc::Sender<RelayEvent>>>,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl FakeRelay {
    pub fn new(local: UserId) -> Arc<Self> {
        Arc::new(Self {
            local,
            fail: AtomicBool::new(false),
            open: Arc::new(AtomicUsize::new(0)),
            inbound: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn open_subscriptions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, peer: UserId, kind: SignalKind) -> Vec<SignalingMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.to_peer == peer && m.kind == kind)
            .collect()
    }

    pub async fn inject(&self, event: RelayEvent) {
        let tx = self.inbound.lock().unwrap().clone().expect("no open subscription");
        tx.send(event).await.expect("subscription closed");
    }
}

#[async_trait]
impl SignalRelayClient for FakeRelay {
    fn local_id(&self) -> UserId {
        self.local
    }

    async fn subscribe(&self, channel_id: ChannelId) -> Result<RelaySubscription, RelayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::Timeout);
        }
        let (tx, rx) = mpsc::channel(64);
        *self.inbound.lock().unwrap() = Some(tx);
        self.open.fetch_add(1, Ordering::SeqCst);
        let open = self.open.clone();
        Ok(RelaySubscription::new(channel_id, rx, move || {
            open.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    async fn send(&self, _target: UserId, message: SignalingMessage) -> Result<(), RelayError> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}
