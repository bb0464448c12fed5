//! Audio stream ownership.
//!
//! An [`AudioStream`] is the owning side of a track: only its holder may
//! enable/disable or stop it. Everyone else gets an [`AudioStreamHandle`],
//! a cheap read-only view that can report the track state and read the
//! current frequency levels until the stream is released.
//!
//! For the local microphone the enabled flag is "capture on" (cleared by
//! mute); for a remote stream it is "playback on" (cleared by deafen).

use crate::error::MediaError;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Source of frequency-domain levels for a live track, e.g. an FFT analyser
/// sitting on the capture or playback pipeline.
pub trait AudioAnalyser: Send + Sync {
    /// Fill `bins` with the current magnitude per frequency bin (0-255).
    fn frequency_data(&self, bins: &mut [u8]);
}

/// Capture backend: opens the local microphone.
///
/// May wait on a permission prompt for an unbounded time; callers race it
/// against cancellation.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    async fn open_microphone(&self) -> Result<AudioStream, MediaError>;
}

struct Track {
    id: Uuid,
    enabled: AtomicBool,
    live: AtomicBool,
    analyser: Option<Arc<dyn AudioAnalyser>>,
}

/// Owning side of an audio track. Not `Clone`.
pub struct AudioStream {
    track: Arc<Track>,
}

impl AudioStream {
    pub fn new(analyser: Option<Arc<dyn AudioAnalyser>>) -> Self {
        Self {
            track: Arc::new(Track {
                id: Uuid::new_v4(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                analyser,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.track.id
    }

    pub fn handle(&self) -> AudioStreamHandle {
        AudioStreamHandle {
            track: self.track.clone(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.track.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.track.enabled.load(Ordering::SeqCst)
    }

    /// Release the track. Handles stop reading levels immediately.
    pub fn stop(&self) {
        if self.track.live.swap(false, Ordering::SeqCst) {
            tracing::debug!(track = %self.track.id, "Audio track stopped");
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("id", &self.track.id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Read-only view of an [`AudioStream`].
#[derive(Clone)]
pub struct AudioStreamHandle {
    track: Arc<Track>,
}

impl AudioStreamHandle {
    pub fn id(&self) -> Uuid {
        self.track.id
    }

    pub fn is_enabled(&self) -> bool {
        self.track.enabled.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.track.live.load(Ordering::SeqCst)
    }

    /// Read current levels into `bins`. Returns `false` without touching the
    /// analyser once the stream has been released.
    pub fn read_frequency_data(&self, bins: &mut [u8]) -> bool {
        if !self.is_live() {
            return false;
        }
        match &self.track.analyser {
            Some(analyser) => analyser.frequency_data(bins),
            None => bins.fill(0),
        }
        true
    }
}

impl PartialEq for AudioStreamHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl fmt::Debug for AudioStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStreamHandle")
            .field("id", &self.track.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingAnalyser(AtomicUsize);

    impl AudioAnalyser for CountingAnalyser {
        fn frequency_data(&self, bins: &mut [u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
            bins.fill(200);
        }
    }

    #[test]
    fn handle_tracks_owner_state() {
        let stream = AudioStream::new(None);
        let handle = stream.handle();

        assert!(handle.is_enabled());
        stream.set_enabled(false);
        assert!(!handle.is_enabled());
        assert_eq!(handle.id(), stream.id());
    }

    #[test]
    fn released_stream_is_never_read() {
        let analyser = Arc::new(CountingAnalyser(AtomicUsize::new(0)));
        let stream = AudioStream::new(Some(analyser.clone()));
        let handle = stream.handle();
        let mut bins = [0u8; 8];

        assert!(handle.read_frequency_data(&mut bins));
        assert_eq!(bins, [200; 8]);

        drop(stream);
        assert!(!handle.is_live());
        assert!(!handle.read_frequency_data(&mut bins));
        assert_eq!(analyser.0.load(Ordering::SeqCst), 1);
    }
}
