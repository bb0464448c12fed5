//! Speech activity detection.
//!
//! Each sample averages the frequency-magnitude bins of the stream, a moving
//! average over the last `window` samples is compared with a fixed threshold,
//! and only changes of the resulting speaking flag are reported.
//!
//! The sampler is a cooperative tokio task ticking on a timer, not a thread.
//! It never reads a released stream and never reports speaking for a
//! disabled (muted) track.

use crate::media::AudioStreamHandle;
use nexus_common::config::SpeechConfig;
use std::collections::VecDeque;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Edge-triggered energy detector.
#[derive(Debug, Clone)]
pub struct SpeechActivityDetector {
    threshold: f64,
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
    speaking: bool,
}

impl SpeechActivityDetector {
    pub fn new(threshold: f64, window: usize) -> Self {
        let window = window.max(1);
        Self {
            threshold,
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
            speaking: false,
        }
    }

    pub fn from_config(config: &SpeechConfig) -> Self {
        Self::new(config.threshold, config.window)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one sample of frequency levels. Returns `Some(speaking)` only when
    /// the speaking flag changes.
    ///
    /// A muted sample resets the average and forces not-speaking.
    pub fn observe(&mut self, levels: &[u8], muted: bool) -> Option<bool> {
        if muted {
            self.samples.clear();
            self.sum = 0.0;
            return self.transition(false);
        }

        let energy = if levels.is_empty() {
            0.0
        } else {
            levels.iter().map(|&v| f64::from(v)).sum::<f64>() / levels.len() as f64
        };

        self.samples.push_back(energy);
        self.sum += energy;
        if self.samples.len() > self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }

        let average = self.sum / self.samples.len() as f64;
        self.transition(average > self.threshold)
    }

    fn transition(&mut self, speaking: bool) -> Option<bool> {
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }
}

/// A running sampler. Dropping it stops sampling.
pub struct SpeechMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SpeechMonitor {
    /// Start sampling `stream`. `on_edge` receives every speaking edge and
    /// returns `false` to stop the sampler (e.g. the session went away).
    ///
    /// With `gate_on_enabled`, a disabled track is treated as muted.
    pub fn spawn<F>(
        stream: AudioStreamHandle,
        config: &SpeechConfig,
        gate_on_enabled: bool,
        mut on_edge: F,
    ) -> Self
    where
        F: FnMut(bool) -> bool + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut detector = SpeechActivityDetector::from_config(config);
        let mut bins = vec![0u8; config.bins.max(1)];
        let period = config.sample_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let muted = gate_on_enabled && !stream.is_enabled();
                if !muted && !stream.read_frequency_data(&mut bins) {
                    break;
                }
                if !stream.is_live() {
                    break;
                }

                if let Some(speaking) = detector.observe(&bins, muted) {
                    if !on_edge(speaking) {
                        break;
                    }
                }
            }
            tracing::trace!(stream = %stream.id(), "Speech sampler stopped");
        });

        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SpeechMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
