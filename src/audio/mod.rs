pub mod backend;
pub mod callback;
pub mod cpal_backend;
pub mod cut_preview;
pub mod engine;
pub mod error;
pub mod fake_backend;
pub mod io;
pub mod listener;
pub mod message_buffer;
pub mod meter;
pub mod mixer;
pub mod options;
pub mod recording;
pub mod ring_buffer;
pub mod schedule;
pub mod state;
pub mod time_queue;
pub mod track;
pub mod worker;

pub use backend::{AudioBackend, CallbackStatus, DeviceFormat, DeviceRequest};
pub use cpal_backend::CpalBackend;
pub use cut_preview::CutPreviewPlaybackPolicy;
pub use engine::{AudioEngine, StreamToken};
pub use error::{EngineError, EngineResult, StorageError};
pub use fake_backend::{FakeBackend, FakeDriver, fake_backend};
pub use io::{export_track, import_wav};
pub use listener::{AudioIoListener, ChannelListener};
pub use message_buffer::MessageBuffer;
pub use meter::{MeterBallistics, MeterSnapshot};
pub use options::{OwnerId, StreamOptions};
pub use recording::{
    FixedLatencyCorrection, LatencyCalibration, LostCaptureInterval, ReportedLatencyCorrection,
};
pub use schedule::{DefaultPlaybackPolicy, PlaybackPolicy, PlaybackSchedule, PlaybackSlice};
pub use state::StreamStats;
pub use track::{
    CaptureTrack, MemoryTrack, PlayableTrack, RecordableTrack, SampleFormat, TransportTracks,
};

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames per driver period
    pub buffer_size: usize,
    pub output_channels: usize,
    /// Seconds of audio each playback ring holds
    pub playback_ring_secs: f64,
    pub capture_ring_secs: f64,
    /// Frames per time queue record
    pub time_queue_grain: usize,
    /// Refill playback rings only once this much is free
    pub min_fill_secs: f64,
    /// Drain capture rings only once this much is buffered
    pub min_capture_secs: f64,
    pub worker_sleep_ms: u64,
    /// Applied to recordings when the stream has no calibration of its own
    pub latency_correction_ms: f64,
    pub max_dropout_intervals: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 512,
            output_channels: 2,
            playback_ring_secs: 4.0,
            capture_ring_secs: 4.0,
            time_queue_grain: 2000,
            min_fill_secs: 0.1,
            min_capture_secs: 0.1,
            worker_sleep_ms: 10,
            latency_correction_ms: 0.0,
            max_dropout_intervals: 1024,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    Rate(u32),
    RecordingStarted,
    RecordingStopped,
    /// Number of capture tracks that received samples
    NewBlocks(usize),
    RecordingCommitted,
    SoundActivation(bool),
    CaptureDropouts(Vec<LostCaptureInterval>),
    StorageFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_toml() {
        let config = AudioConfig::from_toml(
            r#"
            sample_rate = 48000
            buffer_size = 256
            latency_correction_ms = -130.0
            input_device = "USB Audio"
            "#,
        )
        .unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.buffer_size, 256);
        assert_eq!(config.latency_correction_ms, -130.0);
        assert_eq!(config.input_device.as_deref(), Some("USB Audio"));
        // unspecified fields keep their defaults
        assert_eq!(config.time_queue_grain, 2000);
        assert_eq!(config.output_channels, 2);
    }

    #[test]
    fn test_config_rejects_bad_types() {
        assert!(AudioConfig::from_toml("sample_rate = \"fast\"").is_err());
    }
}
