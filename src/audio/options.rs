// src/audio/options.rs
// Per-stream configuration handed to start_stream

use std::fmt;
use std::sync::Arc;

use super::listener::AudioIoListener;
use super::message_buffer::MessageBuffer;
use super::meter::MeterSnapshot;
use super::recording::LatencyCalibration;
use super::schedule::{DefaultPlaybackPolicy, PlaybackPolicy};

/// Identifies who started a stream. Starting again with the same owner
/// replaces the running stream; another owner is refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

/// Builds the playback policy for a stream
pub type PolicyFactory = Arc<dyn Fn(&StreamOptions) -> Box<dyn PlaybackPolicy> + Send + Sync>;

#[derive(Clone)]
pub struct StreamOptions {
    pub owner: OwnerId,
    /// Requested device rate; 0 uses the engine's configured rate
    pub rate: u32,
    /// Begin playback here instead of at t0
    pub start_time: Option<f64>,
    pub loop_enabled: bool,
    /// Speed may be changed while playing
    pub variable_speed: bool,
    pub play_speed: f64,
    pub policy_factory: Option<PolicyFactory>,
    pub capture_meter: Option<Arc<MessageBuffer<MeterSnapshot>>>,
    pub playback_meter: Option<Arc<MessageBuffer<MeterSnapshot>>>,
    pub listener: Option<Arc<dyn AudioIoListener>>,
    /// Seconds of material played before t0 while recording
    pub pre_roll: f64,
    /// dBFS; input crossing it is reported to the listener
    pub sound_activation_level: Option<f32>,
    /// Overrides the engine's configured latency correction
    pub latency: Option<Arc<dyn LatencyCalibration>>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            owner: OwnerId::default(),
            rate: 0,
            start_time: None,
            loop_enabled: false,
            variable_speed: false,
            play_speed: 1.0,
            policy_factory: None,
            capture_meter: None,
            playback_meter: None,
            listener: None,
            pre_roll: 0.0,
            sound_activation_level: None,
            latency: None,
        }
    }
}

impl StreamOptions {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn looped(mut self, loop_enabled: bool) -> Self {
        self.loop_enabled = loop_enabled;
        self
    }

    pub fn with_speed(mut self, play_speed: f64, variable: bool) -> Self {
        self.play_speed = play_speed;
        self.variable_speed = variable;
        self
    }

    pub fn with_policy(
        mut self,
        factory: impl Fn(&StreamOptions) -> Box<dyn PlaybackPolicy> + Send + Sync + 'static,
    ) -> Self {
        self.policy_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_capture_meter(mut self, meter: Arc<MessageBuffer<MeterSnapshot>>) -> Self {
        self.capture_meter = Some(meter);
        self
    }

    pub fn with_playback_meter(mut self, meter: Arc<MessageBuffer<MeterSnapshot>>) -> Self {
        self.playback_meter = Some(meter);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn AudioIoListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_pre_roll(mut self, pre_roll: f64) -> Self {
        self.pre_roll = pre_roll;
        self
    }

    pub fn with_sound_activation(mut self, level_db: f32) -> Self {
        self.sound_activation_level = Some(level_db);
        self
    }

    pub fn with_latency(mut self, latency: Arc<dyn LatencyCalibration>) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The policy for this stream: the factory's, else play once or loop
    pub fn policy(&self) -> Box<dyn PlaybackPolicy> {
        match &self.policy_factory {
            Some(factory) => factory(self),
            None => Box::new(DefaultPlaybackPolicy::new(
                self.loop_enabled,
                self.variable_speed,
            )),
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("owner", &self.owner)
            .field("rate", &self.rate)
            .field("start_time", &self.start_time)
            .field("loop_enabled", &self.loop_enabled)
            .field("variable_speed", &self.variable_speed)
            .field("play_speed", &self.play_speed)
            .field("custom_policy", &self.policy_factory.is_some())
            .field("pre_roll", &self.pre_roll)
            .field("sound_activation_level", &self.sound_activation_level)
            .finish_non_exhaustive()
    }
}
