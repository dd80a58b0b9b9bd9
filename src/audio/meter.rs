// src/audio/meter.rs
// Level snapshots published by the callback and the UI-side ballistics that smooth them

pub const MAX_METER_CHANNELS: usize = 8;

/// Peak and RMS of one callback buffer, per channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterSnapshot {
    pub channels: usize,
    pub peak: [f32; MAX_METER_CHANNELS],
    pub rms: [f32; MAX_METER_CHANNELS],
    pub clipped: bool,
    /// Frames measured
    pub frames: usize,
}

impl MeterSnapshot {
    /// Measure an interleaved buffer. Channels past `MAX_METER_CHANNELS` are ignored.
    pub fn from_interleaved(samples: &[f32], channels: usize) -> Self {
        let mut snapshot = Self::default();
        if channels == 0 {
            return snapshot;
        }
        let metered = channels.min(MAX_METER_CHANNELS);
        let frames = samples.len() / channels;
        snapshot.channels = metered;
        snapshot.frames = frames;
        if frames == 0 {
            return snapshot;
        }

        let mut sums = [0.0f32; MAX_METER_CHANNELS];
        for frame in samples.chunks_exact(channels) {
            for (ch, &sample) in frame.iter().take(metered).enumerate() {
                let level = sample.abs();
                if level > snapshot.peak[ch] {
                    snapshot.peak[ch] = level;
                }
                sums[ch] += sample * sample;
            }
        }
        for ch in 0..metered {
            snapshot.rms[ch] = (sums[ch] / frames as f32).sqrt();
            if snapshot.peak[ch] >= 1.0 {
                snapshot.clipped = true;
            }
        }
        snapshot
    }

    /// Loudest peak across channels
    pub fn max_peak(&self) -> f32 {
        self.peak[..self.channels].iter().copied().fold(0.0, f32::max)
    }
}

/// Convert linear level to dBFS, floored at -96
pub fn to_db(level: f32) -> f32 {
    if level <= 0.0 {
        -96.0
    } else {
        (20.0 * level.log10()).max(-96.0)
    }
}

pub fn from_db(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Display-rate smoothing of snapshots: instant attack, slow release,
/// peak hold and RMS averaging
#[derive(Debug, Clone, Default)]
pub struct MeterBallistics {
    peak: [f32; MAX_METER_CHANNELS],
    hold: [f32; MAX_METER_CHANNELS],
    hold_counter: [u32; MAX_METER_CHANNELS],
    rms: [f32; MAX_METER_CHANNELS],
    channels: usize,
    clipped: bool,
}

impl MeterBallistics {
    // ~0.5s at 60 updates per second
    const PEAK_HOLD_UPDATES: u32 = 30;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the latest snapshot (call once per display refresh)
    pub fn update(&mut self, snapshot: &MeterSnapshot) {
        self.channels = snapshot.channels;
        self.clipped |= snapshot.clipped;
        for ch in 0..snapshot.channels {
            let peak = snapshot.peak[ch];
            self.peak[ch] = if peak > self.peak[ch] {
                peak
            } else {
                self.peak[ch] * 0.95 + peak * 0.05
            };

            if peak > self.hold[ch] {
                self.hold[ch] = peak;
                self.hold_counter[ch] = Self::PEAK_HOLD_UPDATES;
            } else if self.hold_counter[ch] > 0 {
                self.hold_counter[ch] -= 1;
            } else {
                self.hold[ch] = self.peak[ch];
            }

            self.rms[ch] = self.rms[ch] * 0.8 + snapshot.rms[ch] * 0.2;
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn peak(&self, channel: usize) -> f32 {
        self.peak.get(channel).copied().unwrap_or(0.0)
    }

    pub fn peak_hold(&self, channel: usize) -> f32 {
        self.hold.get(channel).copied().unwrap_or(0.0)
    }

    pub fn rms(&self, channel: usize) -> f32 {
        self.rms.get(channel).copied().unwrap_or(0.0)
    }

    /// Latched until `reset`
    pub fn clipped(&self) -> bool {
        self.clipped
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
