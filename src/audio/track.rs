// src/audio/track.rs
// Track interfaces consumed by the engine, plus an in-memory track used by the CLI and tests

use std::sync::{Arc, PoisonError, RwLock};

use super::error::StorageError;

/// Storage format of recorded samples. Captured audio is quantized to it before append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    #[default]
    Float32,
    Int16,
    Int24,
}

impl SampleFormat {
    pub fn bits(self) -> u16 {
        match self {
            SampleFormat::Float32 => 32,
            SampleFormat::Int16 => 16,
            SampleFormat::Int24 => 24,
        }
    }

    /// Round a sample to the nearest value representable in this format
    #[inline]
    pub fn quantize(self, sample: f32) -> f32 {
        match self {
            SampleFormat::Float32 => sample,
            SampleFormat::Int16 | SampleFormat::Int24 => {
                let max = (1i32 << (self.bits() - 1)) as f32;
                (sample.clamp(-1.0, 1.0) * max).round().min(max - 1.0) / max
            }
        }
    }
}

/// A source of samples the buffer exchange thread can render for playback
pub trait PlayableTrack: Send + Sync {
    fn name(&self) -> &str;
    fn rate(&self) -> f64;
    fn channels(&self) -> usize;
    /// Track time of the first frame
    fn start_time(&self) -> f64;
    fn end_time(&self) -> f64;
    fn gain(&self) -> f32 {
        1.0
    }
    /// Fill `out` with interleaved frames beginning at `first_frame` (relative
    /// to the track start). Frames outside the track read as silence.
    fn read_frames(&self, first_frame: i64, out: &mut [f32]);
}

/// Durable destination for captured audio
pub trait RecordableTrack: Send + Sync {
    fn name(&self) -> &str;
    fn rate(&self) -> f64;
    fn channels(&self) -> usize;
    fn sample_format(&self) -> SampleFormat {
        SampleFormat::Float32
    }
    fn append(&self, samples: &[f32]) -> Result<(), StorageError>;
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A track whose samples live in memory
#[derive(Debug)]
pub struct MemoryTrack {
    name: String,
    rate: f64,
    channels: usize,
    start_time: f64,
    gain: f32,
    format: SampleFormat,
    max_frames: Option<usize>,
    samples: RwLock<Vec<f32>>,
}

impl MemoryTrack {
    pub fn new(name: impl Into<String>, rate: f64, channels: usize) -> Self {
        Self::from_samples(name, rate, channels, Vec::new())
    }

    pub fn from_samples(
        name: impl Into<String>,
        rate: f64,
        channels: usize,
        samples: Vec<f32>,
    ) -> Self {
        Self {
            name: name.into(),
            rate,
            channels: channels.max(1),
            start_time: 0.0,
            gain: 1.0,
            format: SampleFormat::Float32,
            max_frames: None,
            samples: RwLock::new(samples),
        }
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_format(mut self, format: SampleFormat) -> Self {
        self.format = format;
        self
    }

    /// Refuse appends past this many frames
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn len_frames(&self) -> usize {
        self.samples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
            / self.channels
    }

    /// Copy of all interleaved samples
    pub fn samples(&self) -> Vec<f32> {
        self.samples
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl PlayableTrack for MemoryTrack {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn start_time(&self) -> f64 {
        self.start_time
    }

    fn end_time(&self) -> f64 {
        self.start_time + self.len_frames() as f64 / self.rate
    }

    fn gain(&self) -> f32 {
        self.gain
    }

    fn read_frames(&self, first_frame: i64, out: &mut [f32]) {
        out.fill(0.0);
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        let total = (samples.len() / self.channels) as i64;
        let wanted = (out.len() / self.channels) as i64;

        let begin = first_frame.max(0);
        let end = (first_frame + wanted).min(total);
        if begin >= end {
            return;
        }
        let dest = ((begin - first_frame) as usize) * self.channels;
        let src = begin as usize * self.channels;
        let len = (end - begin) as usize * self.channels;
        out[dest..dest + len].copy_from_slice(&samples[src..src + len]);
    }
}

impl RecordableTrack for MemoryTrack {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_format(&self) -> SampleFormat {
        self.format
    }

    fn append(&self, samples: &[f32]) -> Result<(), StorageError> {
        if samples.len() % self.channels != 0 {
            return Err(StorageError::ChannelMismatch {
                expected: self.channels,
                actual: samples.len() % self.channels,
            });
        }
        let mut data = self.samples.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(max) = self.max_frames
            && data.len() / self.channels + samples.len() / self.channels > max
        {
            return Err(StorageError::TrackFull(self.name.clone()));
        }
        data.extend_from_slice(samples);
        Ok(())
    }
}

/// A capture destination and where its channels come from on the input device
#[derive(Clone)]
pub struct CaptureTrack {
    pub target: Arc<dyn RecordableTrack>,
    pub first_input_channel: usize,
    /// Interleaved material at the track rate to blend into the start of the take
    pub crossfade: Option<Arc<[f32]>>,
}

impl CaptureTrack {
    pub fn new(target: Arc<dyn RecordableTrack>) -> Self {
        Self {
            target,
            first_input_channel: 0,
            crossfade: None,
        }
    }

    pub fn from_channel(mut self, first_input_channel: usize) -> Self {
        self.first_input_channel = first_input_channel;
        self
    }

    pub fn with_crossfade(mut self, crossfade: Vec<f32>) -> Self {
        self.crossfade = Some(crossfade.into());
        self
    }

    /// Input channels needed to feed this track
    pub fn input_channels_needed(&self) -> usize {
        self.first_input_channel + self.target.channels()
    }
}

/// Everything one stream plays and records. Read-only once the stream starts.
#[derive(Clone, Default)]
pub struct TransportTracks {
    pub playback: Vec<Arc<dyn PlayableTrack>>,
    pub capture: Vec<CaptureTrack>,
    /// Mixed into the output but not part of the recorded take
    pub other_playable: Vec<Arc<dyn PlayableTrack>>,
    /// Audible only before the nominal recording start
    pub preroll: Vec<Arc<dyn PlayableTrack>>,
}

impl TransportTracks {
    pub fn playback(tracks: Vec<Arc<dyn PlayableTrack>>) -> Self {
        Self {
            playback: tracks,
            ..Self::default()
        }
    }

    pub fn capture(tracks: Vec<CaptureTrack>) -> Self {
        Self {
            capture: tracks,
            ..Self::default()
        }
    }

    pub fn has_playback(&self) -> bool {
        !(self.playback.is_empty() && self.other_playable.is_empty() && self.preroll.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_playback() && self.capture.is_empty()
    }

    pub fn input_channels_needed(&self) -> usize {
        self.capture
            .iter()
            .map(CaptureTrack::input_channels_needed)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frames_clips_to_track() {
        let track = MemoryTrack::from_samples("t", 100.0, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let mut out = vec![9.0; 8];
        track.read_frames(-1, &mut out);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);

        track.read_frames(5, &mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_append_and_limits() {
        let track = MemoryTrack::new("rec", 48000.0, 2).with_max_frames(3);
        track.append(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(track.len_frames(), 2);
        assert_eq!(PlayableTrack::end_time(&track), 2.0 / 48000.0);

        assert!(matches!(
            track.append(&[0.5]),
            Err(StorageError::ChannelMismatch { .. })
        ));
        assert_eq!(
            track.append(&[0.0; 4]),
            Err(StorageError::TrackFull("rec".into()))
        );
    }

    #[test]
    fn test_quantize() {
        assert_eq!(SampleFormat::Float32.quantize(0.123), 0.123);
        assert_eq!(SampleFormat::Int16.quantize(1.5), 32767.0 / 32768.0);
        assert_eq!(SampleFormat::Int16.quantize(-1.0), -1.0);
        let q = SampleFormat::Int16.quantize(0.3);
        assert!((q - 0.3).abs() <= 0.5 / 32768.0);
        assert_eq!((q * 32768.0).fract(), 0.0);
    }

    #[test]
    fn test_transport_channel_needs() {
        let stereo: Arc<dyn RecordableTrack> = Arc::new(MemoryTrack::new("a", 44100.0, 2));
        let mono: Arc<dyn RecordableTrack> = Arc::new(MemoryTrack::new("b", 44100.0, 1));
        let tracks = TransportTracks::capture(vec![
            CaptureTrack::new(stereo),
            CaptureTrack::new(mono).from_channel(3),
        ]);
        assert_eq!(tracks.input_channels_needed(), 4);
        assert!(!tracks.has_playback());
        assert!(!tracks.is_empty());
    }
}
