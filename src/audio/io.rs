// src/audio/io.rs
// WAV import/export for in-memory tracks and conversion of captured audio to a track's format

use anyhow::{Result, anyhow};
use hound::{WavReader, WavSpec, WavWriter};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;

use super::track::{MemoryTrack, RecordableTrack, SampleFormat};

/// Load a WAV file into a track at the file's own rate and channel count
pub fn import_wav<P: AsRef<Path>>(path: P) -> Result<MemoryTrack> {
    let path = path.as_ref();
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    let (samples, format) = match spec.sample_format {
        hound::SampleFormat::Float => (
            reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            SampleFormat::Float32,
        ),
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            let samples = reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let format = if spec.bits_per_sample > 16 {
                SampleFormat::Int24
            } else {
                SampleFormat::Int16
            };
            (samples, format)
        }
    };

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("imported")
        .to_string();
    tracing::debug!(
        "Imported {}: {}Hz, {}ch, {} samples",
        path.display(),
        spec.sample_rate,
        spec.channels,
        samples.len()
    );

    Ok(
        MemoryTrack::from_samples(name, spec.sample_rate as f64, spec.channels as usize, samples)
            .with_format(format),
    )
}

/// Write a track's samples as a WAV file in the track's sample format
pub fn export_track<P: AsRef<Path>>(path: P, track: &MemoryTrack) -> Result<()> {
    let rate = RecordableTrack::rate(track);
    if rate <= 0.0 || rate.fract() != 0.0 || rate > u32::MAX as f64 {
        return Err(anyhow!("Cannot export track at {rate}Hz"));
    }
    let format = track.sample_format();
    let spec = WavSpec {
        channels: RecordableTrack::channels(track) as u16,
        sample_rate: rate as u32,
        bits_per_sample: format.bits(),
        sample_format: match format {
            SampleFormat::Float32 => hound::SampleFormat::Float,
            SampleFormat::Int16 | SampleFormat::Int24 => hound::SampleFormat::Int,
        },
    };

    let mut writer = WavWriter::create(&path, spec)?;
    let samples = track.samples();
    match format {
        SampleFormat::Float32 => {
            for &sample in &samples {
                writer.write_sample(sample)?;
            }
        }
        SampleFormat::Int16 | SampleFormat::Int24 => {
            let max = (1i32 << (format.bits() - 1)) as f32;
            for &sample in &samples {
                let value = (sample.clamp(-1.0, 1.0) * max).round().min(max - 1.0) as i32;
                writer.write_sample(value)?;
            }
        }
    }
    writer.finalize()?;
    Ok(())
}

const CONVERTER_CHUNK: usize = 1024;

struct ResampleState {
    resampler: SincFixedIn<f32>,
    ratio: f64,
    // deinterleaved input waiting for a full chunk
    pending: Vec<Vec<f32>>,
    // leading output frames still to drop
    delay: usize,
    frames_in: u64,
    frames_out: u64,
}

/// Converts captured device audio to a capture track's rate and sample format.
/// Owned by the buffer exchange thread.
pub struct CaptureConverter {
    channels: usize,
    format: SampleFormat,
    resample: Option<ResampleState>,
}

impl CaptureConverter {
    pub fn new(
        input_rate: f64,
        output_rate: f64,
        channels: usize,
        format: SampleFormat,
    ) -> Result<Self> {
        let channels = channels.max(1);
        if input_rate <= 0.0 || output_rate <= 0.0 {
            return Err(anyhow!(
                "Invalid conversion {input_rate}Hz -> {output_rate}Hz"
            ));
        }

        let resample = if (input_rate - output_rate).abs() < 1e-9 {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = output_rate / input_rate;
            let resampler =
                SincFixedIn::<f32>::new(ratio, 1.0, params, CONVERTER_CHUNK, channels)?;
            let delay = resampler.output_delay();
            Some(ResampleState {
                resampler,
                ratio,
                pending: vec![Vec::with_capacity(CONVERTER_CHUNK * 2); channels],
                delay,
                frames_in: 0,
                frames_out: 0,
            })
        };

        Ok(Self {
            channels,
            format,
            resample,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_resampling(&self) -> bool {
        self.resample.is_some()
    }

    /// Convert interleaved input and append the result to `out`.
    /// A resampler holds back input until it has a full chunk.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let channels = self.channels;
        let format = self.format;
        let Some(state) = self.resample.as_mut() else {
            out.extend(input.iter().map(|&s| format.quantize(s)));
            return Ok(());
        };

        for frame in input.chunks_exact(channels) {
            for (pending, &sample) in state.pending.iter_mut().zip(frame) {
                pending.push(sample);
            }
        }
        state.frames_in += (input.len() / channels) as u64;

        loop {
            let needed = state.resampler.input_frames_next();
            if state.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = state
                .pending
                .iter_mut()
                .map(|p| p.drain(..needed).collect())
                .collect();
            let converted = state.resampler.process(&chunk, None)?;
            Self::emit(state, &converted, format, out, None);
        }
        Ok(())
    }

    /// Push out whatever the resampler still holds, ending at the exact
    /// converted length of all input seen
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let format = self.format;
        let Some(state) = self.resample.as_mut() else {
            return Ok(());
        };

        let expected = (state.frames_in as f64 * state.ratio).round() as u64;
        if !state.pending[0].is_empty() {
            let rest = std::mem::take(&mut state.pending);
            let converted = state.resampler.process_partial(Some(rest.as_slice()), None)?;
            state.pending = vec![Vec::new(); rest.len()];
            Self::emit(state, &converted, format, out, Some(expected));
        }
        // the delay line still holds the tail
        for _ in 0..8 {
            if state.frames_out >= expected {
                break;
            }
            let converted = state.resampler.process_partial(None::<&[Vec<f32>]>, None)?;
            Self::emit(state, &converted, format, out, Some(expected));
        }
        Ok(())
    }

    fn emit(
        state: &mut ResampleState,
        converted: &[Vec<f32>],
        format: SampleFormat,
        out: &mut Vec<f32>,
        limit: Option<u64>,
    ) {
        let frames = converted.first().map_or(0, Vec::len);
        let skip = state.delay.min(frames);
        state.delay -= skip;

        let mut end = frames;
        if let Some(limit) = limit {
            let room = limit.saturating_sub(state.frames_out) as usize;
            end = end.min(skip + room);
        }
        for i in skip..end {
            for channel in converted {
                out.push(format.quantize(channel[i]));
            }
        }
        state.frames_out += (end.saturating_sub(skip)) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::PlayableTrack;
    use std::fs;

    #[test]
    fn test_wav_roundtrip() {
        let original = vec![0.1, -0.2, 0.3, -0.4, 0.5, 0.25];
        let track = MemoryTrack::from_samples("take", 44100.0, 2, original.clone());

        let path = std::env::temp_dir().join("trackio_roundtrip.wav");
        export_track(&path, &track).unwrap();
        let imported = import_wav(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(PlayableTrack::channels(&imported), 2);
        assert_eq!(PlayableTrack::rate(&imported), 44100.0);
        assert_eq!(imported.len_frames(), 3);
        for (orig, imp) in original.iter().zip(imported.samples()) {
            assert!((orig - imp).abs() < 0.001);
        }
    }

    #[test]
    fn test_int16_export() {
        let track = MemoryTrack::from_samples("take", 8000.0, 1, vec![0.5, -1.0, 1.0])
            .with_format(SampleFormat::Int16);
        let path = std::env::temp_dir().join("trackio_int16.wav");
        export_track(&path, &track).unwrap();
        let imported = import_wav(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(imported.sample_format(), SampleFormat::Int16);
        let samples = imported.samples();
        assert_eq!(samples[0], 0.5);
        assert_eq!(samples[1], -1.0);
        assert!(samples[2] > 0.999);
    }

    #[test]
    fn test_passthrough_quantizes() {
        let mut converter = CaptureConverter::new(48000.0, 48000.0, 1, SampleFormat::Int16).unwrap();
        assert!(!converter.is_resampling());
        let mut out = Vec::new();
        converter.process(&[0.5, 0.123_456_7, 2.0], &mut out).unwrap();
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], SampleFormat::Int16.quantize(0.123_456_7));
        assert!(out[2] < 1.0);
        converter.flush(&mut out).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_resampled_length_and_level() {
        let mut converter =
            CaptureConverter::new(48000.0, 24000.0, 2, SampleFormat::Float32).unwrap();
        assert!(converter.is_resampling());

        let input: Vec<f32> = std::iter::repeat([0.5f32, -0.25]).take(9600).flatten().collect();
        let mut out = Vec::new();
        for chunk in input.chunks(2 * 700) {
            converter.process(chunk, &mut out).unwrap();
        }
        converter.flush(&mut out).unwrap();

        assert_eq!(out.len(), 4800 * 2);
        let middle = &out[2400 * 2..2400 * 2 + 2];
        assert!((middle[0] - 0.5).abs() < 0.01);
        assert!((middle[1] + 0.25).abs() < 0.01);
    }

    #[test]
    fn test_rejects_bad_rate() {
        assert!(CaptureConverter::new(0.0, 48000.0, 1, SampleFormat::Float32).is_err());
    }
}
