// src/audio/mixer.rs
// Per-track rendering at a warped playback time, plus SIMD mixing helpers

use std::sync::Arc;
use wide::f32x4;

use super::track::PlayableTrack;

/// Add `src * gain` into `dest` (SIMD)
#[inline]
pub fn add_scaled(dest: &mut [f32], src: &[f32], gain: f32) {
    let len = dest.len().min(src.len());
    let gain_vec = f32x4::splat(gain);
    let chunks = len / 4;

    for i in 0..chunks {
        let idx = i * 4;
        let dest_vec = f32x4::new([dest[idx], dest[idx + 1], dest[idx + 2], dest[idx + 3]]);
        let src_vec = f32x4::new([src[idx], src[idx + 1], src[idx + 2], src[idx + 3]]);
        let result = dest_vec + src_vec * gain_vec;
        dest[idx..idx + 4].copy_from_slice(&result.to_array());
    }

    for i in chunks * 4..len {
        dest[i] += src[i] * gain;
    }
}

/// Hard limit to [-1, 1] (SIMD). Returns true if anything was clipped.
#[inline]
pub fn clamp_output(buffer: &mut [f32]) -> bool {
    let one = f32x4::splat(1.0);
    let neg_one = f32x4::splat(-1.0);
    let chunks = buffer.len() / 4;
    let mut clipped = false;

    for i in 0..chunks {
        let idx = i * 4;
        let vec = f32x4::new([
            buffer[idx],
            buffer[idx + 1],
            buffer[idx + 2],
            buffer[idx + 3],
        ]);
        let limited = vec.max(neg_one).min(one);
        let out = limited.to_array();
        clipped |= out != vec.to_array();
        buffer[idx..idx + 4].copy_from_slice(&out);
    }

    for item in buffer.iter_mut().skip(chunks * 4) {
        let limited = item.clamp(-1.0, 1.0);
        clipped |= limited != *item;
        *item = limited;
    }
    clipped
}

/// Renders one playable track into the output channel layout.
///
/// Output frame `n` after the last reposition is taken from track time
/// `base + step * n`, so the result does not depend on how rendering is sliced.
pub struct TrackMixer {
    track: Arc<dyn PlayableTrack>,
    out_channels: usize,
    base: f64,
    step: f64,
    rendered: u64,
    audible_until: Option<f64>,
    fetch: Vec<f32>,
}

impl TrackMixer {
    pub fn new(track: Arc<dyn PlayableTrack>, time: f64, out_channels: usize) -> Self {
        Self {
            track,
            out_channels: out_channels.max(1),
            base: time,
            step: 0.0,
            rendered: 0,
            audible_until: None,
            fetch: Vec::new(),
        }
    }

    /// Silence everything at or after `time` (forward play)
    pub fn audible_until(mut self, time: f64) -> Self {
        self.audible_until = Some(time);
        self
    }

    pub fn track(&self) -> &Arc<dyn PlayableTrack> {
        &self.track
    }

    /// Track time of the next frame to render
    pub fn position(&self) -> f64 {
        self.base + self.step * self.rendered as f64
    }

    pub fn reposition(&mut self, time: f64) {
        self.base = time;
        self.rendered = 0;
    }

    /// Render `frames` frames into `out`, advancing `step` track seconds per
    /// frame (negative when playing backwards)
    pub fn render(&mut self, out: &mut [f32], frames: usize, step: f64) {
        let oc = self.out_channels;
        let out = &mut out[..frames * oc];
        out.fill(0.0);
        if frames == 0 {
            return;
        }

        if step.to_bits() != self.step.to_bits() {
            self.base = self.position();
            self.rendered = 0;
            self.step = step;
        }

        let tc = self.track.channels().max(1);
        let track_rate = self.track.rate();
        let origin = self.track.start_time();
        let gain = self.track.gain();

        let first = self.source_position(0, origin, track_rate);
        let last = self.source_position(frames - 1, origin, track_rate);
        let lo = first.min(last).floor() as i64;
        let hi = first.max(last).floor() as i64 + 1;
        let span = (hi - lo + 1) as usize;

        self.fetch.resize(span * tc, 0.0);
        self.track.read_frames(lo, &mut self.fetch[..span * tc]);

        for i in 0..frames {
            let t = self.base + self.step * (self.rendered + i as u64) as f64;
            if let Some(limit) = self.audible_until
                && t >= limit
            {
                continue;
            }

            let src = (t - origin) * track_rate - lo as f64;
            let nearest = src.round();
            let (a, b, frac) = if (src - nearest).abs() < 1e-6 {
                let a = (nearest.max(0.0) as usize).min(span - 1);
                (a, a, 0.0f32)
            } else {
                let floor = src.floor();
                let a = (floor.max(0.0) as usize).min(span - 1);
                (a, (a + 1).min(span - 1), (src - floor) as f32)
            };

            let frame = &mut out[i * oc..(i + 1) * oc];
            if oc == 1 && tc > 1 {
                let mut sum = 0.0;
                for c in 0..tc {
                    sum += self.interpolate(a, b, frac, c, tc);
                }
                frame[0] = sum / tc as f32 * gain;
            } else {
                for (c, sample) in frame.iter_mut().enumerate() {
                    *sample = self.interpolate(a, b, frac, c % tc, tc) * gain;
                }
            }
        }

        self.rendered += frames as u64;
    }

    #[inline]
    fn source_position(&self, frame: usize, origin: f64, track_rate: f64) -> f64 {
        let t = self.base + self.step * (self.rendered + frame as u64) as f64;
        (t - origin) * track_rate
    }

    #[inline]
    fn interpolate(&self, a: usize, b: usize, frac: f32, channel: usize, channels: usize) -> f32 {
        let s1 = self.fetch[a * channels + channel];
        let s2 = self.fetch[b * channels + channel];
        s1 + (s2 - s1) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::MemoryTrack;

    fn ramp(frames: usize, rate: f64) -> Arc<dyn PlayableTrack> {
        let samples = (0..frames).map(|i| i as f32 / frames as f32).collect();
        Arc::new(MemoryTrack::from_samples("ramp", rate, 1, samples))
    }

    #[test]
    fn test_add_scaled_matches_scalar() {
        let src: Vec<f32> = (0..11).map(|i| i as f32 * 0.1).collect();
        let mut simd = vec![0.5; 11];
        let mut scalar = vec![0.5; 11];
        add_scaled(&mut simd, &src, 0.5);
        for (d, s) in scalar.iter_mut().zip(&src) {
            *d += s * 0.5;
        }
        for (a, b) in simd.iter().zip(&scalar) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_clamp_output() {
        let mut buffer = vec![1.5, -1.5, 0.5, -0.5, 0.9, -0.9];
        assert!(clamp_output(&mut buffer));
        assert_eq!(buffer, vec![1.0, -1.0, 0.5, -0.5, 0.9, -0.9]);
        assert!(!clamp_output(&mut buffer));
    }

    #[test]
    fn test_render_is_sample_exact_at_unity() {
        let track = ramp(1000, 1000.0);
        let mut mixer = TrackMixer::new(Arc::clone(&track), 0.25, 2);
        let mut out = vec![0.0; 20];
        mixer.render(&mut out, 10, 1.0 / 1000.0);

        for i in 0..10 {
            let expected = (250 + i) as f32 / 1000.0;
            assert_eq!(out[i * 2], expected);
            assert_eq!(out[i * 2 + 1], expected);
        }
        assert!((mixer.position() - 0.26).abs() < 1e-9);
    }

    #[test]
    fn test_slicing_does_not_change_output() {
        let track = ramp(1000, 1000.0);
        let step = 0.7 / 1000.0;

        let mut whole = TrackMixer::new(Arc::clone(&track), 0.1, 1);
        let mut a = vec![0.0; 90];
        whole.render(&mut a, 90, step);

        let mut sliced = TrackMixer::new(track, 0.1, 1);
        let mut b = vec![0.0; 90];
        let mut offset = 0;
        for n in [7, 31, 2, 50] {
            sliced.render(&mut b[offset..], n, step);
            offset += n;
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_reverse_render() {
        let track = ramp(100, 100.0);
        let mut mixer = TrackMixer::new(track, 0.5, 1);
        let mut out = vec![0.0; 3];
        mixer.render(&mut out, 3, -1.0 / 100.0);
        assert_eq!(out, vec![0.5, 0.49, 0.48]);
    }

    #[test]
    fn test_preroll_cutoff_and_gain() {
        let samples = vec![1.0; 100];
        let track: Arc<dyn PlayableTrack> =
            Arc::new(MemoryTrack::from_samples("pre", 100.0, 1, samples).with_gain(0.5));
        let mut mixer = TrackMixer::new(track, 0.0, 1).audible_until(0.045);
        let mut out = vec![0.0; 10];
        mixer.render(&mut out, 10, 1.0 / 100.0);
        assert_eq!(&out[..5], &[0.5; 5]);
        assert_eq!(&out[5..], &[0.0; 5]);
    }

    #[test]
    fn test_stereo_track_to_mono_output() {
        let track: Arc<dyn PlayableTrack> = Arc::new(MemoryTrack::from_samples(
            "st",
            10.0,
            2,
            vec![1.0, 0.0, 1.0, 0.0],
        ));
        let mut mixer = TrackMixer::new(track, 0.0, 1);
        let mut out = vec![0.0; 2];
        mixer.render(&mut out, 2, 0.1);
        assert_eq!(out, vec![0.5, 0.5]);
    }
}
