// src/audio/cut_preview.rs
// Plays the material on both sides of an edited-out gap as one continuous preview

use super::mixer::TrackMixer;
use super::schedule::{PlaybackPolicy, PlaybackSchedule, PlaybackSlice};

/// Preview of a cut: play up to the gap, skip it, play on to t1.
/// Works in either play direction.
#[derive(Debug, Clone)]
pub struct CutPreviewPlaybackPolicy {
    gap_left: f64,
    gap_length: f64,
    rate: f64,
    reversed: bool,
    // the gap starts before t1, so there is a second segment
    gap_in_range: bool,
    remaining1: usize,
    remaining2: usize,
    jumped: bool,
}

impl CutPreviewPlaybackPolicy {
    pub fn new(gap_left: f64, gap_length: f64) -> Self {
        Self {
            gap_left,
            gap_length: gap_length.max(0.0),
            rate: 0.0,
            reversed: false,
            gap_in_range: false,
            remaining1: 0,
            remaining2: 0,
            jumped: false,
        }
    }

    /// Edge of the gap reached first in the play direction
    pub fn gap_start(&self) -> f64 {
        if self.reversed {
            self.gap_left + self.gap_length
        } else {
            self.gap_left
        }
    }

    /// Edge of the gap where playback resumes
    pub fn gap_end(&self) -> f64 {
        if self.reversed {
            self.gap_left
        } else {
            self.gap_left + self.gap_length
        }
    }

    /// Frames left before and after the gap
    pub fn remaining(&self) -> (usize, usize) {
        (self.remaining1, self.remaining2)
    }

    /// Rebuild segment lengths from the schedule's track time, moving it out
    /// of the gap if it lies inside
    fn recompute(&mut self, schedule: &mut PlaybackSchedule) {
        let dir = schedule.direction();
        let gap_start = self.gap_start();
        let gap_end = self.gap_end();
        let mut time = schedule.clamp_track_time(schedule.track_time());

        self.gap_in_range = dir * (schedule.t1 - gap_start) > 0.0;
        let before_gap = dir * (gap_start - time) > 0.0;
        if self.gap_in_range && !before_gap && dir * (gap_end - time) > 0.0 {
            time = gap_end;
        }

        if before_gap {
            let segment_end = if self.gap_in_range {
                gap_start
            } else {
                schedule.t1
            };
            self.remaining1 = schedule.frames_between(time, segment_end);
            self.jumped = false;
        } else {
            self.remaining1 = 0;
            self.jumped = true;
        }

        self.remaining2 = if !self.gap_in_range {
            0
        } else if before_gap {
            schedule.frames_between(gap_end, schedule.t1)
        } else {
            schedule.frames_between(time, schedule.t1)
        };

        schedule.set_track_time(time);
    }
}

impl PlaybackPolicy for CutPreviewPlaybackPolicy {
    fn initialize(&mut self, schedule: &mut PlaybackSchedule, rate: f64) {
        self.rate = rate;
        self.reversed = schedule.reversed();
        self.recompute(schedule);
    }

    fn playback_slice(
        &mut self,
        schedule: &mut PlaybackSchedule,
        available: usize,
    ) -> PlaybackSlice {
        let (remaining, last_segment) = if self.remaining1 > 0 {
            (self.remaining1, !self.gap_in_range)
        } else {
            (self.remaining2, true)
        };

        if last_segment && remaining < available {
            PlaybackSlice::new(available, remaining + schedule.grain() + 1, remaining)
        } else {
            // stop exactly at the gap so the next slice starts past it
            let frames = available.min(remaining);
            PlaybackSlice::new(available, frames, frames)
        }
    }

    fn done(&self, _schedule: &PlaybackSchedule) -> bool {
        self.remaining1 == 0 && self.remaining2 == 0
    }

    fn offset_track_time(&mut self, schedule: &mut PlaybackSchedule, offset: f64) -> f64 {
        // work in preview time, which leaves the gap out
        let dir = schedule.direction();
        let t0 = schedule.t0;
        let total = dir * (schedule.t1 - t0);
        let gap_from = (dir * (self.gap_start() - t0)).clamp(0.0, total);
        let gap_to = (dir * (self.gap_end() - t0)).clamp(0.0, total);
        let elided = gap_to - gap_from;

        let along = (dir * (schedule.track_time() - t0)).clamp(0.0, total);
        let preview = if along < gap_from {
            along
        } else if along < gap_to {
            gap_from
        } else {
            along - elided
        };

        let preview = (preview + dir * offset).clamp(0.0, total - elided);
        let along = if preview < gap_from {
            preview
        } else {
            preview + elided
        };

        schedule.set_track_time(t0 + dir * along);
        self.recompute(schedule);
        schedule.track_time()
    }

    fn advanced_track_time(
        &mut self,
        schedule: &PlaybackSchedule,
        track_time: f64,
        frames: usize,
    ) -> (f64, f64) {
        let time = track_time + schedule.frame_step() * frames as f64;

        if self.remaining1 > 0 {
            self.remaining1 -= frames.min(self.remaining1);
            if self.remaining1 == 0 {
                return if self.gap_in_range {
                    (self.gap_end(), f64::INFINITY)
                } else {
                    (schedule.t1, f64::INFINITY)
                };
            }
            return (time, time);
        }

        self.remaining2 -= frames.min(self.remaining2);
        if self.remaining2 == 0 {
            return (schedule.t1, f64::INFINITY);
        }
        (time, time)
    }

    fn reposition_playback(
        &mut self,
        schedule: &mut PlaybackSchedule,
        mixers: &mut [TrackMixer],
        _frames: usize,
        available: usize,
    ) -> bool {
        if self.gap_in_range && self.remaining1 == 0 && !self.jumped {
            self.jumped = true;
            let gap_end = self.gap_end();
            schedule.set_track_time(gap_end);
            for mixer in mixers.iter_mut() {
                mixer.reposition(gap_end);
            }
        }
        available == 0 || self.done(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::{MemoryTrack, PlayableTrack};
    use std::sync::Arc;

    const RATE: f64 = 1000.0;
    const GRAIN: usize = 100;

    fn ramp_track(seconds: usize) -> Arc<dyn PlayableTrack> {
        let frames = seconds * RATE as usize;
        let samples = (0..frames).map(|i| i as f32 / RATE as f32).collect();
        Arc::new(MemoryTrack::from_samples("ramp", RATE, 1, samples))
    }

    /// Drive the policy the way the buffer exchange thread does; returns the
    /// track time of every produced frame and the rendered samples
    fn play_through(
        policy: &mut CutPreviewPlaybackPolicy,
        schedule: &mut PlaybackSchedule,
        available: usize,
    ) -> (Vec<f64>, Vec<f32>) {
        let mut mixers = vec![TrackMixer::new(ramp_track(5), schedule.track_time(), 1)];
        let mut times = Vec::new();
        let mut samples = Vec::new();
        let mut buffer = vec![0.0; available];

        for _ in 0..1000 {
            if policy.done(schedule) {
                break;
            }
            let start = schedule.track_time();
            let slice = policy.playback_slice(schedule, available);
            let step = schedule.frame_step();
            let (time, next) = policy.advanced_track_time(schedule, start, slice.to_produce);
            for k in 0..slice.to_produce {
                times.push(start + step * k as f64);
            }
            mixers[0].render(&mut buffer, slice.to_produce, step);
            samples.extend_from_slice(&buffer[..slice.to_produce]);

            schedule.set_track_time(if next.is_finite() { next } else { time });
            policy.reposition_playback(schedule, &mut mixers, slice.frames, 0);
        }
        (times, samples)
    }

    #[test]
    fn test_gap_is_never_played() {
        let mut policy = CutPreviewPlaybackPolicy::new(2.0, 1.0);
        let mut schedule = PlaybackSchedule::new(0.0, 5.0, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);
        assert_eq!(policy.remaining(), (2000, 2000));

        let (times, samples) = play_through(&mut policy, &mut schedule, 700);
        assert_eq!(times.len(), 4000);
        assert!(times.iter().all(|t| !(2.0..3.0).contains(t)));
        // the rendered ramp carries its own time stamp
        assert!(samples.iter().all(|s| !(2.0..3.0).contains(s)));
        assert_eq!(samples[1999], 1.999);
        assert_eq!(samples[2000], 3.0);
        assert!(policy.done(&schedule));
    }

    #[test]
    fn test_pre_gap_slice_stops_at_gap() {
        let mut policy = CutPreviewPlaybackPolicy::new(2.0, 1.0);
        let mut schedule = PlaybackSchedule::new(0.0, 5.0, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);

        let slice = policy.playback_slice(&mut schedule, 10_000);
        assert_eq!((slice.frames, slice.to_produce), (2000, 2000));
        let (time, next) = policy.advanced_track_time(&schedule, 0.0, 2000);
        assert_eq!(time, 3.0);
        assert!(next.is_infinite());

        policy.reposition_playback(&mut schedule, &mut [], 2000, 8000);
        assert_eq!(schedule.track_time(), 3.0);
        let slice = policy.playback_slice(&mut schedule, 8000);
        assert_eq!(slice.to_produce, 2000);
        assert_eq!(slice.frames, 2000 + GRAIN + 1);
    }

    #[test]
    fn test_reversed_preview() {
        let mut policy = CutPreviewPlaybackPolicy::new(2.0, 1.0);
        let mut schedule = PlaybackSchedule::new(5.0, 0.0, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);
        assert_eq!(policy.gap_start(), 3.0);
        assert_eq!(policy.gap_end(), 2.0);
        assert_eq!(policy.remaining(), (2000, 2000));

        let (times, _) = play_through(&mut policy, &mut schedule, 512);
        assert_eq!(times.len(), 4000);
        assert!(times.iter().all(|t| !(t > &2.0 && t <= &3.0)));
        assert!(times.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_seek_skips_gap() {
        let mut policy = CutPreviewPlaybackPolicy::new(2.0, 1.0);
        let mut schedule = PlaybackSchedule::new(0.0, 5.0, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);

        schedule.set_track_time(1.5);
        assert!((policy.offset_track_time(&mut schedule, 1.0) - 3.5).abs() < 1e-9);
        assert_eq!(policy.remaining(), (0, 1500));

        assert!((policy.offset_track_time(&mut schedule, -1.0) - 1.5).abs() < 1e-9);
        assert_eq!(policy.remaining(), (500, 2000));

        // landing exactly on the gap start resumes after the gap
        assert!((policy.offset_track_time(&mut schedule, 0.5) - 3.0).abs() < 1e-9);
        assert_eq!(policy.offset_track_time(&mut schedule, 100.0), 5.0);
        assert!(policy.done(&schedule));
    }

    #[test]
    fn test_start_inside_gap() {
        let mut policy = CutPreviewPlaybackPolicy::new(2.0, 1.0);
        let mut schedule = PlaybackSchedule::new(2.5, 5.0, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);
        assert_eq!(schedule.track_time(), 3.0);
        assert_eq!(policy.remaining(), (0, 2000));
    }

    #[test]
    fn test_gap_after_region_end() {
        let mut policy = CutPreviewPlaybackPolicy::new(4.0, 1.0);
        let mut schedule = PlaybackSchedule::new(0.0, 3.0, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);
        assert_eq!(policy.remaining(), (3000, 0));

        let slice = policy.playback_slice(&mut schedule, 4000);
        assert_eq!(slice.to_produce, 3000);
        assert_eq!(slice.frames, 3000 + GRAIN + 1);
        let (time, next) = policy.advanced_track_time(&schedule, 0.0, 3000);
        assert_eq!(time, 3.0);
        assert!(next.is_infinite());
    }
}
