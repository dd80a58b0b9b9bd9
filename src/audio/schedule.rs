// src/audio/schedule.rs
// Playback schedule state and the policies that decide slice sizes and discontinuities

use std::sync::Arc;

use super::message_buffer::MessageBuffer;
use super::mixer::TrackMixer;

/// Transport controls the UI may change while a stream runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackControls {
    pub speed: f64,
    pub loop_enabled: bool,
}

impl Default for PlaybackControls {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_enabled: false,
        }
    }
}

pub const MIN_PLAY_SPEED: f64 = 0.01;
pub const MAX_PLAY_SPEED: f64 = 100.0;

/// State of one stream's playback, owned by the buffer exchange thread
pub struct PlaybackSchedule {
    pub t0: f64,
    pub t1: f64,
    track_time: f64,
    rate: f64,
    speed: f64,
    grain: usize,
    controls: Option<Arc<MessageBuffer<PlaybackControls>>>,
}

impl PlaybackSchedule {
    pub fn new(t0: f64, t1: f64, rate: f64, grain: usize) -> Self {
        Self {
            t0,
            t1,
            track_time: t0,
            rate,
            speed: 1.0,
            grain: grain.max(1),
            controls: None,
        }
    }

    pub fn with_controls(mut self, controls: Arc<MessageBuffer<PlaybackControls>>) -> Self {
        self.controls = Some(controls);
        self
    }

    pub fn reversed(&self) -> bool {
        self.t1 < self.t0
    }

    pub fn direction(&self) -> f64 {
        if self.reversed() { -1.0 } else { 1.0 }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn grain(&self) -> usize {
        self.grain
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        if speed.is_finite() {
            self.speed = speed.clamp(MIN_PLAY_SPEED, MAX_PLAY_SPEED);
        }
    }

    /// Track time of the next frame to be produced
    pub fn track_time(&self) -> f64 {
        self.track_time
    }

    pub fn set_track_time(&mut self, time: f64) {
        self.track_time = time;
    }

    /// Limit a time to the scheduled region, whichever way it runs
    pub fn clamp_track_time(&self, time: f64) -> f64 {
        time.clamp(self.t0.min(self.t1), self.t0.max(self.t1))
    }

    /// Track seconds advanced per output frame
    pub fn frame_step(&self) -> f64 {
        self.direction() * self.speed / self.rate
    }

    /// Output frames needed to play from `from` to `to` in the play direction
    pub fn frames_between(&self, from: f64, to: f64) -> usize {
        let distance = (self.direction() * (to - from)).max(0.0);
        (distance / self.speed * self.rate).round() as usize
    }

    pub fn controls(&self) -> Option<PlaybackControls> {
        self.controls.as_ref().map(|c| c.read())
    }
}

/// How many frames the next refill produces before a discontinuity.
/// `to_produce <= frames <= available`; frames past `to_produce` are silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSlice {
    pub frames: usize,
    pub to_produce: usize,
    pub progress: bool,
}

impl PlaybackSlice {
    pub fn new(available: usize, frames: usize, to_produce: usize) -> Self {
        let frames = frames.min(available);
        let to_produce = to_produce.min(frames);
        Self {
            frames,
            to_produce,
            progress: to_produce > 0,
        }
    }

    pub fn silence(&self) -> usize {
        self.frames - self.to_produce
    }
}

/// Decides how playback advances through the schedule.
///
/// `advanced_track_time` returns `(time, next)`. A finite `next` is where
/// playback continues; `next == f64::INFINITY` marks a jump and playback
/// continues from `time`, after `reposition_playback` has moved the mixers.
pub trait PlaybackPolicy: Send {
    fn initialize(&mut self, schedule: &mut PlaybackSchedule, rate: f64);

    fn playback_slice(&mut self, schedule: &mut PlaybackSchedule, available: usize)
    -> PlaybackSlice;

    fn done(&self, schedule: &PlaybackSchedule) -> bool;

    /// Move the schedule by `offset` seconds from its current track time and
    /// return the new time
    fn offset_track_time(&mut self, schedule: &mut PlaybackSchedule, offset: f64) -> f64;

    fn advanced_track_time(
        &mut self,
        schedule: &PlaybackSchedule,
        track_time: f64,
        frames: usize,
    ) -> (f64, f64);

    /// Execute any pending jump. Returns true when this refill should stop.
    fn reposition_playback(
        &mut self,
        schedule: &mut PlaybackSchedule,
        mixers: &mut [TrackMixer],
        frames: usize,
        available: usize,
    ) -> bool;

    fn looping(&self, _schedule: &PlaybackSchedule) -> bool {
        false
    }
}

/// Plays t0 to t1 once, or loops it
#[derive(Debug, Clone)]
pub struct DefaultPlaybackPolicy {
    loop_enabled: bool,
    variable_speed: bool,
    rate: f64,
    wrap_pending: bool,
}

impl DefaultPlaybackPolicy {
    pub fn new(loop_enabled: bool, variable_speed: bool) -> Self {
        Self {
            loop_enabled,
            variable_speed,
            rate: 0.0,
            wrap_pending: false,
        }
    }

    fn apply_controls(&mut self, schedule: &mut PlaybackSchedule) {
        if let Some(controls) = schedule.controls() {
            self.loop_enabled = controls.loop_enabled;
            if self.variable_speed {
                schedule.set_speed(controls.speed);
            }
        }
    }

    fn remaining(&self, schedule: &PlaybackSchedule) -> usize {
        schedule.frames_between(schedule.track_time(), schedule.t1)
    }
}

impl PlaybackPolicy for DefaultPlaybackPolicy {
    fn initialize(&mut self, schedule: &mut PlaybackSchedule, rate: f64) {
        self.rate = rate;
        self.wrap_pending = false;
        self.apply_controls(schedule);
        let time = schedule.clamp_track_time(schedule.track_time());
        schedule.set_track_time(time);
    }

    fn playback_slice(
        &mut self,
        schedule: &mut PlaybackSchedule,
        available: usize,
    ) -> PlaybackSlice {
        self.apply_controls(schedule);
        let remaining = self.remaining(schedule);

        if self.looping(schedule) || available <= remaining {
            let frames = available.min(remaining);
            PlaybackSlice::new(available, frames, frames)
        } else {
            // trailing silence lets the time queue reach the end time
            PlaybackSlice::new(available, remaining + schedule.grain() + 1, remaining)
        }
    }

    fn done(&self, schedule: &PlaybackSchedule) -> bool {
        !self.looping(schedule) && self.remaining(schedule) == 0
    }

    fn offset_track_time(&mut self, schedule: &mut PlaybackSchedule, offset: f64) -> f64 {
        let time = schedule.clamp_track_time(schedule.track_time() + offset);
        schedule.set_track_time(time);
        self.wrap_pending = false;
        time
    }

    fn advanced_track_time(
        &mut self,
        schedule: &PlaybackSchedule,
        track_time: f64,
        frames: usize,
    ) -> (f64, f64) {
        if (schedule.t1 - schedule.t0).abs() < 1e-9 {
            return (schedule.t0, f64::INFINITY);
        }

        let time = track_time + schedule.frame_step() * frames as f64;
        let half_frame = 0.5 * schedule.speed() / schedule.rate();
        if schedule.direction() * (time - schedule.t1) >= -half_frame {
            if self.looping(schedule) {
                self.wrap_pending = true;
                return (schedule.t0, f64::INFINITY);
            }
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
        if self.wrap_pending {
            self.wrap_pending = false;
            schedule.set_track_time(schedule.t0);
            for mixer in mixers.iter_mut() {
                mixer.reposition(schedule.t0);
            }
        }
        available == 0 || self.done(schedule)
    }

    fn looping(&self, schedule: &PlaybackSchedule) -> bool {
        self.loop_enabled && schedule.frames_between(schedule.t0, schedule.t1) >= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::{MemoryTrack, PlayableTrack};

    const RATE: f64 = 1000.0;
    const GRAIN: usize = 100;

    fn start(policy: &mut DefaultPlaybackPolicy, t0: f64, t1: f64) -> PlaybackSchedule {
        let mut schedule = PlaybackSchedule::new(t0, t1, RATE, GRAIN);
        policy.initialize(&mut schedule, RATE);
        schedule
    }

    /// What the buffer exchange thread does with one slice
    fn step(
        policy: &mut DefaultPlaybackPolicy,
        schedule: &mut PlaybackSchedule,
        mixers: &mut [TrackMixer],
        available: usize,
    ) -> PlaybackSlice {
        let slice = policy.playback_slice(schedule, available);
        let (time, next) =
            policy.advanced_track_time(schedule, schedule.track_time(), slice.to_produce);
        schedule.set_track_time(if next.is_finite() { next } else { time });
        policy.reposition_playback(schedule, mixers, slice.frames, available - slice.frames);
        slice
    }

    #[test]
    fn test_slice_invariant() {
        let slice = PlaybackSlice::new(100, 150, 200);
        assert_eq!(slice.frames, 100);
        assert_eq!(slice.to_produce, 100);
        assert!(slice.progress);
        assert_eq!(PlaybackSlice::new(10, 0, 0).silence(), 0);
    }

    #[test]
    fn test_end_is_padded_with_silence() {
        let mut policy = DefaultPlaybackPolicy::new(false, false);
        let mut schedule = start(&mut policy, 0.0, 1.0);

        let slice = policy.playback_slice(&mut schedule, 5000);
        assert_eq!(slice.to_produce, 1000);
        assert_eq!(slice.frames, 1000 + GRAIN + 1);

        let (time, next) = policy.advanced_track_time(&schedule, 0.0, 1000);
        assert_eq!(time, 1.0);
        assert!(next.is_infinite());
        schedule.set_track_time(time);
        assert!(policy.done(&schedule));
    }

    #[test]
    fn test_loop_wraps_to_start() {
        let track: Arc<dyn PlayableTrack> = Arc::new(MemoryTrack::new("t", RATE, 1));
        let mut mixers = vec![TrackMixer::new(track, 0.0, 1)];
        let mut policy = DefaultPlaybackPolicy::new(true, false);
        let mut schedule = start(&mut policy, 0.0, 1.0);

        let slice = step(&mut policy, &mut schedule, &mut mixers, 600);
        assert_eq!((slice.frames, slice.to_produce), (600, 600));
        assert!((schedule.track_time() - 0.6).abs() < 1e-9);

        mixers[0].reposition(0.6);
        let slice = step(&mut policy, &mut schedule, &mut mixers, 600);
        assert_eq!((slice.frames, slice.to_produce), (400, 400));
        assert_eq!(schedule.track_time(), 0.0);
        assert_eq!(mixers[0].position(), 0.0);
        assert!(!policy.done(&schedule));
    }

    #[test]
    fn test_degenerate_loop_plays_once() {
        let mut policy = DefaultPlaybackPolicy::new(true, false);
        let schedule = start(&mut policy, 1.0, 1.0002);
        assert!(!policy.looping(&schedule));
        assert!(policy.done(&schedule));
    }

    #[test]
    fn test_reversed_play() {
        let mut policy = DefaultPlaybackPolicy::new(false, false);
        let mut schedule = start(&mut policy, 1.0, 0.0);
        assert!(schedule.reversed());

        let slice = step(&mut policy, &mut schedule, &mut [], 300);
        assert_eq!(slice.to_produce, 300);
        assert!((schedule.track_time() - 0.7).abs() < 1e-9);

        let slice = step(&mut policy, &mut schedule, &mut [], 5000);
        assert_eq!(slice.to_produce, 700);
        assert_eq!(schedule.track_time(), 0.0);
        assert!(policy.done(&schedule));
    }

    #[test]
    fn test_variable_speed_from_controls() {
        let controls = Arc::new(MessageBuffer::with_value(PlaybackControls {
            speed: 2.0,
            loop_enabled: false,
        }));
        let mut policy = DefaultPlaybackPolicy::new(false, true);
        let mut schedule =
            PlaybackSchedule::new(0.0, 1.0, RATE, GRAIN).with_controls(Arc::clone(&controls));
        policy.initialize(&mut schedule, RATE);

        let slice = policy.playback_slice(&mut schedule, 5000);
        assert_eq!(slice.to_produce, 500);

        // loop switched on mid-stream
        controls.write(PlaybackControls {
            speed: 2.0,
            loop_enabled: true,
        });
        let slice = policy.playback_slice(&mut schedule, 5000);
        assert_eq!((slice.frames, slice.to_produce), (500, 500));
    }

    #[test]
    fn test_fixed_speed_ignores_controls() {
        let controls = Arc::new(MessageBuffer::with_value(PlaybackControls {
            speed: 4.0,
            loop_enabled: false,
        }));
        let mut policy = DefaultPlaybackPolicy::new(false, false);
        let mut schedule =
            PlaybackSchedule::new(0.0, 1.0, RATE, GRAIN).with_controls(controls);
        policy.initialize(&mut schedule, RATE);
        assert_eq!(schedule.speed(), 1.0);
    }

    #[test]
    fn test_offset_is_clamped() {
        let mut policy = DefaultPlaybackPolicy::new(false, false);
        let mut schedule = start(&mut policy, 0.0, 5.0);
        schedule.set_track_time(2.0);
        assert_eq!(policy.offset_track_time(&mut schedule, 1.5), 3.5);
        assert_eq!(policy.offset_track_time(&mut schedule, 10.0), 5.0);
        assert_eq!(policy.offset_track_time(&mut schedule, -10.0), 0.0);
        assert_eq!(schedule.track_time(), 0.0);
    }
}
