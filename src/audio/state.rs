// src/audio/state.rs
// Flags and counters shared by the engine, the buffer exchange thread and the audio callback

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters accumulated over the life of one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub callbacks: u64,
    /// Playback frames taken from the rings
    pub consumed_frames: u64,
    /// Output frames padded with silence while playback still had material
    pub underrun_frames: u64,
    /// Output frames the driver itself reported as not delivered in time
    pub driver_underflow_frames: u64,
    pub lost_capture_frames: u64,
}

pub struct StreamState {
    token: AtomicU64,
    busy: AtomicBool,
    paused: AtomicBool,
    terminate: AtomicBool,
    playback_exhausted: AtomicBool,
    completed: AtomicBool,
    discard_request: AtomicU64,
    discard_ack: AtomicU64,
    stream_time: AtomicU64,
    // f64 bits of a pending relative seek, NaN when none
    seek: AtomicU64,
    callbacks: AtomicU64,
    consumed_frames: AtomicU64,
    underrun_frames: AtomicU64,
    driver_underflow_frames: AtomicU64,
    lost_capture_frames: AtomicU64,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            token: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            playback_exhausted: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            discard_request: AtomicU64::new(0),
            discard_ack: AtomicU64::new(0),
            stream_time: AtomicU64::new(0f64.to_bits()),
            seek: AtomicU64::new(f64::NAN.to_bits()),
            callbacks: AtomicU64::new(0),
            consumed_frames: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
            driver_underflow_frames: AtomicU64::new(0),
            lost_capture_frames: AtomicU64::new(0),
        }
    }

    /// Clear everything for a new stream starting at `time`. Pause survives.
    pub fn reset(&self, time: f64) {
        self.terminate.store(false, Ordering::Release);
        self.playback_exhausted.store(false, Ordering::Release);
        self.completed.store(false, Ordering::Release);
        let epoch = self.discard_request.load(Ordering::Acquire);
        self.discard_ack.store(epoch, Ordering::Release);
        self.stream_time.store(time.to_bits(), Ordering::Release);
        self.seek.store(f64::NAN.to_bits(), Ordering::Release);
        self.callbacks.store(0, Ordering::Relaxed);
        self.consumed_frames.store(0, Ordering::Relaxed);
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.driver_underflow_frames.store(0, Ordering::Relaxed);
        self.lost_capture_frames.store(0, Ordering::Relaxed);
    }

    pub fn token(&self) -> u64 {
        self.token.load(Ordering::Acquire)
    }

    pub fn set_token(&self, token: u64) {
        self.token.store(token, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn playback_exhausted(&self) -> bool {
        self.playback_exhausted.load(Ordering::Acquire)
    }

    pub fn set_playback_exhausted(&self, exhausted: bool) {
        self.playback_exhausted.store(exhausted, Ordering::Release);
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Ask the callback to drop all buffered playback; returns the epoch to wait for
    pub fn request_discard(&self) -> u64 {
        self.discard_request.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn discard_requested(&self) -> u64 {
        self.discard_request.load(Ordering::Acquire)
    }

    pub fn acknowledge_discard(&self, epoch: u64) {
        self.discard_ack.store(epoch, Ordering::Release);
    }

    pub fn discard_acknowledged(&self) -> u64 {
        self.discard_ack.load(Ordering::Acquire)
    }

    pub fn stream_time(&self) -> f64 {
        f64::from_bits(self.stream_time.load(Ordering::Acquire))
    }

    pub fn publish_time(&self, time: f64) {
        self.stream_time.store(time.to_bits(), Ordering::Release);
    }

    /// Replace any pending seek
    pub fn request_seek(&self, offset: f64) {
        self.seek.store(offset.to_bits(), Ordering::Relaxed);
    }

    pub fn take_seek(&self) -> Option<f64> {
        let bits = self.seek.swap(f64::NAN.to_bits(), Ordering::Relaxed);
        let offset = f64::from_bits(bits);
        (!offset.is_nan()).then_some(offset)
    }

    pub(crate) fn count_callback(&self) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_consumed(&self, frames: u64) {
        self.consumed_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn add_underrun(&self, frames: u64) {
        self.underrun_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn add_driver_underflow(&self, frames: u64) {
        self.driver_underflow_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn add_lost_capture(&self, frames: u64) {
        self.lost_capture_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            consumed_frames: self.consumed_frames.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
            driver_underflow_frames: self.driver_underflow_frames.load(Ordering::Relaxed),
            lost_capture_frames: self.lost_capture_frames.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_seek_wins() {
        let state = StreamState::new();
        assert_eq!(state.take_seek(), None);
        state.request_seek(1.0);
        state.request_seek(-2.5);
        assert_eq!(state.take_seek(), Some(-2.5));
        assert_eq!(state.take_seek(), None);
    }

    #[test]
    fn test_reset_acknowledges_outstanding_discard() {
        let state = StreamState::new();
        let epoch = state.request_discard();
        assert!(state.discard_acknowledged() < epoch);
        state.add_underrun(10);
        state.add_driver_underflow(4);
        state.request_terminate();

        state.reset(3.0);
        assert_eq!(state.discard_acknowledged(), epoch);
        assert_eq!(state.stats(), StreamStats::default());
        assert!(!state.terminating());
        assert_eq!(state.stream_time(), 3.0);
    }
}
