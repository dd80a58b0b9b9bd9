// src/audio/recording.rs
// Capture-side schedule: preroll, latency correction and lost-capture bookkeeping

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::backend::DeviceFormat;

/// A stretch of the recording where input was lost and silence stands in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LostCaptureInterval {
    pub start: f64,
    pub duration: f64,
}

impl LostCaptureInterval {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Where the buffer exchange thread is in the captured stream, and how much
/// of its head must be dropped or padded
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSchedule {
    pub pre_roll: f64,
    /// Seconds; negative shifts recorded material earlier
    pub latency_correction: f64,
    pub duration: f64,
    /// Seconds read from the capture rings so far
    pub position: f64,
    pub latency_corrected: bool,
}

impl RecordingSchedule {
    pub fn new(pre_roll: f64, latency_correction: f64, duration: f64) -> Self {
        Self {
            pre_roll: pre_roll.max(0.0),
            latency_correction,
            duration,
            position: 0.0,
            latency_corrected: false,
        }
    }

    pub fn total_correction(&self) -> f64 {
        self.latency_correction - self.pre_roll
    }

    /// Seconds of captured input that have landed in the track
    pub fn consumed(&self) -> f64 {
        (self.position + self.total_correction()).max(0.0)
    }

    pub fn to_consume(&self) -> f64 {
        self.duration - self.consumed()
    }

    /// Seconds still to be thrown away from the head of the capture
    pub fn to_discard(&self) -> f64 {
        (-(self.position + self.total_correction())).max(0.0)
    }
}

/// Append-only log of lost capture frames, written by the audio callback
/// without allocating. Adjacent losses merge into one interval.
pub struct DropoutLog {
    starts: Box<[AtomicU64]>,
    lengths: Box<[AtomicU64]>,
    len: AtomicUsize,
    lost_frames: AtomicU64,
    overflowed: AtomicBool,
}

impl DropoutLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            starts: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            lengths: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            len: AtomicUsize::new(0),
            lost_frames: AtomicU64::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    /// Note `frames` lost frames starting at capture frame `start`.
    /// Only one thread may record.
    pub fn record(&self, start: u64, frames: u64) {
        if frames == 0 {
            return;
        }
        self.lost_frames.fetch_add(frames, Ordering::Relaxed);

        let len = self.len.load(Ordering::Relaxed);
        if len > 0 {
            let last = len - 1;
            let last_start = self.starts[last].load(Ordering::Relaxed);
            let last_end = last_start + self.lengths[last].load(Ordering::Relaxed);
            if start <= last_end {
                let end = last_end.max(start + frames);
                self.lengths[last].store(end - last_start, Ordering::Release);
                return;
            }
            if len == self.starts.len() {
                // out of room: widen the last interval to cover this one
                self.overflowed.store(true, Ordering::Relaxed);
                self.lengths[last].store(start + frames - last_start, Ordering::Release);
                return;
            }
        }

        self.starts[len].store(start, Ordering::Relaxed);
        self.lengths[len].store(frames, Ordering::Relaxed);
        self.len.store(len + 1, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lost_frames(&self) -> u64 {
        self.lost_frames.load(Ordering::Relaxed)
    }

    /// True if intervals had to be coalesced for lack of room
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Intervals in track time, capture frame 0 sitting at `origin`
    pub fn intervals(&self, origin: f64, rate: f64) -> Vec<LostCaptureInterval> {
        let len = self.len();
        (0..len)
            .map(|i| {
                let start = self.starts[i].load(Ordering::Acquire);
                let frames = self.lengths[i].load(Ordering::Acquire);
                LostCaptureInterval {
                    start: origin + start as f64 / rate,
                    duration: frames as f64 / rate,
                }
            })
            .collect()
    }
}

/// Offset applied to newly recorded material to undo the input/output
/// round trip of a particular backend
pub trait LatencyCalibration: Send + Sync {
    /// Seconds; negative moves the recording earlier
    fn correction(&self, format: &DeviceFormat) -> f64;
}

/// A measured constant, typically from a loopback test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedLatencyCorrection(pub f64);

impl LatencyCalibration for FixedLatencyCorrection {
    fn correction(&self, _format: &DeviceFormat) -> f64 {
        self.0
    }
}

/// Trusts the latencies the backend reports, plus a constant adjustment
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReportedLatencyCorrection {
    pub adjustment: f64,
}

impl LatencyCalibration for ReportedLatencyCorrection {
    fn correction(&self, format: &DeviceFormat) -> f64 {
        self.adjustment - (format.input_latency + format.output_latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_accounting() {
        let mut schedule = RecordingSchedule::new(0.5, -0.1, f64::INFINITY);
        assert!((schedule.total_correction() - -0.6).abs() < 1e-12);
        assert!((schedule.to_discard() - 0.6).abs() < 1e-12);
        assert_eq!(schedule.consumed(), 0.0);

        schedule.position = 0.25;
        assert!((schedule.to_discard() - 0.35).abs() < 1e-12);

        schedule.position = 1.0;
        assert_eq!(schedule.to_discard(), 0.0);
        assert!((schedule.consumed() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_positive_correction_discards_nothing() {
        let schedule = RecordingSchedule::new(0.0, 0.02, 10.0);
        assert_eq!(schedule.to_discard(), 0.0);
        assert!((schedule.consumed() - 0.02).abs() < 1e-12);
        assert!((schedule.to_consume() - 9.98).abs() < 1e-12);
    }

    #[test]
    fn test_adjacent_losses_merge() {
        let log = DropoutLog::new(8);
        log.record(100, 50);
        log.record(150, 50);
        log.record(400, 10);
        // overlapping report
        log.record(405, 10);

        let intervals = log.intervals(1.0, 100.0);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].start, 2.0);
        assert_eq!(intervals[0].duration, 1.0);
        assert_eq!(intervals[1].start, 5.0);
        assert!((intervals[1].duration - 0.15).abs() < 1e-12);
        assert_eq!(log.lost_frames(), 120);
    }

    #[test]
    fn test_full_log_widens_last_interval() {
        let log = DropoutLog::new(2);
        log.record(0, 10);
        log.record(100, 10);
        log.record(200, 10);

        assert!(log.overflowed());
        let intervals = log.intervals(0.0, 10.0);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[1].start, 10.0);
        assert_eq!(intervals[1].end(), 21.0);
    }

    #[test]
    fn test_calibrations() {
        let format = DeviceFormat {
            rate: 48000,
            buffer_frames: 256,
            input_channels: 2,
            output_channels: 2,
            input_latency: 0.01,
            output_latency: 0.02,
        };
        assert_eq!(FixedLatencyCorrection(-0.13).correction(&format), -0.13);
        let reported = ReportedLatencyCorrection { adjustment: 0.005 };
        assert!((reported.correction(&format) - -0.025).abs() < 1e-12);
    }
}
