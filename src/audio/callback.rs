// src/audio/callback.rs
// Per-buffer work on the audio thread: capture into rings, mix playback out of rings, publish time.
// Never allocates, locks or blocks.

use std::sync::Arc;

use super::backend::CallbackStatus;
use super::listener::AudioIoListener;
use super::message_buffer::MessageBuffer;
use super::meter::MeterSnapshot;
use super::mixer::clamp_output;
use super::recording::DropoutLog;
use super::ring_buffer::{RingReader, RingWriter};
use super::state::StreamState;
use super::time_queue::TimeQueueConsumer;

/// Where one capture ring takes its channels from
pub struct CaptureInput {
    writer: RingWriter,
    first_channel: usize,
    // zeros still to be written to keep this ring aligned after a short write
    owed: usize,
}

impl CaptureInput {
    pub fn new(writer: RingWriter, first_channel: usize) -> Self {
        Self {
            writer,
            first_channel,
            owed: 0,
        }
    }

    fn settle(&mut self) {
        if self.owed > 0 {
            self.owed -= self.writer.write_silence(self.owed);
        }
    }
}

pub struct AudioCallback {
    state: Arc<StreamState>,
    token: u64,
    out_channels: usize,
    in_channels: usize,
    playback: Vec<RingReader>,
    capture: Vec<CaptureInput>,
    time_queue: TimeQueueConsumer,
    t1: f64,
    reversed: bool,
    dropouts: Arc<DropoutLog>,
    capture_frames: u64,
    capture_meter: Option<Arc<MessageBuffer<MeterSnapshot>>>,
    playback_meter: Option<Arc<MessageBuffer<MeterSnapshot>>>,
    listener: Option<Arc<dyn AudioIoListener>>,
    // linear level
    activation_level: Option<f32>,
    activated: bool,
    discard_seen: u64,
}

impl AudioCallback {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StreamState>,
        token: u64,
        out_channels: usize,
        in_channels: usize,
        playback: Vec<RingReader>,
        capture: Vec<CaptureInput>,
        time_queue: TimeQueueConsumer,
        t0: f64,
        t1: f64,
        dropouts: Arc<DropoutLog>,
    ) -> Self {
        let discard_seen = state.discard_requested();
        Self {
            state,
            token,
            out_channels: out_channels.max(1),
            in_channels,
            playback,
            capture,
            time_queue,
            t1,
            reversed: t1 < t0,
            dropouts,
            capture_frames: 0,
            capture_meter: None,
            playback_meter: None,
            listener: None,
            activation_level: None,
            activated: false,
            discard_seen,
        }
    }

    pub fn with_meters(
        mut self,
        capture: Option<Arc<MessageBuffer<MeterSnapshot>>>,
        playback: Option<Arc<MessageBuffer<MeterSnapshot>>>,
    ) -> Self {
        self.capture_meter = capture;
        self.playback_meter = playback;
        self
    }

    /// Report input crossing `level` (linear) to the listener
    pub fn with_sound_activation(
        mut self,
        listener: Option<Arc<dyn AudioIoListener>>,
        level: Option<f32>,
    ) -> Self {
        self.listener = listener;
        self.activation_level = level;
        self
    }

    /// One driver period
    pub fn process(&mut self, input: &[f32], output: &mut [f32], status: CallbackStatus) {
        output.fill(0.0);
        self.state.count_callback();
        if status.output_underflow {
            // the previous period reached the device late
            self.state
                .add_driver_underflow((output.len() / self.out_channels) as u64);
        }

        let request = self.state.discard_requested();
        if request != self.discard_seen {
            for ring in &mut self.playback {
                ring.discard_all();
            }
            self.time_queue.discard_all();
            self.discard_seen = request;
            self.state.acknowledge_discard(request);
        }

        if self.state.terminating() || self.state.token() != self.token {
            return;
        }

        self.check_sound_activation(input);

        if self.state.is_paused() {
            return;
        }

        self.capture(input, status);

        let frames = output.len() / self.out_channels;
        if self.playback.is_empty() {
            self.time_queue.consume(frames);
            self.state.publish_time(self.time_queue.last_time());
        } else {
            let available = self
                .playback
                .iter()
                .map(RingReader::readable_frames)
                .min()
                .unwrap_or(0)
                .min(frames);
            for ring in &mut self.playback {
                ring.mix_into(output, available);
            }
            clamp_output(output);

            if available < frames && !self.state.playback_exhausted() {
                self.state.add_underrun((frames - available) as u64);
            }
            if available > 0 {
                self.state.add_consumed(available as u64);
                self.time_queue.consume(available);
                self.state.publish_time(self.time_queue.last_time());
            }
        }

        if let Some(meter) = &self.playback_meter {
            meter.write(MeterSnapshot::from_interleaved(output, self.out_channels));
        }

        if self.finished() {
            self.state.mark_completed();
        }
    }

    fn finished(&self) -> bool {
        if !self.playback.is_empty() {
            return self.state.playback_exhausted()
                && self.playback.iter().all(|r| r.readable_frames() == 0);
        }
        if !self.t1.is_finite() {
            return false;
        }
        let time = self.time_queue.last_time();
        if self.reversed {
            time <= self.t1
        } else {
            time >= self.t1
        }
    }

    fn capture(&mut self, input: &[f32], status: CallbackStatus) {
        if self.capture.is_empty() || self.in_channels == 0 {
            return;
        }
        let frames = input.len() / self.in_channels;
        if frames == 0 {
            return;
        }
        let position = self.capture_frames;

        if status.input_overflow {
            // whatever arrived follows a gap; keep the timeline with silence
            for capture in &mut self.capture {
                capture.settle();
                let written = capture.writer.write_silence(frames);
                capture.owed += frames - written;
            }
            self.dropouts.record(position, frames as u64);
            self.state.add_lost_capture(frames as u64);
        } else {
            let mut worst: Option<(u64, usize)> = None;
            for capture in &mut self.capture {
                capture.settle();
                let written = if capture.owed > 0 {
                    0
                } else {
                    capture.writer.write_from_interleaved(
                        input,
                        self.in_channels,
                        capture.first_channel,
                        frames,
                    )
                };
                if written < frames {
                    let lost = frames - written;
                    capture.owed += lost;
                    if worst.is_none_or(|(_, n)| lost > n) {
                        worst = Some((position + written as u64, lost));
                    }
                }
            }
            if let Some((start, lost)) = worst {
                self.dropouts.record(start, lost as u64);
                self.state.add_lost_capture(lost as u64);
            }
        }
        self.capture_frames += frames as u64;

        if let Some(meter) = &self.capture_meter {
            let snapshot = if status.input_overflow {
                MeterSnapshot::from_interleaved(&[], self.in_channels)
            } else {
                MeterSnapshot::from_interleaved(input, self.in_channels)
            };
            meter.write(snapshot);
        }
    }

    fn check_sound_activation(&mut self, input: &[f32]) {
        let (Some(level), Some(listener)) = (self.activation_level, &self.listener) else {
            return;
        };
        let peak = input.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        let active = peak >= level;
        if active != self.activated {
            self.activated = active;
            listener.on_sound_activation_threshold(active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring_buffer::sample_ring;
    use crate::audio::time_queue::time_queue;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const RATE: f64 = 1000.0;

    fn overflow() -> CallbackStatus {
        CallbackStatus {
            input_overflow: true,
            output_underflow: false,
        }
    }

    fn capture_callback(
        ring_frames: usize,
    ) -> (AudioCallback, RingReader, Arc<DropoutLog>, Arc<StreamState>) {
        let live = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(StreamState::new());
        state.set_token(1);
        let (writer, reader) = sample_ring(ring_frames, 1, &live);
        let (_, consumer) = time_queue(1000, 100, 0.0);
        let dropouts = Arc::new(DropoutLog::new(16));
        let callback = AudioCallback::new(
            Arc::clone(&state),
            1,
            1,
            1,
            Vec::new(),
            vec![CaptureInput::new(writer, 0)],
            consumer.free_running(RATE),
            0.0,
            f64::INFINITY,
            Arc::clone(&dropouts),
        );
        (callback, reader, dropouts, state)
    }

    #[test]
    fn test_overflow_logs_one_buffer() {
        let (mut callback, mut reader, dropouts, state) = capture_callback(1000);
        let input = [0.5f32; 10];
        let mut output = [0.0f32; 10];
        for i in 0..10 {
            let status = if i == 4 {
                overflow()
            } else {
                CallbackStatus::default()
            };
            callback.process(&input, &mut output, status);
        }

        let intervals = dropouts.intervals(0.0, RATE);
        assert_eq!(intervals.len(), 1);
        assert!((intervals[0].start - 0.04).abs() < 1e-12);
        assert!((intervals[0].duration - 0.01).abs() < 1e-12);
        assert_eq!(state.stats().lost_capture_frames, 10);

        let mut captured = vec![1.0f32; 100];
        assert_eq!(reader.read_into(&mut captured), 100);
        assert!(captured[40..50].iter().all(|&s| s == 0.0));
        assert!(captured[50..].iter().all(|&s| s == 0.5));
        assert!((state.stream_time() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_full_ring_owes_zeros() {
        let (mut callback, mut reader, dropouts, _) = capture_callback(15);
        let mut output = [0.0f32; 10];
        callback.process(&[0.25; 10], &mut output, CallbackStatus::default());
        // only 5 of these fit
        callback.process(&[0.5; 10], &mut output, CallbackStatus::default());

        let intervals = dropouts.intervals(0.0, RATE);
        assert_eq!(intervals.len(), 1);
        assert!((intervals[0].start - 0.015).abs() < 1e-12);
        assert!((intervals[0].duration - 0.005).abs() < 1e-12);

        let mut drained = vec![0.0f32; 15];
        reader.read_into(&mut drained);
        callback.process(&[0.75; 10], &mut output, CallbackStatus::default());
        let mut next = vec![1.0f32; 15];
        let read = reader.read_into(&mut next);
        assert_eq!(read, 15);
        // five owed zeros, then the new buffer
        assert!(next[..5].iter().all(|&s| s == 0.0));
        assert!(next[5..].iter().all(|&s| s == 0.75));
    }

    #[test]
    fn test_pause_skips_consumption() {
        let live = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(StreamState::new());
        state.set_token(7);
        let (mut writer, reader) = sample_ring(100, 1, &live);
        let (mut producer, consumer) = time_queue(100, 10, 0.0);
        producer.push(0.0, 1.0 / RATE, 40);
        writer.write_frames(&(0..40).map(|i| i as f32 / 100.0).collect::<Vec<_>>());
        let mut callback = AudioCallback::new(
            Arc::clone(&state),
            7,
            1,
            0,
            vec![reader],
            Vec::new(),
            consumer,
            0.0,
            1.0,
            Arc::new(DropoutLog::new(4)),
        );

        let mut output = [9.0f32; 10];
        callback.process(&[], &mut output, CallbackStatus::default());
        assert_eq!(output[3], 0.03);
        assert!((state.stream_time() - 0.01).abs() < 1e-12);

        state.set_paused(true);
        callback.process(&[], &mut output, CallbackStatus::default());
        assert!(output.iter().all(|&s| s == 0.0));
        assert!((state.stream_time() - 0.01).abs() < 1e-12);

        state.set_paused(false);
        callback.process(&[], &mut output, CallbackStatus::default());
        assert_eq!(output[0], 0.1);
        assert_eq!(state.stats().consumed_frames, 20);
        assert_eq!(state.stats().underrun_frames, 0);
    }

    #[test]
    fn test_driver_underflow_is_counted() {
        let live = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(StreamState::new());
        state.set_token(1);
        let (mut writer, reader) = sample_ring(100, 1, &live);
        let (mut producer, consumer) = time_queue(100, 10, 0.0);
        producer.push(0.0, 1.0 / RATE, 20);
        writer.write_frames(&[0.25; 20]);
        let mut callback = AudioCallback::new(
            Arc::clone(&state),
            1,
            1,
            0,
            vec![reader],
            Vec::new(),
            consumer,
            0.0,
            1.0,
            Arc::new(DropoutLog::new(4)),
        );

        let mut output = [0.0f32; 10];
        let late = CallbackStatus {
            input_overflow: false,
            output_underflow: true,
        };
        callback.process(&[], &mut output, late);
        callback.process(&[], &mut output, CallbackStatus::default());

        let stats = state.stats();
        assert_eq!(stats.driver_underflow_frames, 10);
        assert_eq!(stats.consumed_frames, 20);
        assert_eq!(stats.underrun_frames, 0);
    }

    #[test]
    fn test_completion_after_exhausted_rings_drain() {
        let live = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(StreamState::new());
        state.set_token(1);
        let (mut writer, reader) = sample_ring(100, 2, &live);
        let (mut producer, consumer) = time_queue(100, 10, 0.0);
        producer.push(0.0, 1.0 / RATE, 5);
        writer.write_frames(&[0.1; 10]);
        let mut callback = AudioCallback::new(
            Arc::clone(&state),
            1,
            2,
            0,
            vec![reader],
            Vec::new(),
            consumer,
            0.0,
            0.005,
            Arc::new(DropoutLog::new(4)),
        );

        let mut output = [0.0f32; 16];
        callback.process(&[], &mut output, CallbackStatus::default());
        assert!(!state.completed());
        // short buffer before the end is known counts as an underrun
        assert_eq!(state.stats().underrun_frames, 3);

        state.set_playback_exhausted(true);
        callback.process(&[], &mut output, CallbackStatus::default());
        assert!(state.completed());
        assert_eq!(state.stats().underrun_frames, 3);
    }

    #[test]
    fn test_discard_request_is_acknowledged() {
        let live = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(StreamState::new());
        state.set_token(1);
        let (mut writer, reader) = sample_ring(100, 1, &live);
        let (mut producer, consumer) = time_queue(100, 10, 0.0);
        producer.push(0.0, 1.0 / RATE, 50);
        writer.write_frames(&[0.5; 50]);
        let mut callback = AudioCallback::new(
            Arc::clone(&state),
            1,
            1,
            0,
            vec![reader],
            Vec::new(),
            consumer,
            0.0,
            1.0,
            Arc::new(DropoutLog::new(4)),
        );

        let epoch = state.request_discard();
        state.set_paused(true);
        let mut output = [0.0f32; 10];
        callback.process(&[], &mut output, CallbackStatus::default());
        assert_eq!(state.discard_acknowledged(), epoch);
        assert_eq!(writer.free_frames(), 100);
    }

    #[test]
    fn test_sound_activation_fires_on_change() {
        struct Recorder(Mutex<Vec<bool>>);
        impl AudioIoListener for Recorder {
            fn on_sound_activation_threshold(&self, active: bool) {
                self.0.lock().unwrap().push(active);
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let (callback, _reader, _, _) = capture_callback(1000);
        let listener: Arc<dyn AudioIoListener> = recorder.clone();
        let mut callback = callback.with_sound_activation(Some(listener), Some(0.5));

        let mut output = [0.0f32; 4];
        for level in [0.1, 0.6, 0.7, 0.2, 0.1] {
            callback.process(&[level; 4], &mut output, CallbackStatus::default());
        }
        assert_eq!(*recorder.0.lock().unwrap(), vec![true, false]);
    }
}
