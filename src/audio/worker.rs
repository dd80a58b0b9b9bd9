// src/audio/worker.rs
// Buffer exchange thread: keeps playback rings full and moves captured audio into tracks

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::error::StorageError;
use super::io::CaptureConverter;
use super::listener::AudioIoListener;
use super::mixer::TrackMixer;
use super::recording::RecordingSchedule;
use super::ring_buffer::{RingReader, RingWriter};
use super::schedule::{PlaybackPolicy, PlaybackSchedule};
use super::state::StreamState;
use super::time_queue::TimeQueueProducer;
use super::track::RecordableTrack;

/// Drains one capture ring into its durable track
pub struct CaptureSink {
    target: Arc<dyn RecordableTrack>,
    reader: RingReader,
    converter: CaptureConverter,
    crossfade: Option<Arc<[f32]>>,
    crossfade_pos: usize,
    failed: bool,
    scratch: Vec<f32>,
    converted: Vec<f32>,
}

impl CaptureSink {
    pub fn new(
        target: Arc<dyn RecordableTrack>,
        reader: RingReader,
        converter: CaptureConverter,
        crossfade: Option<Arc<[f32]>>,
    ) -> Self {
        Self {
            target,
            reader,
            converter,
            crossfade,
            crossfade_pos: 0,
            failed: false,
            scratch: Vec::new(),
            converted: Vec::new(),
        }
    }

    /// Blend the crossfade material into the head of the take
    fn apply_crossfade(&mut self) {
        let Some(fade) = &self.crossfade else {
            return;
        };
        let channels = self.converter.channels();
        let fade_frames = fade.len() / channels;
        let mut frame = self.crossfade_pos;
        for out in self.converted.chunks_exact_mut(channels) {
            if frame >= fade_frames {
                break;
            }
            let mix = frame as f32 / fade_frames as f32;
            for (c, sample) in out.iter_mut().enumerate() {
                *sample = fade[frame * channels + c] * (1.0 - mix) + *sample * mix;
            }
            frame += 1;
        }
        self.crossfade_pos = frame;
    }

    /// Hand converted samples to the track. Returns false if nothing was stored.
    fn deliver(&mut self, listener: Option<&Arc<dyn AudioIoListener>>) -> bool {
        if self.converted.is_empty() || self.failed {
            return false;
        }
        self.apply_crossfade();
        match self.target.append(&self.converted) {
            Ok(()) => true,
            Err(e) => self.report(e, listener),
        }
    }

    fn report(&mut self, e: StorageError, listener: Option<&Arc<dyn AudioIoListener>>) -> bool {
        error!("Recording into '{}' failed: {}", self.target.name(), e);
        self.failed = true;
        if let Some(listener) = listener {
            listener.on_storage_failure(&e);
        }
        false
    }

    fn convert(&mut self, frames: usize, listener: Option<&Arc<dyn AudioIoListener>>) -> bool {
        self.converted.clear();
        let input = &self.scratch[..frames * self.reader.channels()];
        match self.converter.process(input, &mut self.converted) {
            Ok(()) => true,
            Err(e) => {
                self.report(StorageError::Write(e.to_string()), listener);
                false
            }
        }
    }
}

/// Owned by the buffer exchange thread for the life of one stream
pub struct BufferExchange {
    state: Arc<StreamState>,
    schedule: PlaybackSchedule,
    policy: Box<dyn PlaybackPolicy>,
    mixers: Vec<TrackMixer>,
    writers: Vec<RingWriter>,
    time_queue: TimeQueueProducer,
    sinks: Vec<CaptureSink>,
    targets: Vec<Arc<dyn RecordableTrack>>,
    recording: RecordingSchedule,
    listener: Option<Arc<dyn AudioIoListener>>,
    rate: f64,
    out_channels: usize,
    min_fill: usize,
    min_capture: usize,
    idle_sleep: Duration,
    mix_buffer: Vec<f32>,
}

impl BufferExchange {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StreamState>,
        schedule: PlaybackSchedule,
        policy: Box<dyn PlaybackPolicy>,
        playback: Vec<(TrackMixer, RingWriter)>,
        time_queue: TimeQueueProducer,
        sinks: Vec<CaptureSink>,
        recording: RecordingSchedule,
        listener: Option<Arc<dyn AudioIoListener>>,
        out_channels: usize,
    ) -> Self {
        let rate = schedule.rate();
        let (mixers, writers): (Vec<_>, Vec<_>) = playback.into_iter().unzip();
        let targets = sinks.iter().map(|s| Arc::clone(&s.target)).collect();
        Self {
            state,
            schedule,
            policy,
            mixers,
            writers,
            time_queue,
            sinks,
            targets,
            recording,
            listener,
            rate,
            out_channels: out_channels.max(1),
            min_fill: 1,
            min_capture: 1,
            idle_sleep: Duration::from_millis(5),
            mix_buffer: Vec::new(),
        }
    }

    /// Refill only when this many frames are free, drain only when this many are buffered
    pub fn with_thresholds(mut self, min_fill: usize, min_capture: usize) -> Self {
        let capacity = self
            .writers
            .iter()
            .map(RingWriter::capacity_frames)
            .min()
            .unwrap_or(usize::MAX);
        self.min_fill = min_fill.clamp(1, capacity.max(1));
        self.min_capture = min_capture.max(1);
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn schedule(&self) -> &PlaybackSchedule {
        &self.schedule
    }

    pub fn recording(&self) -> &RecordingSchedule {
        &self.recording
    }

    /// Thread body. Returns itself so the engine can finish the take after joining.
    pub fn run(mut self) -> Self {
        debug!(
            "Buffer exchange started: {} playback, {} capture",
            self.mixers.len(),
            self.sinks.len()
        );
        while !self.state.terminating() {
            let mut progress = self.process_seek();
            progress |= self.fill_play_buffers();
            progress |= self.drain_record_buffers(false);
            if !progress {
                thread::sleep(self.idle_sleep);
            }
        }
        debug!("Buffer exchange stopping");
        self
    }

    /// Produce as many slices as the rings and the time queue have room for.
    /// Returns true if any frames were written.
    pub fn fill_play_buffers(&mut self) -> bool {
        if self.mixers.is_empty() {
            return false;
        }
        let oc = self.out_channels;
        let mut progress = false;
        let mut empty_slices = 0;

        loop {
            if self.state.terminating() {
                break;
            }
            if self.policy.done(&self.schedule) {
                self.state.set_playback_exhausted(true);
                break;
            }
            let available = self
                .writers
                .iter()
                .map(RingWriter::free_frames)
                .min()
                .unwrap_or(0)
                .min(self.time_queue.frame_room());
            if available < self.min_fill {
                break;
            }

            let start = self.schedule.track_time();
            let slice = self.policy.playback_slice(&mut self.schedule, available);
            let step = self.schedule.frame_step();
            let (time, next) =
                self.policy
                    .advanced_track_time(&self.schedule, start, slice.to_produce);
            let after = if next.is_finite() { next } else { time };

            // times go in before samples so the callback never sees frames it cannot place
            if !self.time_queue.push(start, step, slice.to_produce)
                || !self.time_queue.push(after, 0.0, slice.silence())
            {
                warn!("Time queue full, dropping a playback slice");
                break;
            }
            self.schedule.set_track_time(after);

            self.mix_buffer.resize(slice.frames * oc, 0.0);
            for (mixer, writer) in self.mixers.iter_mut().zip(&mut self.writers) {
                mixer.render(&mut self.mix_buffer, slice.to_produce, step);
                self.mix_buffer[slice.to_produce * oc..].fill(0.0);
                writer.write_frames(&self.mix_buffer[..slice.frames * oc]);
            }

            let stop = self.policy.reposition_playback(
                &mut self.schedule,
                &mut self.mixers,
                slice.frames,
                available - slice.frames,
            );

            if slice.frames > 0 {
                progress = true;
                empty_slices = 0;
            } else {
                empty_slices += 1;
            }
            if stop || empty_slices >= 2 {
                if self.policy.done(&self.schedule) {
                    self.state.set_playback_exhausted(true);
                }
                break;
            }
        }
        progress
    }

    /// Apply a pending seek. Buffered playback is thrown away and the schedule
    /// moves from the last time the callback published.
    pub fn process_seek(&mut self) -> bool {
        let Some(offset) = self.state.take_seek() else {
            return false;
        };
        if !self.sinks.is_empty() {
            debug!("Ignoring seek while recording");
            return false;
        }
        if self.mixers.is_empty() {
            return false;
        }

        self.state.set_playback_exhausted(false);
        let epoch = self.state.request_discard();
        while self.state.discard_acknowledged() < epoch {
            if self.state.terminating() {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.time_queue.restart();
        self.schedule.set_track_time(self.state.stream_time());
        let time = self.policy.offset_track_time(&mut self.schedule, offset);
        for mixer in &mut self.mixers {
            mixer.reposition(time);
        }
        self.state.publish_time(time);
        debug!("Seek by {:.3}s to {:.3}s", offset, time);
        true
    }

    /// Move captured frames into the capture tracks. Unless `final_pass`,
    /// waits until enough frames are buffered to be worth a write.
    pub fn drain_record_buffers(&mut self, final_pass: bool) -> bool {
        if self.sinks.is_empty() {
            return false;
        }
        let mut available = self
            .sinks
            .iter()
            .map(|s| s.reader.readable_frames())
            .min()
            .unwrap_or(0);
        if available == 0 || (!final_pass && available < self.min_capture) {
            return false;
        }

        if !self.recording.latency_corrected {
            self.recording.latency_corrected = true;
            let correction = self.recording.total_correction();
            if correction > 0.0 {
                let frames = (correction * self.rate).round() as usize;
                debug!("Inserting {} frames of latency compensation", frames);
                for sink in &mut self.sinks {
                    sink.scratch.clear();
                    sink.scratch.resize(frames * sink.reader.channels(), 0.0);
                    if sink.convert(frames, self.listener.as_ref()) {
                        sink.deliver(self.listener.as_ref());
                    }
                }
            }
        }

        let discard = ((self.recording.to_discard() * self.rate).round() as usize).min(available);
        if discard > 0 {
            for sink in &mut self.sinks {
                sink.reader.discard(discard);
            }
            self.recording.position += discard as f64 / self.rate;
            available -= discard;
            if available == 0 {
                return true;
            }
        }

        let mut stored = false;
        for sink in &mut self.sinks {
            let len = available * sink.reader.channels();
            sink.scratch.resize(len, 0.0);
            let read = sink.reader.read_into(&mut sink.scratch[..len]);
            if read < available {
                sink.scratch[read * sink.reader.channels()..len].fill(0.0);
            }
            if sink.convert(available, self.listener.as_ref()) {
                stored |= sink.deliver(self.listener.as_ref());
            }
        }
        self.recording.position += available as f64 / self.rate;

        if stored && let Some(listener) = &self.listener {
            listener.on_audio_io_new_blocks(&self.targets);
        }
        true
    }

    /// Drain everything left after the callback has stopped and flush the tracks
    pub fn finish(&mut self) {
        while self.drain_record_buffers(true) {}

        let mut stored = false;
        for sink in &mut self.sinks {
            sink.converted.clear();
            if let Err(e) = sink.converter.flush(&mut sink.converted) {
                sink.report(StorageError::Write(e.to_string()), self.listener.as_ref());
                continue;
            }
            stored |= sink.deliver(self.listener.as_ref());
            if let Err(e) = sink.target.flush() {
                sink.report(e, self.listener.as_ref());
            }
        }
        if stored && let Some(listener) = &self.listener {
            listener.on_audio_io_new_blocks(&self.targets);
        }
    }
}
