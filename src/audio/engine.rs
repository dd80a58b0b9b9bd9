// src/audio/engine.rs
// Stream lifecycle: builds rings, schedules, worker and callback for one stream and tears them down

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::AudioConfig;
use super::backend::{AudioBackend, DeviceFormat, DeviceRequest};
use super::callback::{AudioCallback, CaptureInput};
use super::error::{EngineError, EngineResult};
use super::io::CaptureConverter;
use super::listener::AudioIoListener;
use super::message_buffer::MessageBuffer;
use super::meter::from_db;
use super::mixer::TrackMixer;
use super::options::{OwnerId, StreamOptions};
use super::recording::{DropoutLog, LostCaptureInterval, RecordingSchedule};
use super::ring_buffer::sample_ring;
use super::schedule::{PlaybackControls, PlaybackSchedule};
use super::state::{StreamState, StreamStats};
use super::time_queue::time_queue;
use super::track::TransportTracks;
use super::worker::{BufferExchange, CaptureSink};

/// Identifies one started stream. Zero means no stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamToken(pub u64);

impl StreamToken {
    pub const NONE: StreamToken = StreamToken(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ActiveStream {
    token: StreamToken,
    owner: OwnerId,
    worker: Option<JoinHandle<BufferExchange>>,
    listener: Option<Arc<dyn AudioIoListener>>,
    capturing: bool,
    dropouts: Arc<DropoutLog>,
    // track time of capture frame zero
    dropout_origin: f64,
    rate: f64,
}

/// What one stream needs before the backend starts calling back
struct StreamParts {
    callback: AudioCallback,
    worker: BufferExchange,
    dropouts: Arc<DropoutLog>,
    dropout_origin: f64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the audio backend and at most one running stream
pub struct AudioEngine {
    config: AudioConfig,
    backend: Mutex<Box<dyn AudioBackend>>,
    active: Mutex<Option<ActiveStream>>,
    state: Arc<StreamState>,
    // the worker is the only reader of the mailbox; writers hold `control_values`
    controls: Arc<MessageBuffer<PlaybackControls>>,
    control_values: Mutex<PlaybackControls>,
    live_rings: Arc<AtomicUsize>,
    next_token: AtomicU64,
    last_error: Mutex<Option<EngineError>>,
    last_dropouts: Mutex<Vec<LostCaptureInterval>>,
}

impl AudioEngine {
    pub fn new(config: AudioConfig, backend: Box<dyn AudioBackend>) -> Self {
        debug!("Audio engine on '{}' backend: {:?}", backend.name(), config);
        Self {
            config,
            backend: Mutex::new(backend),
            active: Mutex::new(None),
            state: Arc::new(StreamState::new()),
            controls: Arc::new(MessageBuffer::new()),
            control_values: Mutex::new(PlaybackControls::default()),
            live_rings: Arc::new(AtomicUsize::new(0)),
            next_token: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_dropouts: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Start playing `tracks.playback` from `t0` towards `t1` (backwards if
    /// `t1 < t0`) and recording into `tracks.capture`. With no playback,
    /// `t1` may be infinite to record until stopped.
    pub fn start_stream(
        &self,
        tracks: TransportTracks,
        t0: f64,
        t1: f64,
        options: StreamOptions,
    ) -> EngineResult<StreamToken> {
        let mut active = lock(&self.active);
        if let Some(stream) = active.as_ref() {
            if stream.owner != options.owner {
                debug!(
                    "Refusing stream for {:?}: {} owned by {:?}",
                    options.owner, stream.token, stream.owner
                );
                return Err(EngineError::StreamBusy);
            }
            info!("Restarting stream {} for the same owner", stream.token);
            self.stop_locked(&mut active);
        }

        Self::validate(&tracks, t0, t1, &options)?;

        let rate = if options.rate > 0 {
            options.rate
        } else {
            self.config.sample_rate
        };
        let request = DeviceRequest {
            rate,
            buffer_frames: self.config.buffer_size,
            input_channels: tracks.input_channels_needed(),
            output_channels: self.config.output_channels,
            input_device: self.config.input_device.clone(),
            output_device: self.config.output_device.clone(),
        };

        let mut backend = lock(&self.backend);
        let format = match backend.open(&request) {
            Ok(format) => format,
            Err(e) => return Err(self.fail(e)),
        };
        if format.input_channels < request.input_channels {
            backend.close();
            return Err(self.fail(EngineError::UnsupportedFormat(format!(
                "{} input channels needed, device opened {}",
                request.input_channels, format.input_channels
            ))));
        }
        if format.rate != rate {
            info!("Device runs at {}Hz instead of {}Hz", format.rate, rate);
        }

        let token = StreamToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        let capturing = !tracks.capture.is_empty();
        let parts = match self.build(&tracks, t0, t1, &options, &format, token) {
            Ok(parts) => parts,
            Err(e) => {
                backend.close();
                return Err(self.fail(e));
            }
        };
        let StreamParts {
            mut callback,
            mut worker,
            dropouts,
            dropout_origin,
        } = parts;

        worker.fill_play_buffers();
        if let Some(listener) = &options.listener {
            listener.on_audio_io_rate(format.rate);
        }

        let handle = match thread::Builder::new()
            .name("trackio-exchange".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                backend.close();
                return Err(self.fail(EngineError::WorkerSpawn(e.to_string())));
            }
        };

        self.state.set_token(token.0);
        self.state.set_busy(true);
        if let Err(e) = backend.start(Box::new(move |input, output, status| {
            callback.process(input, output, status)
        })) {
            self.state.request_terminate();
            backend.close();
            if handle.join().is_err() {
                error!("Buffer exchange thread panicked");
            }
            self.state.set_token(0);
            self.state.set_busy(false);
            return Err(self.fail(e));
        }
        drop(backend);

        if capturing && let Some(listener) = &options.listener {
            listener.on_audio_io_start_recording();
        }
        info!(
            "Stream {} started: {:.3}s -> {:.3}s at {}Hz, {} playback, {} capture",
            token,
            t0,
            t1,
            format.rate,
            tracks.playback.len() + tracks.other_playable.len() + tracks.preroll.len(),
            tracks.capture.len()
        );

        *active = Some(ActiveStream {
            token,
            owner: options.owner,
            worker: Some(handle),
            listener: options.listener.clone(),
            capturing,
            dropouts,
            dropout_origin,
            rate: format.rate as f64,
        });
        Ok(token)
    }

    fn validate(tracks: &TransportTracks, t0: f64, t1: f64, options: &StreamOptions) -> EngineResult<()> {
        if tracks.is_empty() {
            return Err(EngineError::NoTracks);
        }
        if !t0.is_finite() || t1.is_nan() {
            return Err(EngineError::InvalidRange(format!("{t0} -> {t1}")));
        }
        if tracks.has_playback() && !t1.is_finite() {
            return Err(EngineError::InvalidRange(
                "playback needs a finite end time".into(),
            ));
        }
        if !options.pre_roll.is_finite() || options.pre_roll < 0.0 {
            return Err(EngineError::InvalidRange(format!(
                "pre-roll {}",
                options.pre_roll
            )));
        }
        if !options.play_speed.is_finite() || options.play_speed <= 0.0 {
            return Err(EngineError::InvalidRange(format!(
                "play speed {}",
                options.play_speed
            )));
        }
        Ok(())
    }

    fn build(
        &self,
        tracks: &TransportTracks,
        t0: f64,
        t1: f64,
        options: &StreamOptions,
        format: &DeviceFormat,
        token: StreamToken,
    ) -> EngineResult<StreamParts> {
        let rate = format.rate as f64;
        let out_channels = format.output_channels.max(1);
        let capturing = !tracks.capture.is_empty();
        let pre_roll = if capturing && t1 >= t0 {
            options.pre_roll
        } else {
            0.0
        };
        let start = t0 - pre_roll;

        let period = format.buffer_frames.max(1);
        let play_frames = ((self.config.playback_ring_secs * rate) as usize).max(period * 4);
        let capture_frames = ((self.config.capture_ring_secs * rate) as usize).max(period * 4);
        let grain = self.config.time_queue_grain.max(1);

        self.update_controls(|controls| {
            *controls = PlaybackControls {
                speed: options.play_speed,
                loop_enabled: options.loop_enabled,
            }
        });
        let mut schedule = PlaybackSchedule::new(start, t1, rate, grain)
            .with_controls(Arc::clone(&self.controls));
        schedule.set_speed(options.play_speed);
        let mut policy = options.policy();
        policy.initialize(&mut schedule, rate);
        if let Some(start_time) = options.start_time {
            let offset = start_time - schedule.track_time();
            policy.offset_track_time(&mut schedule, offset);
        }
        let begin = schedule.track_time();
        self.state.reset(begin);

        let mut readers = Vec::new();
        let mut playback = Vec::new();
        let sources = tracks.playback.iter().chain(&tracks.other_playable);
        for track in sources {
            let (writer, reader) = sample_ring(play_frames, out_channels, &self.live_rings);
            playback.push((TrackMixer::new(Arc::clone(track), begin, out_channels), writer));
            readers.push(reader);
        }
        for track in &tracks.preroll {
            let (writer, reader) = sample_ring(play_frames, out_channels, &self.live_rings);
            let mixer = TrackMixer::new(Arc::clone(track), begin, out_channels).audible_until(t0);
            playback.push((mixer, writer));
            readers.push(reader);
        }

        let mut inputs = Vec::new();
        let mut sinks = Vec::new();
        for capture in &tracks.capture {
            let channels = capture.target.channels();
            let converter = CaptureConverter::new(
                rate,
                capture.target.rate(),
                channels,
                capture.target.sample_format(),
            )
            .map_err(|e| EngineError::UnsupportedFormat(e.to_string()))?;
            let (writer, reader) = sample_ring(capture_frames, channels, &self.live_rings);
            inputs.push(CaptureInput::new(writer, capture.first_input_channel));
            sinks.push(CaptureSink::new(
                Arc::clone(&capture.target),
                reader,
                converter,
                capture.crossfade.clone(),
            ));
        }

        let (producer, consumer) = time_queue(play_frames, grain, begin);
        let consumer = if playback.is_empty() {
            consumer.free_running(rate)
        } else {
            consumer
        };

        let correction = match &options.latency {
            Some(calibration) => calibration.correction(format),
            None => self.config.latency_correction_ms / 1000.0,
        };
        let duration = if t1.is_finite() {
            (t1 - t0).abs()
        } else {
            f64::INFINITY
        };
        let recording = RecordingSchedule::new(pre_roll, correction, duration);
        let dropouts = Arc::new(DropoutLog::new(self.config.max_dropout_intervals));
        debug!(
            "Stream {} rings: {} playback x {} frames, {} capture x {} frames, latency correction {:.4}s",
            token,
            readers.len(),
            play_frames,
            inputs.len(),
            capture_frames,
            correction
        );

        let callback = AudioCallback::new(
            Arc::clone(&self.state),
            token.0,
            out_channels,
            format.input_channels,
            readers,
            inputs,
            consumer,
            start,
            t1,
            Arc::clone(&dropouts),
        )
        .with_meters(options.capture_meter.clone(), options.playback_meter.clone())
        .with_sound_activation(
            options.listener.clone(),
            options.sound_activation_level.map(from_db),
        );

        let min_fill = (self.config.min_fill_secs * rate) as usize;
        let min_capture = (self.config.min_capture_secs * rate) as usize;
        let worker = BufferExchange::new(
            Arc::clone(&self.state),
            schedule,
            policy,
            playback,
            producer,
            sinks,
            recording,
            options.listener.clone(),
            out_channels,
        )
        .with_thresholds(min_fill, min_capture)
        .with_idle_sleep(Duration::from_millis(self.config.worker_sleep_ms.max(1)));

        Ok(StreamParts {
            callback,
            worker,
            dropouts,
            dropout_origin: start + correction,
        })
    }

    fn fail(&self, e: EngineError) -> EngineError {
        error!("Failed to start stream: {}", e);
        *lock(&self.last_error) = Some(e.clone());
        e
    }

    /// Stop the stream, finish any recording and notify the listener.
    /// Does nothing when no stream runs.
    pub fn stop_stream(&self) {
        let mut active = lock(&self.active);
        self.stop_locked(&mut active);
    }

    fn stop_locked(&self, active: &mut Option<ActiveStream>) {
        let Some(mut stream) = active.take() else {
            return;
        };
        self.state.request_terminate();
        lock(&self.backend).close();

        let worker = stream.worker.take().and_then(|handle| match handle.join() {
            Ok(worker) => Some(worker),
            Err(_) => {
                error!("Buffer exchange thread panicked");
                None
            }
        });
        if let Some(mut worker) = worker {
            worker.finish();
        }

        let listener = stream.listener.as_ref();
        if stream.capturing
            && let Some(listener) = listener
        {
            listener.on_audio_io_stop_recording();
        }

        let intervals = stream.dropouts.intervals(stream.dropout_origin, stream.rate);
        if !intervals.is_empty() {
            warn!(
                "Stream {} lost {} capture frames in {} intervals{}",
                stream.token,
                stream.dropouts.lost_frames(),
                intervals.len(),
                if stream.dropouts.overflowed() {
                    " (log full, some merged)"
                } else {
                    ""
                }
            );
            if let Some(listener) = listener {
                listener.on_capture_dropouts(&intervals);
            }
        }
        *lock(&self.last_dropouts) = intervals;

        if stream.capturing
            && let Some(listener) = listener
        {
            listener.on_commit_recording();
        }

        let stats = self.state.stats();
        self.state.set_token(0);
        self.state.set_busy(false);
        info!(
            "Stream {} stopped: {} callbacks, {} underrun frames, {} late at the driver",
            stream.token, stats.callbacks, stats.underrun_frames, stats.driver_underflow_frames
        );
    }

    /// Stop the stream if its callback reported the end of the range.
    /// Returns true if a stream was stopped.
    pub fn poll_completion(&self) -> bool {
        if !self.state.completed() {
            return false;
        }
        let mut active = lock(&self.active);
        if active.is_none() {
            return false;
        }
        debug!("Stream reached its end");
        self.stop_locked(&mut active);
        true
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn stream_token(&self) -> StreamToken {
        StreamToken(self.state.token())
    }

    pub fn is_stream_active(&self, token: StreamToken) -> bool {
        !token.is_none() && self.state.token() == token.0
    }

    /// Track time of the audio now leaving the output
    pub fn stream_time(&self) -> Option<f64> {
        if self.state.token() == 0 {
            None
        } else {
            Some(self.state.stream_time())
        }
    }

    pub fn pause(&self, paused: bool) {
        self.state.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Move playback by `offset` seconds. A newer request replaces one not yet applied.
    pub fn seek_stream(&self, offset: f64) {
        if offset.is_finite() && self.state.is_busy() {
            self.state.request_seek(offset);
        }
    }

    /// Takes effect if the stream was started with variable speed
    pub fn set_play_speed(&self, speed: f64) {
        self.update_controls(|controls| controls.speed = speed);
    }

    pub fn set_looping(&self, loop_enabled: bool) {
        self.update_controls(|controls| controls.loop_enabled = loop_enabled);
    }

    fn update_controls(&self, change: impl FnOnce(&mut PlaybackControls)) {
        let mut values = lock(&self.control_values);
        change(&mut values);
        self.controls.write(*values);
    }

    pub fn stream_stats(&self) -> StreamStats {
        self.state.stats()
    }

    /// Rings with at least one half still alive
    pub fn allocated_ring_buffers(&self) -> usize {
        self.live_rings.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<EngineError> {
        lock(&self.last_error).clone()
    }

    /// Lost capture intervals of the last stopped stream
    pub fn last_dropouts(&self) -> Vec<LostCaptureInterval> {
        lock(&self.last_dropouts).clone()
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop_stream();
    }
}
