// src/audio/listener.rs
// Notifications from a running stream to its owner

use std::sync::Arc;

use crossbeam::channel::Sender;

use super::AudioEvent;
use super::error::StorageError;
use super::recording::LostCaptureInterval;
use super::track::RecordableTrack;

/// Receives stream lifecycle notifications.
///
/// Each method is called from a fixed thread: rate, start/stop recording,
/// commit and dropouts from the thread calling `start_stream`/`stop_stream`;
/// new blocks and storage failures from the buffer exchange thread;
/// `on_sound_activation_threshold` from the audio callback, so it must not
/// block or allocate.
pub trait AudioIoListener: Send + Sync {
    fn on_audio_io_rate(&self, _rate: u32) {}

    fn on_audio_io_start_recording(&self) {}

    /// Called after every captured sample has been flushed
    fn on_audio_io_stop_recording(&self) {}

    fn on_audio_io_new_blocks(&self, _tracks: &[Arc<dyn RecordableTrack>]) {}

    fn on_commit_recording(&self) {}

    /// Input level crossed the sound activation threshold; `active` is
    /// true when the level rose above it
    fn on_sound_activation_threshold(&self, _active: bool) {}

    fn on_capture_dropouts(&self, _intervals: &[LostCaptureInterval]) {}

    fn on_storage_failure(&self, _error: &StorageError) {}
}

/// Forwards notifications as `AudioEvent`s over a crossbeam channel.
/// Give it a bounded channel: sends never block and are dropped when full.
pub struct ChannelListener {
    sender: Sender<AudioEvent>,
}

impl ChannelListener {
    pub fn new(sender: Sender<AudioEvent>) -> Self {
        Self { sender }
    }

    pub fn shared(sender: Sender<AudioEvent>) -> Arc<dyn AudioIoListener> {
        Arc::new(Self::new(sender))
    }

    fn send(&self, event: AudioEvent) {
        let _ = self.sender.try_send(event);
    }
}

impl AudioIoListener for ChannelListener {
    fn on_audio_io_rate(&self, rate: u32) {
        self.send(AudioEvent::Rate(rate));
    }

    fn on_audio_io_start_recording(&self) {
        self.send(AudioEvent::RecordingStarted);
    }

    fn on_audio_io_stop_recording(&self) {
        self.send(AudioEvent::RecordingStopped);
    }

    fn on_audio_io_new_blocks(&self, tracks: &[Arc<dyn RecordableTrack>]) {
        self.send(AudioEvent::NewBlocks(tracks.len()));
    }

    fn on_commit_recording(&self) {
        self.send(AudioEvent::RecordingCommitted);
    }

    fn on_sound_activation_threshold(&self, active: bool) {
        self.send(AudioEvent::SoundActivation(active));
    }

    fn on_capture_dropouts(&self, intervals: &[LostCaptureInterval]) {
        self.send(AudioEvent::CaptureDropouts(intervals.to_vec()));
    }

    fn on_storage_failure(&self, error: &StorageError) {
        self.send(AudioEvent::StorageFailure(error.to_string()));
    }
}
