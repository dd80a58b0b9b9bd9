// src/audio/ring_buffer.rs
// Frame-oriented SPSC sample rings shared between the audio callback and the buffer exchange thread

use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::mixer::add_scaled;

/// Held by both halves of a ring; the live count drops when the last half goes away
struct Allocation {
    live: Arc<AtomicUsize>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Allocate a ring holding `capacity_frames` interleaved frames of `channels` samples.
/// `live` counts rings that still have at least one half alive.
pub fn sample_ring(
    capacity_frames: usize,
    channels: usize,
    live: &Arc<AtomicUsize>,
) -> (RingWriter, RingReader) {
    let channels = channels.max(1);
    let capacity_frames = capacity_frames.max(1);
    let (producer, consumer) = RingBuffer::new(capacity_frames * channels);

    live.fetch_add(1, Ordering::AcqRel);
    let allocation = Arc::new(Allocation {
        live: Arc::clone(live),
    });

    (
        RingWriter {
            producer,
            channels,
            capacity_frames,
            _allocation: Arc::clone(&allocation),
        },
        RingReader {
            consumer,
            channels,
            capacity_frames,
            _allocation: allocation,
        },
    )
}

/// Producer half. Never blocks; short writes report how many frames fit.
pub struct RingWriter {
    producer: Producer<f32>,
    channels: usize,
    capacity_frames: usize,
    _allocation: Arc<Allocation>,
}

impl RingWriter {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn free_frames(&self) -> usize {
        self.producer.slots() / self.channels
    }

    /// Write whole interleaved frames from `samples`, returns frames written
    pub fn write_frames(&mut self, samples: &[f32]) -> usize {
        let frames = (samples.len() / self.channels).min(self.free_frames());
        if frames == 0 {
            return 0;
        }
        let len = frames * self.channels;
        match self.producer.write_chunk(len) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&samples[..split]);
                second.copy_from_slice(&samples[split..len]);
                chunk.commit_all();
                frames
            }
            Err(_) => 0,
        }
    }

    /// Write up to `frames` frames of silence, returns frames written
    pub fn write_silence(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.free_frames());
        if frames == 0 {
            return 0;
        }
        match self.producer.write_chunk(frames * self.channels) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                first.fill(0.0);
                second.fill(0.0);
                chunk.commit_all();
                frames
            }
            Err(_) => 0,
        }
    }

    /// Gather `frames` frames out of a wider interleaved input, starting at
    /// `first_channel`. Channels missing from the input are written as zero.
    pub fn write_from_interleaved(
        &mut self,
        input: &[f32],
        input_channels: usize,
        first_channel: usize,
        frames: usize,
    ) -> usize {
        let frames = frames.min(self.free_frames());
        if frames == 0 {
            return 0;
        }
        let channels = self.channels;
        match self.producer.write_chunk(frames * channels) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                for (i, slot) in first.iter_mut().chain(second.iter_mut()).enumerate() {
                    let frame = i / channels;
                    let channel = first_channel + i % channels;
                    *slot = if channel < input_channels {
                        input
                            .get(frame * input_channels + channel)
                            .copied()
                            .unwrap_or(0.0)
                    } else {
                        0.0
                    };
                }
                chunk.commit_all();
                frames
            }
            Err(_) => 0,
        }
    }
}

/// Consumer half
pub struct RingReader {
    consumer: Consumer<f32>,
    channels: usize,
    capacity_frames: usize,
    _allocation: Arc<Allocation>,
}

impl RingReader {
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn readable_frames(&self) -> usize {
        self.consumer.slots() / self.channels
    }

    /// Copy up to `dest.len() / channels` frames into `dest`, returns frames read
    pub fn read_into(&mut self, dest: &mut [f32]) -> usize {
        let frames = (dest.len() / self.channels).min(self.readable_frames());
        if frames == 0 {
            return 0;
        }
        let len = frames * self.channels;
        match self.consumer.read_chunk(len) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                let split = first.len();
                dest[..split].copy_from_slice(first);
                dest[split..len].copy_from_slice(second);
                chunk.commit_all();
                frames
            }
            Err(_) => 0,
        }
    }

    /// Sum `frames` frames into the front of `dest`, returns frames mixed
    pub fn mix_into(&mut self, dest: &mut [f32], frames: usize) -> usize {
        let frames = frames
            .min(self.readable_frames())
            .min(dest.len() / self.channels);
        if frames == 0 {
            return 0;
        }
        let len = frames * self.channels;
        match self.consumer.read_chunk(len) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                let split = first.len();
                add_scaled(&mut dest[..split], first, 1.0);
                add_scaled(&mut dest[split..len], second, 1.0);
                chunk.commit_all();
                frames
            }
            Err(_) => 0,
        }
    }

    /// Drop up to `frames` frames without reading them
    pub fn discard(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.readable_frames());
        if frames == 0 {
            return 0;
        }
        match self.consumer.read_chunk(frames * self.channels) {
            Ok(chunk) => {
                chunk.commit_all();
                frames
            }
            Err(_) => 0,
        }
    }

    pub fn discard_all(&mut self) -> usize {
        self.discard(usize::MAX / self.channels)
    }
}
