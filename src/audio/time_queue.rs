// src/audio/time_queue.rs
// Maps consumed playback frames back to track time without the callback ever waiting on the worker

use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// One run of frames whose track time advances linearly
struct TimeRecord {
    time: AtomicU64,
    step: AtomicU64,
    frames: AtomicU32,
}

impl TimeRecord {
    fn empty() -> Self {
        Self {
            time: AtomicU64::new(0f64.to_bits()),
            step: AtomicU64::new(0f64.to_bits()),
            frames: AtomicU32::new(0),
        }
    }

    fn time_at(&self, offset: usize) -> f64 {
        let time = f64::from_bits(self.time.load(Ordering::Relaxed));
        let step = f64::from_bits(self.step.load(Ordering::Relaxed));
        time + step * offset as f64
    }
}

struct Shared {
    records: Box<[TimeRecord]>,
    // counts of records ever opened / fully consumed; index is count % len
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

/// Create a queue able to describe `capacity_frames` buffered frames at the given grain
pub fn time_queue(
    capacity_frames: usize,
    grain: usize,
    start_time: f64,
) -> (TimeQueueProducer, TimeQueueConsumer) {
    let grain = grain.max(1);
    // two partial records per slice on top of the full grains
    let len = capacity_frames.div_ceil(grain) * 2 + 8;
    let records = (0..len).map(|_| TimeRecord::empty()).collect();
    let shared = Arc::new(Shared {
        records,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });

    (
        TimeQueueProducer {
            shared: Arc::clone(&shared),
            grain,
            head: 0,
            open: None,
        },
        TimeQueueConsumer {
            shared,
            tail: 0,
            offset: 0,
            last_time: start_time,
            free_run_rate: None,
        },
    )
}

#[derive(Debug, Clone, Copy)]
struct OpenRecord {
    time: f64,
    step: f64,
    frames: usize,
}

impl OpenRecord {
    fn continues(&self, time: f64, step: f64) -> bool {
        if self.step.to_bits() != step.to_bits() {
            return false;
        }
        let expected = self.time + self.step * self.frames as f64;
        (expected - time).abs() <= self.step.abs() * 0.5 + 1e-12
    }
}

/// Worker side. Must push the times for a slice before writing its samples
/// to the rings, so the ring's release publishes both.
pub struct TimeQueueProducer {
    shared: Arc<Shared>,
    grain: usize,
    head: usize,
    open: Option<OpenRecord>,
}

impl TimeQueueProducer {
    pub fn grain(&self) -> usize {
        self.grain
    }

    /// Records the consumer has not released yet
    pub fn free_records(&self) -> usize {
        let tail = self.shared.tail.load(Ordering::Acquire);
        self.shared.records.len() - (self.head - tail)
    }

    /// Frames that can be pushed in one slice without running out of records
    pub fn frame_room(&self) -> usize {
        self.free_records().saturating_sub(3) * self.grain
    }

    /// Append `frames` frames starting at track time `time` and moving `step`
    /// seconds per frame. Returns false if the queue ran out of records.
    pub fn push(&mut self, mut time: f64, step: f64, mut frames: usize) -> bool {
        while frames > 0 {
            let room = match self.open {
                Some(open) if open.frames < self.grain && open.continues(time, step) => {
                    self.grain - open.frames
                }
                _ => {
                    if !self.open_record(time, step) {
                        return false;
                    }
                    self.grain
                }
            };

            let n = room.min(frames);
            if let Some(open) = self.open.as_mut() {
                open.frames += n;
                let idx = (self.head - 1) % self.shared.records.len();
                self.shared.records[idx]
                    .frames
                    .store(open.frames as u32, Ordering::Release);
            }
            time += step * n as f64;
            frames -= n;
        }
        true
    }

    /// Forget the open record so the next push starts a new one
    pub fn restart(&mut self) {
        self.open = None;
    }

    fn open_record(&mut self, time: f64, step: f64) -> bool {
        if self.free_records() == 0 {
            return false;
        }
        let idx = self.head % self.shared.records.len();
        let record = &self.shared.records[idx];
        record.time.store(time.to_bits(), Ordering::Relaxed);
        record.step.store(step.to_bits(), Ordering::Relaxed);
        record.frames.store(0, Ordering::Relaxed);
        self.head += 1;
        self.shared.head.store(self.head, Ordering::Release);
        self.open = Some(OpenRecord {
            time,
            step,
            frames: 0,
        });
        true
    }
}

/// Callback side
pub struct TimeQueueConsumer {
    shared: Arc<Shared>,
    tail: usize,
    offset: usize,
    last_time: f64,
    free_run_rate: Option<f64>,
}

impl TimeQueueConsumer {
    /// No playback feeds the queue; time simply advances with the device clock
    pub fn free_running(mut self, rate: f64) -> Self {
        self.free_run_rate = Some(rate);
        self
    }

    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    /// Advance past `frames` consumed frames and return the track time of the
    /// first of them
    pub fn consume(&mut self, frames: usize) -> f64 {
        if let Some(rate) = self.free_run_rate {
            let start = self.last_time;
            self.last_time += frames as f64 / rate;
            return start;
        }

        let len = self.shared.records.len();
        let start = if self.tail < self.shared.head.load(Ordering::Acquire) {
            self.shared.records[self.tail % len].time_at(self.offset)
        } else {
            self.last_time
        };
        let mut remaining = frames;
        loop {
            let head = self.shared.head.load(Ordering::Acquire);
            if self.tail == head {
                break;
            }
            let record = &self.shared.records[self.tail % len];
            let filled = record.frames.load(Ordering::Acquire) as usize;

            let available = filled - self.offset.min(filled);
            if remaining < available {
                self.offset += remaining;
                self.last_time = record.time_at(self.offset);
                break;
            }
            remaining -= available;
            self.offset = filled;
            self.last_time = record.time_at(filled);

            // the newest record may still grow
            if self.tail + 1 == head {
                break;
            }
            self.tail += 1;
            self.offset = 0;
            self.shared.tail.store(self.tail, Ordering::Release);
            let next = &self.shared.records[self.tail % len];
            self.last_time = next.time_at(0);
            if remaining == 0 {
                break;
            }
        }
        start
    }

    /// Drop every pending record. The producer must call `restart` before pushing again.
    pub fn discard_all(&mut self) {
        let head = self.shared.head.load(Ordering::Acquire);
        if head > self.tail {
            let record = &self.shared.records[(head - 1) % self.shared.records.len()];
            let filled = record.frames.load(Ordering::Acquire) as usize;
            self.last_time = record.time_at(filled);
        }
        self.tail = head;
        self.offset = 0;
        self.shared.tail.store(head, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 1000.0;

    #[test]
    fn test_interpolates_within_grain() {
        let (mut producer, mut consumer) = time_queue(10_000, 100, 0.0);
        assert!(producer.push(1.0, 1.0 / RATE, 250));

        assert_eq!(consumer.consume(50), 1.0);
        assert!((consumer.consume(50) - 1.05).abs() < 1e-9);
        // crosses into the second record
        assert!((consumer.consume(100) - 1.1).abs() < 1e-9);
        assert!((consumer.last_time() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_jump_starts_new_record() {
        let (mut producer, mut consumer) = time_queue(10_000, 100, 0.0);
        producer.push(0.0, 1.0 / RATE, 50);
        // discontinuity: continue from 3.0
        producer.push(3.0, 1.0 / RATE, 50);

        assert_eq!(consumer.consume(50), 0.0);
        assert!((consumer.consume(10) - 3.0).abs() < 1e-9);
        assert!((consumer.consume(10) - 3.01).abs() < 1e-9);
    }

    #[test]
    fn test_frozen_padding() {
        let (mut producer, mut consumer) = time_queue(10_000, 100, 0.0);
        producer.push(0.9, 1.0 / RATE, 100);
        producer.push(1.0, 0.0, 101);

        consumer.consume(100);
        assert_eq!(consumer.consume(60), 1.0);
        assert_eq!(consumer.consume(41), 1.0);
        assert_eq!(consumer.last_time(), 1.0);
    }

    #[test]
    fn test_underrun_holds_time() {
        let (mut producer, mut consumer) = time_queue(10_000, 100, 2.0);
        assert_eq!(consumer.consume(64), 2.0);

        producer.push(2.0, 1.0 / RATE, 30);
        assert_eq!(consumer.consume(64), 2.0);
        assert!((consumer.last_time() - 2.03).abs() < 1e-9);

        // the open record keeps growing and the consumer picks up where it stopped
        producer.push(2.03, 1.0 / RATE, 30);
        assert!((consumer.consume(10) - 2.03).abs() < 1e-9);
    }

    #[test]
    fn test_records_are_recycled() {
        let (mut producer, mut consumer) = time_queue(400, 100, 0.0);
        let capacity = producer.free_records();
        let mut time = 0.0;
        for _ in 0..50 {
            assert!(producer.push(time, 1.0 / RATE, 300));
            let start = consumer.consume(300);
            assert!((start - time).abs() < 1e-9);
            time += 0.3;
        }
        assert!(producer.free_records() >= capacity - 1);
    }

    #[test]
    fn test_discard_all_realigns() {
        let (mut producer, mut consumer) = time_queue(10_000, 100, 0.0);
        producer.push(0.0, 1.0 / RATE, 500);
        consumer.consume(100);
        consumer.discard_all();
        assert!((consumer.last_time() - 0.5).abs() < 1e-9);

        producer.restart();
        producer.push(7.0, 1.0 / RATE, 100);
        assert!((consumer.consume(10) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_free_running() {
        let (_producer, consumer) = time_queue(1000, 100, 1.0);
        let mut consumer = consumer.free_running(RATE);
        assert_eq!(consumer.consume(500), 1.0);
        assert_eq!(consumer.consume(500), 1.5);
        assert_eq!(consumer.last_time(), 2.0);
    }
}
