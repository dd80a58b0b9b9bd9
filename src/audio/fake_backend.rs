// src/audio/fake_backend.rs
// Deterministic backend: buffers are processed only when the test driver asks for them

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::backend::{AudioBackend, CallbackStatus, DeviceFormat, DeviceRequest, ProcessFn};
use super::error::{EngineError, EngineResult};

type InputFn = Box<dyn FnMut(u64, usize) -> f32 + Send>;

struct FakeState {
    format: Option<DeviceFormat>,
    process: Option<ProcessFn>,
    fail_open: Option<String>,
    forced_rate: Option<u32>,
    device_inputs: usize,
    latency: (f64, f64),
    statuses: HashMap<u64, CallbackStatus>,
    buffers_run: u64,
    input: Option<InputFn>,
    input_buffer: Vec<f32>,
    output_buffer: Vec<f32>,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend half handed to the engine
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side handle that pumps buffers through the installed closure
#[derive(Clone)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

pub fn fake_backend() -> (FakeBackend, FakeDriver) {
    let state = Arc::new(Mutex::new(FakeState {
        format: None,
        process: None,
        fail_open: None,
        forced_rate: None,
        device_inputs: 2,
        latency: (0.0, 0.0),
        statuses: HashMap::new(),
        buffers_run: 0,
        input: None,
        input_buffer: Vec::new(),
        output_buffer: Vec::new(),
    }));
    (
        FakeBackend {
            state: Arc::clone(&state),
        },
        FakeDriver { state },
    )
}

impl AudioBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn open(&mut self, request: &DeviceRequest) -> EngineResult<DeviceFormat> {
        let mut state = lock(&self.state);
        state.process = None;
        state.format = None;
        if let Some(message) = state.fail_open.take() {
            return Err(EngineError::DeviceOpen(message));
        }
        if request.input_channels > state.device_inputs {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} input channels requested, device has {}",
                request.input_channels, state.device_inputs
            )));
        }

        let format = DeviceFormat {
            rate: state.forced_rate.unwrap_or(request.rate),
            buffer_frames: request.buffer_frames.max(1),
            input_channels: if request.input_channels > 0 {
                state.device_inputs
            } else {
                0
            },
            output_channels: request.output_channels.max(1),
            input_latency: state.latency.0,
            output_latency: state.latency.1,
        };
        state.input_buffer = vec![0.0; format.buffer_frames * format.input_channels];
        state.output_buffer = vec![0.0; format.buffer_frames * format.output_channels];
        state.format = Some(format.clone());
        Ok(format)
    }

    fn start(&mut self, process: ProcessFn) -> EngineResult<()> {
        let mut state = lock(&self.state);
        if state.format.is_none() {
            return Err(EngineError::Backend("start before open".into()));
        }
        state.process = Some(process);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.process = None;
        state.format = None;
    }

    fn is_open(&self) -> bool {
        lock(&self.state).format.is_some()
    }
}

impl FakeDriver {
    /// The next `open` fails with this message
    pub fn fail_next_open(&self, message: impl Into<String>) {
        lock(&self.state).fail_open = Some(message.into());
    }

    /// Open at this rate whatever is requested
    pub fn force_rate(&self, rate: u32) {
        lock(&self.state).forced_rate = Some(rate);
    }

    pub fn set_device_inputs(&self, channels: usize) {
        lock(&self.state).device_inputs = channels;
    }

    pub fn set_latency(&self, input: f64, output: f64) {
        lock(&self.state).latency = (input, output);
    }

    /// Input sample for (absolute frame, channel)
    pub fn set_input(&self, input: impl FnMut(u64, usize) -> f32 + Send + 'static) {
        lock(&self.state).input = Some(Box::new(input));
    }

    /// Report `status` with the buffer of this index (counted from the first buffer ever run)
    pub fn set_status_at(&self, buffer: u64, status: CallbackStatus) {
        lock(&self.state).statuses.insert(buffer, status);
    }

    pub fn buffers_run(&self) -> u64 {
        lock(&self.state).buffers_run
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).process.is_some()
    }

    pub fn format(&self) -> Option<DeviceFormat> {
        lock(&self.state).format.clone()
    }

    /// Run `count` driver periods and return the concatenated output.
    /// Returns nothing if no stream is started.
    pub fn run_buffers(&self, count: usize) -> Vec<f32> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let Some(format) = state.format.clone() else {
            return Vec::new();
        };
        let Some(process) = state.process.as_mut() else {
            return Vec::new();
        };

        let frames = format.buffer_frames;
        let mut collected = Vec::with_capacity(count * state.output_buffer.len());
        for _ in 0..count {
            let first_frame = state.buffers_run * frames as u64;
            for (i, sample) in state.input_buffer.iter_mut().enumerate() {
                let frame = first_frame + (i / format.input_channels) as u64;
                let channel = i % format.input_channels;
                *sample = match state.input.as_mut() {
                    Some(input) => input(frame, channel),
                    None => 0.0,
                };
            }

            let status = state
                .statuses
                .remove(&state.buffers_run)
                .unwrap_or_default();
            process(&state.input_buffer, &mut state.output_buffer, status);
            collected.extend_from_slice(&state.output_buffer);
            state.buffers_run += 1;
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> DeviceRequest {
        DeviceRequest {
            rate: 1000,
            buffer_frames: 4,
            input_channels: 1,
            output_channels: 2,
            input_device: None,
            output_device: None,
        }
    }

    #[test]
    fn test_runs_only_when_pumped() {
        let (mut backend, driver) = fake_backend();
        assert!(driver.run_buffers(3).is_empty());

        let format = backend.open(&request()).unwrap();
        assert_eq!(format.rate, 1000);
        assert_eq!(format.input_channels, 2);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        driver.set_input(|frame, channel| frame as f32 + channel as f32 * 0.5);
        backend
            .start(Box::new(move |input, output, _| {
                counter.fetch_add(1, Ordering::Relaxed);
                output.copy_from_slice(&input[..output.len()]);
            }))
            .unwrap();

        let out = driver.run_buffers(2);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[8..12], &[4.0, 4.5, 5.0, 5.5]);

        backend.close();
        assert!(!driver.is_running());
        assert!(driver.run_buffers(1).is_empty());
    }

    #[test]
    fn test_status_and_failures() {
        let (mut backend, driver) = fake_backend();
        driver.fail_next_open("no device");
        assert_eq!(
            backend.open(&request()),
            Err(EngineError::DeviceOpen("no device".into()))
        );

        backend.open(&request()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        backend
            .start(Box::new(move |_, _, status| {
                log.lock().unwrap().push(status.input_overflow)
            }))
            .unwrap();
        driver.set_status_at(
            1,
            CallbackStatus {
                input_overflow: true,
                output_underflow: false,
            },
        );
        driver.run_buffers(3);
        assert_eq!(*seen.lock().unwrap(), vec![false, true, false]);
    }
}
