// src/audio/cpal_backend.rs
// Audio backend on real devices through cpal. Input and output run as separate cpal streams
// joined by a lock-free bridge; the output callback drives processing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleFormat, SampleRate, Stream, StreamConfig};
use crossbeam::channel::{self, Sender};
use tracing::{debug, info, warn};

use super::backend::{AudioBackend, CallbackStatus, DeviceFormat, DeviceRequest, ProcessFn};
use super::error::{EngineError, EngineResult};

// bridge depth in driver periods
const BRIDGE_PERIODS: usize = 8;
// largest period the output callback is prepared for without allocating
const MAX_PERIOD_FRAMES: usize = 8192;

/// Device names resolved at open time; streams are rebuilt from them on the device thread
#[derive(Debug, Clone)]
struct OpenDevices {
    input: Option<(String, StreamConfig)>,
    output: (String, StreamConfig),
    format: DeviceFormat,
}

pub struct CpalBackend {
    open: Option<OpenDevices>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            open: None,
            stop: None,
            thread: None,
        }
    }

    fn stop_thread(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Audio device thread panicked");
        }
    }
}

fn find_device(host: &Host, name: Option<&str>, input: bool) -> EngineResult<Device> {
    let kind = if input { "input" } else { "output" };
    let Some(name) = name else {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| EngineError::DeviceOpen(format!("No {kind} device available")));
    };

    let devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    };
    for device in devices.map_err(|e| EngineError::DeviceOpen(e.to_string()))? {
        if let Ok(device_name) = device.name()
            && device_name == name
        {
            return Ok(device);
        }
    }
    Err(EngineError::DeviceNotFound(format!("{kind} '{name}'")))
}

fn supports_rate(ranges: &[cpal::SupportedStreamConfigRange], rate: u32, channels: u16) -> bool {
    ranges.iter().any(|r| {
        r.sample_format() == SampleFormat::F32
            && r.channels() == channels
            && rate >= r.min_sample_rate().0
            && rate <= r.max_sample_rate().0
    })
}

fn buffer_size_for(frames: usize, supported: &cpal::SupportedBufferSize) -> BufferSize {
    match supported {
        cpal::SupportedBufferSize::Range { min, max }
            if (*min as usize..=*max as usize).contains(&frames) =>
        {
            BufferSize::Fixed(frames as u32)
        }
        _ => BufferSize::Default,
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(&mut self, request: &DeviceRequest) -> EngineResult<DeviceFormat> {
        self.close();
        let host = cpal::default_host();
        let open_err = |e: &dyn std::fmt::Display| EngineError::DeviceOpen(e.to_string());

        let output = find_device(&host, request.output_device.as_deref(), false)?;
        let output_name = output.name().unwrap_or_else(|_| "Unknown".to_string());
        let output_default = output.default_output_config().map_err(|e| open_err(&e))?;
        let output_ranges: Vec<_> = output
            .supported_output_configs()
            .map_err(|e| open_err(&e))?
            .collect();

        let wanted_channels = request.output_channels as u16;
        let (rate, out_channels) = if supports_rate(&output_ranges, request.rate, wanted_channels) {
            (request.rate, wanted_channels)
        } else {
            let rate = output_default.sample_rate().0;
            let channels = if supports_rate(&output_ranges, rate, wanted_channels) {
                wanted_channels
            } else {
                output_default.channels()
            };
            info!(
                "Output '{}' cannot run {}Hz/{}ch, using {}Hz/{}ch",
                output_name, request.rate, wanted_channels, rate, channels
            );
            (rate, channels)
        };
        let output_config = StreamConfig {
            channels: out_channels,
            sample_rate: SampleRate(rate),
            buffer_size: buffer_size_for(request.buffer_frames, output_default.buffer_size()),
        };

        let input = if request.input_channels > 0 {
            let device = find_device(&host, request.input_device.as_deref(), true)?;
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let default = device.default_input_config().map_err(|e| open_err(&e))?;
            let ranges: Vec<_> = device
                .supported_input_configs()
                .map_err(|e| open_err(&e))?
                .collect();
            let channels = default.channels();
            if (channels as usize) < request.input_channels || !supports_rate(&ranges, rate, channels)
            {
                return Err(EngineError::UnsupportedFormat(format!(
                    "Input '{}' cannot capture {} channels at {}Hz",
                    name, request.input_channels, rate
                )));
            }
            let config = StreamConfig {
                channels,
                sample_rate: SampleRate(rate),
                buffer_size: buffer_size_for(request.buffer_frames, default.buffer_size()),
            };
            Some((name, config))
        } else {
            None
        };

        let buffer_frames = match output_config.buffer_size {
            BufferSize::Fixed(frames) => frames as usize,
            BufferSize::Default => request.buffer_frames.max(1),
        };
        let period = buffer_frames as f64 / rate as f64;
        let format = DeviceFormat {
            rate,
            buffer_frames,
            input_channels: input.as_ref().map_or(0, |(_, c)| c.channels as usize),
            output_channels: out_channels as usize,
            // cpal does not report device latency; assume one period each way
            input_latency: if input.is_some() { period } else { 0.0 },
            output_latency: period,
        };
        debug!(
            "Opened output '{}'{}: {:?}",
            output_name,
            input
                .as_ref()
                .map(|(n, _)| format!(", input '{n}'"))
                .unwrap_or_default(),
            format
        );

        self.open = Some(OpenDevices {
            input,
            output: (output_name, output_config),
            format: format.clone(),
        });
        Ok(format)
    }

    fn start(&mut self, process: ProcessFn) -> EngineResult<()> {
        let Some(devices) = self.open.clone() else {
            return Err(EngineError::Backend("start before open".into()));
        };
        self.stop_thread();

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = channel::bounded::<EngineResult<()>>(1);
        let thread = thread::Builder::new()
            .name("trackio-device".into())
            .spawn(move || match run_streams(&devices, process) {
                Ok(streams) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    // output first so the processing closure goes before the bridge writer
                    drop(streams);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop = Some(stop_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(EngineError::Backend("Audio device thread exited".into()))
            }
        }
    }

    fn close(&mut self) {
        self.stop_thread();
        self.open = None;
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Streams in drop order: output, then input
struct RunningStreams {
    _output: Stream,
    _input: Option<Stream>,
}

fn run_streams(devices: &OpenDevices, mut process: ProcessFn) -> EngineResult<RunningStreams> {
    let host = cpal::default_host();
    let build_err = |e: &dyn std::fmt::Display| EngineError::Backend(e.to_string());
    let (output_name, output_config) = &devices.output;
    let output_device = find_device(&host, Some(output_name), false)?;

    let overflow = Arc::new(AtomicBool::new(false));
    let underflow = Arc::new(AtomicBool::new(false));
    let in_channels = devices.format.input_channels;
    let out_channels = devices.format.output_channels.max(1);
    let bridge_len = (devices.format.buffer_frames * BRIDGE_PERIODS).max(MAX_PERIOD_FRAMES) * in_channels;
    let (mut bridge_tx, mut bridge_rx) = rtrb::RingBuffer::<f32>::new(bridge_len.max(1));

    let input = match &devices.input {
        Some((name, config)) => {
            let device = find_device(&host, Some(name), true)?;
            let flag = Arc::clone(&overflow);
            let stream = device
                .build_input_stream(
                    config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let n = data.len().min(bridge_tx.slots());
                        if n < data.len() {
                            flag.store(true, Ordering::Relaxed);
                        }
                        if let Ok(mut chunk) = bridge_tx.write_chunk(n) {
                            let (first, second) = chunk.as_mut_slices();
                            let split = first.len();
                            first.copy_from_slice(&data[..split]);
                            second.copy_from_slice(&data[split..n]);
                            chunk.commit_all();
                        }
                    },
                    move |err| warn!("Input stream error: {}", err),
                    None,
                )
                .map_err(|e| build_err(&e))?;
            Some(stream)
        }
        None => None,
    };

    let mut scratch = vec![0.0f32; MAX_PERIOD_FRAMES * in_channels];
    let err_flag = Arc::clone(&underflow);
    let output = output_device
        .build_output_stream(
            output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / out_channels).min(MAX_PERIOD_FRAMES);
                let wanted = frames * in_channels;
                let starved = !read_bridge(&mut bridge_rx, &mut scratch[..wanted]);

                let status = CallbackStatus {
                    input_overflow: overflow.swap(false, Ordering::Relaxed) || starved,
                    output_underflow: underflow.swap(false, Ordering::Relaxed),
                };
                process(&scratch[..wanted], data, status);
            },
            move |err| {
                warn!("Output stream error: {}", err);
                err_flag.store(true, Ordering::Relaxed);
            },
            None,
        )
        .map_err(|e| build_err(&e))?;

    if let Some(input) = &input {
        input.play().map_err(|e| build_err(&e))?;
    }
    output.play().map_err(|e| build_err(&e))?;
    info!(
        "Audio running at {}Hz, {} frame periods",
        devices.format.rate, devices.format.buffer_frames
    );

    Ok(RunningStreams {
        _output: output,
        _input: input,
    })
}

/// Fill `dest` from the input bridge. Returns false if the input could not
/// cover the whole period; the rest of `dest` is zeroed.
fn read_bridge(bridge: &mut rtrb::Consumer<f32>, dest: &mut [f32]) -> bool {
    let wanted = dest.len();
    let got = match bridge.read_chunk(wanted.min(bridge.slots())) {
        Ok(chunk) => {
            let (first, second) = chunk.as_slices();
            let split = first.len();
            dest[..split].copy_from_slice(first);
            dest[split..split + second.len()].copy_from_slice(second);
            let len = split + second.len();
            chunk.commit_all();
            len
        }
        Err(_) => 0,
    };
    dest[got..].fill(0.0);
    got == wanted
}

/// Names of the available (input, output) devices
pub fn enumerate_device_names() -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let host = cpal::default_host();

    let inputs = host
        .input_devices()?
        .map(|d| d.name().unwrap_or_else(|_| "Unknown".to_string()))
        .collect();
    let outputs = host
        .output_devices()?
        .map(|d| d.name().unwrap_or_else(|_| "Unknown".to_string()))
        .collect();

    Ok((inputs, outputs))
}
