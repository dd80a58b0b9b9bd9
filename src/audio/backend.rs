// src/audio/backend.rs
// Audio driver abstraction: open devices, then run a frame-processing closure at a fixed cadence

use super::error::EngineResult;

/// What the engine asks of the driver
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub rate: u32,
    pub buffer_frames: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// What the driver actually opened
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFormat {
    pub rate: u32,
    pub buffer_frames: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Seconds, as reported by the driver
    pub input_latency: f64,
    pub output_latency: f64,
}

/// Conditions the driver reports alongside one buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackStatus {
    /// Input samples were dropped before this buffer
    pub input_overflow: bool,
    /// The previous output buffer was late
    pub output_underflow: bool,
}

/// Called once per driver period with interleaved input and output buffers.
/// Output frames = `output.len() / output_channels`.
pub type ProcessFn = Box<dyn FnMut(&[f32], &mut [f32], CallbackStatus) + Send + 'static>;

/// A host audio driver.
///
/// `open` negotiates a format; `start` installs the processing closure and
/// begins calling it; `close` stops calling it and drops it before returning.
pub trait AudioBackend: Send {
    fn name(&self) -> &str;

    fn open(&mut self, request: &DeviceRequest) -> EngineResult<DeviceFormat>;

    fn start(&mut self, process: ProcessFn) -> EngineResult<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}
