// src/audio/error.rs
// Error types for stream control and track storage

use thiserror::Error;

/// Errors returned by the engine when a stream cannot be started or driven
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Another owner already has a stream running
    #[error("Audio stream already active for another owner")]
    StreamBusy,

    /// The backend could not open the requested devices
    #[error("Failed to open audio device: {0}")]
    DeviceOpen(String),

    /// Requested device name was not found
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Backend cannot run the requested format
    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    /// Time range or rate makes no sense
    #[error("Invalid stream range: {0}")]
    InvalidRange(String),

    /// Neither playback nor capture tracks were given
    #[error("No tracks to play or record")]
    NoTracks,

    /// The buffer exchange thread could not be spawned
    #[error("Failed to spawn buffer exchange thread: {0}")]
    WorkerSpawn(String),

    /// Backend failure while the stream runs
    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by durable tracks while captured audio is appended
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("Track '{0}' is full")]
    TrackFull(String),

    #[error("Channel count mismatch: track has {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Storage write failed: {0}")]
    Write(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            EngineError::DeviceOpen("hw:0".into()).to_string(),
            "Failed to open audio device: hw:0"
        );
        let err = StorageError::ChannelMismatch {
            expected: 2,
            actual: 1,
        };
        assert!(err.to_string().contains("has 2, got 1"));
    }
}
