pub mod audio;

pub use audio::{
    AudioConfig, AudioEngine, AudioEvent, EngineError, StreamOptions, StreamToken,
    TransportTracks,
};
