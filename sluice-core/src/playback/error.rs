//! Playback error types
use crate::flac::FlacError;
use thiserror::Error;
/// Errors that can occur while loading or playing a track
#[derive(Error, Debug)]
pub enum PlaybackError {
    /// Invalid, corrupt or unsupported FLAC container
    #[error("Invalid FLAC: {0}")]
    Flac(#[from] FlacError),
    /// Remote host ignored the Range header
    #[error("Remote source does not support range requests: {0}")]
    RangeNotSupported(String),
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),
    /// External decoder could not be started or misbehaved
    #[error("Decoder error: {0}")]
    Decoder(String),
    /// Output device unavailable
    #[error("Audio device error: {0}")]
    Device(String),
    /// A bounded wait expired
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    /// File system IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Async task panicked or was cancelled
    #[error("Task failed: {0}")]
    TaskFailed(String),
}
impl PlaybackError {
    pub fn http(e: impl std::fmt::Display) -> Self {
        Self::Http(e.to_string())
    }
    pub fn decoder(e: impl std::fmt::Display) -> Self {
        Self::Decoder(e.to_string())
    }
    pub fn device(e: impl std::fmt::Display) -> Self {
        Self::Device(e.to_string())
    }
    pub fn task(e: impl std::fmt::Display) -> Self {
        Self::TaskFailed(e.to_string())
    }
}
impl From<reqwest::Error> for PlaybackError {
    fn from(e: reqwest::Error) -> Self {
        Self::http(e)
    }
}
