pub mod config;
pub mod flac;
pub mod playback;
pub mod retry;
