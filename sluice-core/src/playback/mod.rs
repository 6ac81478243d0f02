pub mod audio_source;
pub mod decoder_process;
pub mod engine;
mod error;
pub mod flac_prefetch;
pub mod output;
pub mod progress;
pub mod service;
pub mod track_buffer;
pub mod waveform;
pub use error::PlaybackError;
pub use progress::{PlaybackProgress, PlaybackProgressHandle, StateSnapshot};
pub use service::{PlaybackCommand, PlaybackHandle, PlaybackService};
pub use track_buffer::{create_track_buffer, OutputSpec, SharedTrackBuffer, TrackBuffer};
