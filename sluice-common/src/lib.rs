mod playback_state;
mod source_type;

pub use playback_state::PlaybackState;
pub use source_type::SourceType;
