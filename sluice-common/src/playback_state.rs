/// Transport state of the playback engine.
///
/// The two fading states are transitional: once the fade envelope completes
/// they settle into `Playing` or `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Paused,
    Playing,
    FadingIn,
    FadingOut,
}

impl PlaybackState {
    /// Whether samples are being pulled from the track (anything but fully paused)
    pub fn is_audible(self) -> bool {
        !matches!(self, PlaybackState::Paused)
    }

    /// Whether the user intends playback to be stopped
    pub fn is_user_paused(self) -> bool {
        matches!(self, PlaybackState::Paused | PlaybackState::FadingOut)
    }

    /// State reached once the current fade completes
    pub fn settle(self) -> Self {
        match self {
            PlaybackState::FadingIn => PlaybackState::Playing,
            PlaybackState::FadingOut => PlaybackState::Paused,
            other => other,
        }
    }

    /// State entered by a pause/resume toggle
    pub fn toggled(self) -> Self {
        if self.is_user_paused() {
            PlaybackState::FadingIn
        } else {
            PlaybackState::FadingOut
        }
    }
}
