//! Microphone capture and speaker playback.
//!
//! Capture uses CPAL against the default input device and hands PCM16 sample
//! batches to the streaming pipeline over a channel; playback goes through a
//! rodio sink on a dedicated thread. Both sides are reached only through the
//! [`MicrophoneSource`] and [`SpeakerSink`] boundary traits so the kiosk (and
//! the tests) can substitute their own devices.

pub mod capture;
pub mod playback;

pub use capture::{downsample, CaptureHandle, CpalMicrophone, MicrophoneSource};
pub use playback::{RodioSpeaker, SpeakerSink};

/// Errors that can occur on the audio path.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    PlaybackUnavailable(String),
    /// The audio path was switched off after an earlier device failure.
    Disabled,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::PlaybackUnavailable(e) => {
                write!(f, "Audio playback unavailable: {}", e)
            }
            AudioError::Disabled => {
                write!(f, "Audio path disabled after a device failure")
            }
        }
    }
}

impl std::error::Error for AudioError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_error_display() {
        assert!(AudioError::NoInputDevice.to_string().contains("input device"));
        assert!(AudioError::PlaybackUnavailable("no sink".into())
            .to_string()
            .contains("no sink"));
    }
}
