//! Voice interaction subsystem for an always-on kiosk display.
//!
//! Maintains a live bidirectional streaming session with a remote
//! conversational speech service, turns microphone audio into outbound
//! protocol events, turns inbound events into played-back synthesized
//! speech, and exposes one coherent listening/thinking/speaking status to
//! the surrounding UI.
//!
//! # Usage
//!
//! ```ignore
//! let settings = VoiceSettings::load();
//! let mic = Arc::new(CpalMicrophone::new()?);
//! let speaker = Arc::new(RodioSpeaker::new()?);
//! let voice = VoiceManager::new(settings, mic, speaker)?;
//!
//! // per frame:
//! voice.update();
//! voice.draw(&mut surface, PanelRect::new(10, 10, 250, 200));
//!
//! // on input:
//! voice.on_button_press();
//!
//! // on exit:
//! voice.cleanup();
//! ```
//!
//! The kiosk supplies the logger backend, the input events, and a
//! [`surface::DrawSurface`] implementation; everything else lives here.

pub mod audio;
pub mod backend;
pub mod panel;
pub mod settings;
pub mod status;
pub mod streaming;
pub mod surface;

pub use audio::{CpalMicrophone, MicrophoneSource, RodioSpeaker, SpeakerSink};
pub use backend::{ManagerTuning, VoiceBackend, VoiceManager};
pub use settings::VoiceSettings;
pub use status::{StatusReport, VoiceState};
pub use surface::{DrawSurface, PanelRect, Rgb};
