use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_FILE_NAME: &str = "settings.json";
const CONFIG_DIR_NAME: &str = "mirror-voice";

/// Default realtime endpoint (model pinned in the query string).
const DEFAULT_REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17";

/// Default base URL for the fallback HTTP voice path.
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// WebSocket endpoint of the realtime conversational service.
    pub realtime_url: String,

    /// Base URL for the fallback HTTP path (transcription, chat, TTS).
    pub api_base: String,

    /// Enable the realtime streaming backend. When disabled, only the
    /// non-streaming fallback backend is built and the health loop never
    /// switches back to streaming.
    pub streaming_enabled: bool,

    /// Model named in the realtime session configuration.
    pub realtime_model: String,

    /// Voice used for synthesized replies (both backends).
    pub voice: String,

    /// Persona instructions sent with every response request.
    pub instructions: String,

    /// Transcription model for the realtime session configuration and the
    /// fallback's batch transcription.
    pub transcription_model: String,

    /// Chat model used by the fallback backend.
    pub chat_model: String,

    /// TTS model used by the fallback backend.
    pub tts_model: String,

    /// Upper bound on reply length for the fallback chat completion.
    pub max_response_tokens: u32,

    /// Recordings are force-committed once they reach this duration.
    pub max_recording_secs: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            streaming_enabled: true,
            realtime_model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            voice: "alloy".to_string(),
            instructions: "You are the voice of a smart mirror. Reply briefly, \
                           with warmth and a little wit."
                .to_string(),
            transcription_model: "whisper-1".to_string(),
            chat_model: "gpt-4o-mini-2024-07-18".to_string(),
            tts_model: "tts-1".to_string(),
            max_response_tokens: 250,
            max_recording_secs: 30,
        }
    }
}

fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME))
}

impl VoiceSettings {
    /// Load settings from the platform config directory, falling back to
    /// defaults when the file is missing or unreadable.
    pub fn load() -> Self {
        match settings_path() {
            Some(path) => Self::load_from(&path),
            None => {
                log::warn!("Settings: could not determine config directory");
                Self::default()
            }
        }
    }

    /// Persist settings to the platform config directory.
    pub fn save(&self) -> Result<(), String> {
        let path = settings_path().ok_or_else(|| {
            "Could not determine config directory".to_string()
        })?;
        self.save_to(&path)
    }

    /// Persist settings to an explicit path.
    ///
    /// Writes a temp file in the same directory and renames it over the
    /// destination, so a crash mid-write never leaves a corrupt file behind.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Serialize settings: {}", e))?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

        // On Unix, rename atomically replaces the destination. On Windows,
        // rename fails if the destination exists, so remove it first.
        if cfg!(windows) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }

        std::fs::rename(&tmp_path, path)
            .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
        Ok(())
    }

    /// Load settings from an explicit path (used by tests and embedders).
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Settings: failed to parse {:?}: {}", path, e);
                    VoiceSettings::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
            Err(e) => {
                log::warn!("Settings: failed to read {:?}: {}", path, e);
                VoiceSettings::default()
            }
        }
    }
}

/// Get the service API key from the environment.
///
/// `.env` files are honored in development; an empty value counts as unset.
pub fn api_key() -> Option<String> {
    let _ = dotenvy::dotenv();
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let settings = VoiceSettings::default();
        assert!(settings.streaming_enabled);
        assert_eq!(settings.voice, "alloy");
        assert_eq!(settings.max_recording_secs, 30);
        assert!(settings.realtime_url.starts_with("wss://"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = VoiceSettings::load_from(&dir.path().join("nope.json"));
        assert_eq!(settings.chat_model, VoiceSettings::default().chat_model);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"voice": "echo", "max_recording_secs": 12}}"#).unwrap();

        let settings = VoiceSettings::load_from(&path);
        assert_eq!(settings.voice, "echo");
        assert_eq!(settings.max_recording_secs, 12);
        assert!(settings.streaming_enabled);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);

        let mut settings = VoiceSettings::default();
        settings.voice = "nova".to_string();
        settings.streaming_enabled = false;
        settings.save_to(&path).unwrap();

        let loaded = VoiceSettings::load_from(&path);
        assert_eq!(loaded.voice, "nova");
        assert!(!loaded.streaming_enabled);
        // No temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();

        let settings = VoiceSettings::load_from(&path);
        assert_eq!(settings.voice, "alloy");
    }
}
