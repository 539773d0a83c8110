use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{ConversationConfig, SessionSettings};
use crate::streaming::{ConnectTimeouts, EngineEndpoint, VoiceId, DEFAULT_MODEL};

const APP_DIR_NAME: &str = "voice-concierge";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable holding the engine API key
pub const API_KEY_ENV: &str = "CONCIERGE_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// WebSocket URL of the conversational engine.
    pub endpoint_url: String,

    pub model: String,

    /// System instruction describing how the concierge behaves.
    pub persona: String,

    pub voice: VoiceId,

    /// Optional text file with the event facts the concierge may reference.
    pub context_file: Option<PathBuf>,

    /// Input device name; the host default when unset or not found.
    pub input_device: Option<String>,

    /// Output device name; the host default when unset or not found.
    pub output_device: Option<String>,

    /// Length of each microphone frame sent to the engine.
    pub frame_duration_ms: u32,

    /// Per-speaker transcript cap; the oldest text is dropped beyond it (0 = unlimited).
    pub transcript_max_chars: usize,

    pub connect_timeout_secs: u64,

    /// How long to wait for the engine to acknowledge setup.
    pub setup_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "ws://127.0.0.1:8787/live".to_string(),
            model: DEFAULT_MODEL.to_string(),
            persona: "You are the virtual concierge for this event. Answer briefly and only \
                      from the facts you were given."
                .to_string(),
            voice: VoiceId::default(),
            context_file: None,
            input_device: None,
            output_device: None,
            frame_duration_ms: 100,
            transcript_max_chars: 16 * 1024,
            connect_timeout_secs: 10,
            setup_timeout_secs: 5,
        }
    }
}

impl AppSettings {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            model: self.model.clone(),
            transcript_max_chars: self.transcript_max_chars,
            timeouts: ConnectTimeouts {
                connect: Duration::from_secs(self.connect_timeout_secs.max(1)),
                setup: Duration::from_secs(self.setup_timeout_secs.max(1)),
            },
        }
    }

    pub fn conversation_config(&self, context: impl Into<String>) -> ConversationConfig {
        ConversationConfig::new(self.persona.clone(), self.voice, context)
    }

    pub fn endpoint(&self, api_key: Option<String>) -> EngineEndpoint {
        EngineEndpoint::new(self.endpoint_url.clone(), api_key)
    }

    /// Read the context file, if configured. Missing files yield an empty context.
    pub fn load_context(&self) -> String {
        let Some(path) = self.context_file.as_ref() else {
            return String::new();
        };
        match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Settings: failed to read context file {:?}: {}", path, e);
                String::new()
            }
        }
    }
}

/// Default location: `<config_dir>/voice-concierge/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists.
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

/// Get the engine API key from the environment
pub fn get_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty())
}
