//! Session configuration
//!
//! Supplied once per session by the host application, either built in code
//! with the `with_*` helpers or loaded from a TOML file.

use crate::audio::frame::AudioFormat;
use crate::audio::vad::VadConfig;
use crate::{ChatterError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when no API key is configured
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Configuration for one realtime voice session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint, without the model query parameter
    pub endpoint: String,

    /// Bearer credential; empty means read [`API_KEY_ENV`]
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Remote model identifier
    pub model: String,

    /// Voice used for spoken replies
    pub voice: String,

    /// Optional system instructions sent with the session configuration
    pub instructions: Option<String>,

    /// Output modalities requested from the model
    pub modalities: Vec<String>,

    /// Sample rate for capture, playback and the wire
    pub sample_rate: u32,

    pub channels: u16,

    pub bits_per_sample: u16,

    /// Length of each captured frame in milliseconds
    pub frame_duration_ms: u32,

    /// Bound on the socket open handshake
    pub connect_timeout_ms: u64,

    /// Bound on the first server response during diagnostics
    pub diagnostics_timeout_ms: u64,

    /// Local voice activity detection tuning
    pub vad: VadConfig,

    /// Substring of the preferred input device name
    pub input_device: Option<String>,

    /// Substring of the preferred output device name
    pub output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.openai.com/v1/realtime".to_string(),
            api_key: String::new(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: None,
            modalities: vec!["text".to_string(), "audio".to_string()],
            sample_rate: 24_000,
            channels: 1,
            bits_per_sample: 16,
            frame_duration_ms: 100,
            connect_timeout_ms: 10_000,
            diagnostics_timeout_ms: 5_000,
            vad: VadConfig::default(),
            input_device: None,
            output_device: None,
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ChatterError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| ChatterError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ChatterError::ConfigError(e.to_string()))
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
        }
    }

    /// Samples per captured frame
    pub fn frame_samples(&self) -> usize {
        self.audio_format()
            .samples_for(Duration::from_millis(u64::from(self.frame_duration_ms)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn diagnostics_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostics_timeout_ms)
    }

    /// Configured key, or the environment fallback
    pub fn resolve_api_key(&self) -> Option<String> {
        Some(self.api_key.clone())
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env::var(API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty())
    }

    /// Endpoint with the model query parameter appended
    pub fn connect_url(&self) -> String {
        let trimmed = self.endpoint.trim();
        let separator = if trimmed.contains('?') { "&" } else { "?" };
        format!(
            "{}{}model={}",
            trimmed,
            separator,
            urlencoding::encode(self.model.trim())
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ChatterError::ConfigError("Endpoint is required".into()));
        }
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ChatterError::ConfigError(format!(
                "Endpoint must use ws:// or wss://: {}",
                endpoint
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ChatterError::ConfigError("Model is required".into()));
        }
        if self.voice.trim().is_empty() {
            return Err(ChatterError::ConfigError("Voice is required".into()));
        }
        if self.modalities.is_empty() {
            return Err(ChatterError::ConfigError(
                "At least one modality is required".into(),
            ));
        }
        if self.channels != 1 {
            return Err(ChatterError::ConfigError(format!(
                "Only mono audio is supported, got {} channels",
                self.channels
            )));
        }
        if self.bits_per_sample != 16 {
            return Err(ChatterError::ConfigError(format!(
                "Only 16-bit PCM is supported, got {} bits",
                self.bits_per_sample
            )));
        }
        if !(8_000..=48_000).contains(&self.sample_rate) {
            return Err(ChatterError::ConfigError(format!(
                "Sample rate out of range: {}",
                self.sample_rate
            )));
        }
        if !(10..=1_000).contains(&self.frame_duration_ms) {
            return Err(ChatterError::ConfigError(format!(
                "Frame duration out of range: {}ms",
                self.frame_duration_ms
            )));
        }
        if !(self.vad.threshold > 0.0 && self.vad.threshold <= 1.0) {
            return Err(ChatterError::ConfigError(format!(
                "VAD threshold must be in (0, 1]: {}",
                self.vad.threshold
            )));
        }
        if self.vad.min_speech_frames == 0 || self.vad.min_silence_frames == 0 {
            return Err(ChatterError::ConfigError(
                "VAD frame counts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
