pub mod audio;
pub mod integration;
pub mod realtime;

use thiserror::Error;

pub use integration::{RealtimeOrchestrator, SessionConfig, SessionEvent};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatterError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Server error: {message}")]
    ServerError {
        message: String,
        code: Option<String>,
        fatal: bool,
    },

    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for ChatterError {
    fn from(e: std::io::Error) -> Self {
        ChatterError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for ChatterError {
    fn from(e: serde_json::Error) -> Self {
        ChatterError::ProtocolError(e.to_string())
    }
}

impl ChatterError {
    /// Check if the session can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            // A dropped or refused socket ends the session
            ChatterError::ConnectionError(_) => false,
            // Bad frames are skipped
            ChatterError::ProtocolError(_) => true,
            ChatterError::ServerError { fatal, .. } => !fatal,
            // Hardware/device errors may require user intervention
            ChatterError::AudioDeviceError(_) => false,
            ChatterError::AudioProcessingError(_) => true,
            // Rejected before anything happened
            ChatterError::StateError(_) => true,
            ChatterError::ConfigError(_) => false,
            ChatterError::ChannelError(_) => false,
            ChatterError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ChatterError::ConnectionError(_) => {
                "Could not reach the voice service. Please check your connection and start a new session.".to_string()
            }
            ChatterError::ProtocolError(_) => {
                "Received an unexpected message from the voice service.".to_string()
            }
            ChatterError::ServerError { message, .. } => {
                format!("The voice service reported an error: {}", message)
            }
            ChatterError::AudioDeviceError(_) => {
                "Audio device error. Please check your microphone/speakers.".to_string()
            }
            ChatterError::AudioProcessingError(_) => {
                "Audio processing failed. Please try again.".to_string()
            }
            ChatterError::StateError(message) => {
                format!("Not possible right now: {}.", message)
            }
            ChatterError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            ChatterError::ChannelError(_) => {
                "Internal communication error. Please restart the session.".to_string()
            }
            ChatterError::IOError(_) => {
                "File system error occurred.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatterError>;
