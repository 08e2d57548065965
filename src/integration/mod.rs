pub mod config;
pub mod orchestrator;

pub use config::SessionConfig;
pub use orchestrator::{RealtimeOrchestrator, SessionEvent};
