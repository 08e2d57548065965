pub mod client;
pub mod diagnostics;
pub mod events;

pub use client::{ConnectionState, ProtocolClient, ProtocolEventHandler};
pub use diagnostics::{ConnectionDiagnostics, DiagnosticReport};
pub use events::{ClientEvent, ServerEvent, SessionSettings};
