//! Pre-flight connection check
//!
//! Opens a throwaway session, sends the same `session.update` a real session
//! would, and waits for a single server event.

use crate::integration::config::SessionConfig;
use crate::realtime::client::ProtocolClient;
use crate::ChatterError;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

/// Outcome of one diagnostic check
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticReport {
    pub success: bool,
    /// Time until the socket was open and `session.update` written
    pub connect_latency: Option<Duration>,
    /// Time from `session.update` to the first server event
    pub response_latency: Option<Duration>,
    /// `type` tag of the first server event
    pub first_event: Option<String>,
    pub error: Option<ChatterError>,
}

impl DiagnosticReport {
    fn failed(error: ChatterError, connect_latency: Option<Duration>) -> Self {
        Self {
            success: false,
            connect_latency,
            response_latency: None,
            first_event: None,
            error: Some(error),
        }
    }

    /// One-line human-readable result
    pub fn summary(&self) -> String {
        if self.success {
            format!(
                "OK: connected in {}ms, first event '{}' after {}ms",
                millis(self.connect_latency),
                self.first_event.as_deref().unwrap_or("?"),
                millis(self.response_latency)
            )
        } else {
            match &self.error {
                Some(error) => format!("FAILED: {}", error),
                None => "FAILED".to_string(),
            }
        }
    }
}

fn millis(duration: Option<Duration>) -> u128 {
    duration.map(|d| d.as_millis()).unwrap_or_default()
}

pub struct ConnectionDiagnostics;

impl ConnectionDiagnostics {
    /// Probe the endpoint described by `config`
    ///
    /// Never returns an error; failures are reported in the
    /// [`DiagnosticReport`].
    pub async fn run(config: &SessionConfig) -> DiagnosticReport {
        let wait_timeout = config.diagnostics_timeout();
        let mut check_config = config.clone();
        check_config.connect_timeout_ms = config.connect_timeout_ms.min(config.diagnostics_timeout_ms);

        let client = ProtocolClient::new(check_config);
        let started = Instant::now();

        if let Err(e) = client.connect().await {
            warn!("Diagnostics connect failed: {}", e);
            return DiagnosticReport::failed(e, None);
        }
        let connect_latency = started.elapsed();
        let sent_at = Instant::now();

        let report = match timeout(wait_timeout, client.next_event()).await {
            Ok(Ok(Some(event))) => {
                let response_latency = Some(sent_at.elapsed());
                let first_event = Some(event.event_type().to_string());
                match event.into_error() {
                    Some(error) => DiagnosticReport {
                        success: false,
                        connect_latency: Some(connect_latency),
                        response_latency,
                        first_event,
                        error: Some(error),
                    },
                    None => DiagnosticReport {
                        success: true,
                        connect_latency: Some(connect_latency),
                        response_latency,
                        first_event,
                        error: None,
                    },
                }
            }
            Ok(Ok(None)) => DiagnosticReport::failed(
                ChatterError::ConnectionError("Server closed the connection before responding".into()),
                Some(connect_latency),
            ),
            Ok(Err(e)) => DiagnosticReport::failed(e, Some(connect_latency)),
            Err(_) => DiagnosticReport::failed(
                ChatterError::ConnectionError(format!(
                    "No response within {}ms",
                    wait_timeout.as_millis()
                )),
                Some(connect_latency),
            ),
        };

        client.close().await;
        info!("Diagnostics: {}", report.summary());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        let ok = DiagnosticReport {
            success: true,
            connect_latency: Some(Duration::from_millis(120)),
            response_latency: Some(Duration::from_millis(45)),
            first_event: Some("session.created".into()),
            error: None,
        };
        assert_eq!(
            ok.summary(),
            "OK: connected in 120ms, first event 'session.created' after 45ms"
        );

        let failed = DiagnosticReport::failed(ChatterError::ConnectionError("refused".into()), None);
        assert_eq!(failed.summary(), "FAILED: Connection error: refused");
    }

    #[tokio::test]
    async fn test_missing_key_is_reported() {
        let mut config = SessionConfig::default().with_endpoint("ws://127.0.0.1:1/v1/realtime");
        config.api_key = " ".into();
        // Only meaningful when the environment has no key either
        if config.resolve_api_key().is_some() {
            return;
        }

        let report = ConnectionDiagnostics::run(&config).await;
        assert!(!report.success);
        assert!(matches!(report.error, Some(ChatterError::ConnectionError(_))));
    }
}
