//! Realtime session protocol client
//!
//! Owns one WebSocket connection. The socket is split once it opens: the
//! write half sits behind an async mutex so concurrent senders never
//! interleave frames, and the read half is driven either by
//! [`ProtocolClient::receive_loop`] or, for one-shot checks, by
//! [`ProtocolClient::next_event`].

use crate::audio::frame::{AudioFormat, AudioFrame};
use crate::integration::config::SessionConfig;
use crate::realtime::events::{ClientEvent, ServerEvent, SessionSettings};
use crate::{ChatterError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type RealtimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<RealtimeSocket, Message>;
type SocketReader = SplitStream<RealtimeSocket>;

/// Upper bound on the best-effort close handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Callbacks invoked from the receive loop
///
/// All methods default to doing nothing. Implementations must not block:
/// they run on the task that reads the socket.
pub trait ProtocolEventHandler: Send + Sync {
    fn on_text_delta(&self, _delta: &str) {}

    /// Decoded PCM16 audio from `response.audio.delta`
    fn on_audio_delta(&self, _frame: AudioFrame) {}

    fn on_transcript_delta(&self, _delta: &str) {}

    /// Server-side VAD heard the user start talking
    fn on_speech_started(&self) {}

    fn on_server_error(&self, _error: &ChatterError) {}

    /// Every successfully parsed event, before the specific callback
    fn on_event(&self, _event: &ServerEvent) {}
}

pub struct ProtocolClient {
    config: SessionConfig,
    format: AudioFormat,
    state: Mutex<ConnectionState>,
    writer: AsyncMutex<Option<SocketWriter>>,
    reader: AsyncMutex<Option<SocketReader>>,
}

impl ProtocolClient {
    pub fn new(config: SessionConfig) -> Self {
        let format = config.audio_format();
        Self {
            config,
            format,
            state: Mutex::new(ConnectionState::Disconnected),
            writer: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Open the socket and send the initial `session.update`
    ///
    /// The handshake is bounded by the configured connect timeout. On any
    /// failure the client ends up `Closed` and must not be reused.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ChatterError::StateError(format!(
                    "Cannot connect from state {:?}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        match self.open_socket().await {
            Ok(socket) => {
                let (writer, reader) = socket.split();
                *self.writer.lock().await = Some(writer);
                *self.reader.lock().await = Some(reader);
                *self.state.lock() = ConnectionState::Open;
            }
            Err(e) => {
                *self.state.lock() = ConnectionState::Closed;
                return Err(e);
            }
        }

        let settings = SessionSettings::from_config(&self.config);
        if settings.sample_rate() != Some(self.config.sample_rate) {
            warn!(
                "Wire format {} implies a different rate than the configured {}Hz",
                settings.input_audio_format, self.config.sample_rate
            );
        }

        if let Err(e) = self.send_event(&ClientEvent::session_update(settings)).await {
            self.close().await;
            return Err(e);
        }

        info!("Realtime session open (model {})", self.config.model);
        Ok(())
    }

    async fn open_socket(&self) -> Result<RealtimeSocket> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| ChatterError::ConnectionError("Missing API key".into()))?;
        let url = self.config.connect_url();

        let mut request = url.as_str().into_client_request().map_err(|e| {
            ChatterError::ConfigError(format!("Invalid realtime websocket URL: {}", e))
        })?;
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| ChatterError::ConfigError(format!("Invalid auth header: {}", e)))?;
        request.headers_mut().insert("Authorization", auth_value);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        debug!("Connecting to {}", self.config.endpoint);
        let connect_timeout = self.config.connect_timeout();
        match timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok((socket, _))) => Ok(socket),
            Ok(Err(e)) => Err(map_connect_error(e)),
            Err(_) => Err(ChatterError::ConnectionError(format!(
                "Timed out after {}ms waiting for the handshake",
                connect_timeout.as_millis()
            ))),
        }
    }

    /// Serialize and write one event
    ///
    /// Only valid while `Open`. Concurrent callers queue on the writer lock.
    pub async fn send_event(&self, event: &ClientEvent) -> Result<()> {
        if !self.is_open() {
            return Err(ChatterError::StateError(format!(
                "Cannot send {} while {:?}",
                event.event_type(),
                self.state()
            )));
        }

        let payload = event.to_json()?;
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| ChatterError::StateError("Socket already released".into()))?;

        sink.send(Message::Text(payload))
            .await
            .map_err(|e| ChatterError::ConnectionError(format!("Send failed: {}", e)))?;

        if !matches!(event, ClientEvent::InputAudioAppend { .. }) {
            debug!("Sent {} ({})", event.event_type(), event.event_id());
        }
        Ok(())
    }

    /// Read until the next parseable event
    ///
    /// Returns `Ok(None)` once the server closes the socket.
    pub async fn next_event(&self) -> Result<Option<ServerEvent>> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| ChatterError::StateError("Client is not connected".into()))?;

        loop {
            match reader.next().await {
                Some(Ok(message)) => match message_text(message) {
                    Frame::Text(text) => return ServerEvent::parse(&text).map(Some),
                    Frame::Close => {
                        *self.state.lock() = ConnectionState::Closed;
                        return Ok(None);
                    }
                    Frame::Control => {}
                },
                Some(Err(e)) => {
                    return Err(ChatterError::ConnectionError(format!("Receive failed: {}", e)))
                }
                None => {
                    *self.state.lock() = ConnectionState::Closed;
                    return Ok(None);
                }
            }
        }
    }

    /// Dispatch inbound events to `handler` until cancelled
    ///
    /// Returns `Ok(())` on cancellation. A close frame, a dropped socket or a
    /// fatal server error ends the loop with an error; everything else is
    /// logged and skipped.
    pub async fn receive_loop(
        &self,
        handler: Arc<dyn ProtocolEventHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| ChatterError::StateError("Client is not connected".into()))?;

        debug!("Receive loop started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Receive loop cancelled");
                    return Ok(());
                }
                message = reader.next() => message,
            };

            match message {
                Some(Ok(message)) => match message_text(message) {
                    Frame::Text(text) => self.dispatch(&text, handler.as_ref())?,
                    Frame::Close => {
                        *self.state.lock() = ConnectionState::Closed;
                        return Err(ChatterError::ConnectionError(
                            "Server closed the connection".into(),
                        ));
                    }
                    Frame::Control => {}
                },
                Some(Err(e)) => {
                    error!("Realtime socket failed: {}", e);
                    *self.state.lock() = ConnectionState::Closed;
                    return Err(ChatterError::ConnectionError(format!("Receive failed: {}", e)));
                }
                None => {
                    *self.state.lock() = ConnectionState::Closed;
                    return Err(ChatterError::ConnectionError("Connection dropped".into()));
                }
            }
        }
    }

    fn dispatch(&self, text: &str, handler: &dyn ProtocolEventHandler) -> Result<()> {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping malformed event: {}", e);
                return Ok(());
            }
        };

        if !matches!(event, ServerEvent::AudioDelta { .. }) {
            debug!("Received {}", event.event_type());
        }
        handler.on_event(&event);

        match event {
            ServerEvent::TextDelta { delta } => handler.on_text_delta(&delta),
            ServerEvent::AudioDelta { delta } => match AudioFrame::from_base64(&delta, self.format) {
                Ok(frame) => handler.on_audio_delta(frame),
                Err(e) => warn!("Skipping undecodable audio delta: {}", e),
            },
            ServerEvent::AudioTranscriptDelta { delta } => handler.on_transcript_delta(&delta),
            ServerEvent::SpeechStarted => handler.on_speech_started(),
            event @ ServerEvent::Error { .. } => {
                if let Some(err) = event.into_error() {
                    warn!("Server reported: {}", err);
                    handler.on_server_error(&err);
                    if !err.is_recoverable() {
                        return Err(err);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Send a normal close frame and release the socket
    ///
    /// Best effort and idempotent; write errors are ignored.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Open | ConnectionState::Connecting) {
                *state = ConnectionState::Closing;
            }
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            };
            match timeout(CLOSE_TIMEOUT, writer.send(Message::Close(Some(frame)))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Close frame not delivered: {}", e),
                Err(_) => debug!("Close frame timed out"),
            }
            let _ = timeout(CLOSE_TIMEOUT, writer.close()).await;
            info!("Realtime session closed");
        }

        // The receive loop holds the reader until it exits
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        *self.state.lock() = ConnectionState::Closed;
    }
}

enum Frame {
    Text(String),
    Close,
    Control,
}

fn message_text(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Frame::Text(text),
            Err(_) => {
                warn!("Ignoring non-UTF-8 binary frame");
                Frame::Control
            }
        },
        Message::Close(_) => Frame::Close,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
    }
}

fn map_connect_error(error: WsError) -> ChatterError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                ChatterError::ConnectionError(format!(
                    "Authentication failed with status {}",
                    status
                ))
            } else {
                ChatterError::ConnectionError(format!("Handshake failed with status {}", status))
            }
        }
        WsError::Url(e) => ChatterError::ConfigError(format!("Invalid realtime websocket URL: {}", e)),
        other => ChatterError::ConnectionError(format!("Connect failed: {}", other)),
    }
}
