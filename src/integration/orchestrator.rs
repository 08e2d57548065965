//! Orchestrator for a realtime voice session
//!
//! Connects all components: Mic -> VAD -> socket -> model -> socket -> Sink
//!
//! Three contexts run while a session is live: the capture callback thread,
//! the sink drain thread, and the tokio tasks that read and write the socket.
//! They only meet through the sink's lock, the VAD lock, an unbounded
//! outbound queue and a shared cancellation token.

use crate::audio::device::{AudioSource, DeviceProvider, FrameHandler, PlaybackErrorHandler};
use crate::audio::frame::AudioFrame;
use crate::audio::sink::AudioSink;
use crate::audio::vad::{VadTransition, VoiceActivityDetector};
use crate::integration::config::SessionConfig;
use crate::realtime::client::{ProtocolClient, ProtocolEventHandler};
use crate::realtime::events::{ClientEvent, ServerEvent};
use crate::{ChatterError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events published to the host application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Lifecycle or turn status, e.g. "connected", "speaking"
    Status(String),

    /// Incremental text from the model
    Text(String),

    /// Incremental transcript of the model's spoken answer
    Transcript(String),

    /// A failure surfaced from a background context
    Error(ChatterError),
}

fn status(text: &str) -> SessionEvent {
    SessionEvent::Status(text.to_string())
}

/// Runs at most one realtime voice session at a time
pub struct RealtimeOrchestrator {
    devices: Arc<dyn DeviceProvider>,
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
    session: AsyncMutex<Option<ActiveSession>>,
}

impl RealtimeOrchestrator {
    pub fn new(devices: Arc<dyn DeviceProvider>) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            devices,
            event_tx,
            event_rx,
            session: AsyncMutex::new(None),
        }
    }

    /// Orchestrator backed by the cpal devices named in `config`
    #[cfg(feature = "audio-io")]
    pub fn with_default_devices(config: &SessionConfig) -> Self {
        use crate::audio::output::CpalDevices;

        Self::new(Arc::new(CpalDevices::new(
            config.input_device.clone(),
            config.output_device.clone(),
        )))
    }

    /// Connect, open both audio halves and begin streaming
    ///
    /// Fails with `StateError` if a session is already running. A session
    /// that ended on a fatal error is cleared and replaced. Connection and
    /// device failures are returned after everything already opened has
    /// been torn down again.
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        config.validate()?;

        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| !s.cancel.is_cancelled()) {
            return Err(ChatterError::StateError("Session already running".into()));
        }
        if let Some(ended) = slot.take() {
            debug!("Clearing ended session {}", ended.id);
            ended.shutdown().await;
        }

        let id = Uuid::new_v4();
        info!("Starting session {}", id);
        self.publish(status("connecting"));

        let client = Arc::new(ProtocolClient::new(config.clone()));
        if let Err(e) = client.connect().await {
            error!("Session {} failed to connect: {}", id, e);
            self.publish(SessionEvent::Error(e.clone()));
            return Err(e);
        }
        self.publish(status("connected"));

        let mut session = ActiveSession {
            id,
            client: Arc::clone(&client),
            sink: None,
            capture: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };

        match self.wire(&config, &mut session) {
            Ok(()) => {
                info!("Session {} running", id);
                self.publish(status("listening"));
                *slot = Some(session);
                Ok(())
            }
            Err(e) => {
                error!("Session {} failed to start: {}", id, e);
                session.shutdown().await;
                self.publish(SessionEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Open the devices and spawn the session tasks
    fn wire(&self, config: &SessionConfig, session: &mut ActiveSession) -> Result<()> {
        let format = config.audio_format();
        let cancel = session.cancel.clone();
        let failure = Arc::new(FailureReporter::new(self.event_tx.clone(), cancel.clone()));
        let user_speaking = Arc::new(AtomicBool::new(false));

        let playback = self.devices.open_output(format, failure.clone())?;
        let sink = Arc::new(AudioSink::new(playback));
        session.sink = Some(Arc::clone(&sink));
        sink.start()?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        session.tasks.push(tokio::spawn(forward_outbound(
            Arc::clone(&session.client),
            outbound_rx,
            cancel.clone(),
        )));

        let inbound: Arc<dyn ProtocolEventHandler> = Arc::new(InboundBridge {
            sink: Arc::clone(&sink),
            events: self.event_tx.clone(),
            user_speaking: Arc::clone(&user_speaking),
        });
        session.tasks.push(tokio::spawn(run_receive(
            Arc::clone(&session.client),
            inbound,
            cancel.clone(),
            Arc::clone(&failure),
        )));

        let capture = self.devices.open_input(format, config.frame_samples())?;
        session.capture = Some(Arc::clone(&capture));
        let bridge = Arc::new(CaptureBridge {
            vad: Mutex::new(VoiceActivityDetector::new(config.vad)),
            sink: Arc::clone(&sink),
            outbound: outbound_tx,
            events: self.event_tx.clone(),
            cancel: cancel.clone(),
            failure,
            user_speaking,
        });
        capture.start(bridge)?;

        // Any fatal error cancels the token; take the audio and the socket down with it
        let client = Arc::clone(&session.client);
        session.tasks.push(tokio::spawn(async move {
            cancel.cancelled().await;
            let halted = tokio::task::spawn_blocking(move || {
                capture.stop();
                sink.stop();
            })
            .await;
            if let Err(e) = halted {
                warn!("Audio shutdown task failed: {}", e);
            }
            client.close().await;
        }));

        Ok(())
    }

    /// Stop the running session, if any. Idempotent.
    ///
    /// Returns once capture, playback and every session task have finished,
    /// so no callback fires afterwards.
    pub async fn stop(&self) {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                let id = session.id;
                session.shutdown().await;
                self.publish(status("stopped"));
                info!("Session {} stopped", id);
            }
            None => debug!("Stop requested with no running session"),
        }
    }

    /// Inject a user text message and ask the model to respond
    pub async fn send_text_message(&self, text: &str) -> Result<()> {
        let client = self.running_client().await?;
        client.send_event(&ClientEvent::user_message(text)).await?;
        client.send_event(&ClientEvent::response_create()).await?;
        debug!("Sent text message ({} chars)", text.len());
        Ok(())
    }

    /// Ask the server to stop generating and flush queued assistant audio
    ///
    /// The cancel is advisory; send failures are logged, not returned.
    pub async fn stop_generation(&self) -> Result<()> {
        let (client, sink) = {
            let slot = self.session.lock().await;
            match slot.as_ref().filter(|s| !s.cancel.is_cancelled()) {
                Some(session) => (Arc::clone(&session.client), session.sink.clone()),
                None => return Err(ChatterError::StateError("Session is not running".into())),
            }
        };

        if let Err(e) = client.send_event(&ClientEvent::response_cancel()).await {
            warn!("response.cancel not sent: {}", e);
        }
        if let Some(sink) = sink {
            sink.interrupt();
            sink.resume();
        }
        self.publish(status("generation cancelled"));
        Ok(())
    }

    /// True while a session is started and has not failed
    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| !s.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Frames waiting in the playback queue, 0 when idle
    pub async fn queued_playback_frames(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.sink.as_ref())
            .map(|sink| sink.queued_frames())
            .unwrap_or(0)
    }

    pub fn try_recv_event(&self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn event_receiver(&self) -> Receiver<SessionEvent> {
        self.event_rx.clone()
    }

    async fn running_client(&self) -> Result<Arc<ProtocolClient>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.cancel.is_cancelled())
            .map(|s| Arc::clone(&s.client))
            .ok_or_else(|| ChatterError::StateError("Session is not running".into()))
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

struct ActiveSession {
    id: Uuid,
    client: Arc<ProtocolClient>,
    sink: Option<Arc<AudioSink>>,
    capture: Option<Arc<dyn AudioSource>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    async fn shutdown(mut self) {
        self.cancel.cancel();

        let capture = self.capture.take();
        let sink = self.sink.take();
        let halted = tokio::task::spawn_blocking(move || {
            if let Some(capture) = capture {
                capture.stop();
            }
            if let Some(sink) = sink {
                sink.stop();
            }
        })
        .await;
        if let Err(e) = halted {
            warn!("Audio shutdown task failed: {}", e);
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Session task failed: {}", e);
            }
        }

        self.client.close().await;
    }
}

/// Drains the outbound queue so audio callbacks never wait on the socket
async fn forward_outbound(
    client: Arc<ProtocolClient>,
    mut outbound: UnboundedReceiver<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = outbound.recv() => event,
        };
        let Some(event) = event else { break };

        if let Err(e) = client.send_event(&event).await {
            // The receive loop reports the dropped socket
            warn!("Dropping outbound {}: {}", event.event_type(), e);
            if !e.is_recoverable() {
                break;
            }
        }
    }
    debug!("Outbound forwarder exiting");
}

async fn run_receive(
    client: Arc<ProtocolClient>,
    handler: Arc<dyn ProtocolEventHandler>,
    cancel: CancellationToken,
    failure: Arc<FailureReporter>,
) {
    let outcome = AssertUnwindSafe(client.receive_loop(handler, cancel))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => debug!("Receive loop finished"),
        // Already published by the handler
        Ok(Err(ChatterError::ServerError { message, .. })) => {
            error!("Session ended by server: {}", message);
            failure.fail(None);
        }
        Ok(Err(e)) => failure.report(e),
        Err(payload) => failure.report(ChatterError::ChannelError(format!(
            "Receive handler panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Ends a session on its first fatal failure
///
/// Publishes one error and a "disconnected" status, then cancels the session
/// token. Later failures, and failures after a requested stop, are only logged.
struct FailureReporter {
    events: Sender<SessionEvent>,
    cancel: CancellationToken,
    reported: AtomicBool,
}

impl FailureReporter {
    fn new(events: Sender<SessionEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            reported: AtomicBool::new(false),
        }
    }

    fn report(&self, error: ChatterError) {
        self.fail(Some(error));
    }

    fn fail(&self, error: Option<ChatterError>) {
        if self.cancel.is_cancelled() || self.reported.swap(true, Ordering::SeqCst) {
            if let Some(error) = error {
                debug!("Ignoring failure after session end: {}", error);
            }
            return;
        }
        if let Some(error) = error {
            error!("Session failed: {}", error);
            let _ = self.events.send(SessionEvent::Error(error));
        }
        let _ = self.events.send(status("disconnected"));
        self.cancel.cancel();
    }

    /// Run a device callback, turning a panic into a session failure
    fn guard<F: FnOnce()>(&self, context: &str, callback: F) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            self.report(ChatterError::ChannelError(format!(
                "{} panicked: {}",
                context,
                panic_message(payload.as_ref())
            )));
        }
    }
}

impl PlaybackErrorHandler for FailureReporter {
    fn on_device_error(&self, error: ChatterError) {
        self.report(error);
    }
}

/// Routes inbound server events to the sink and the host
struct InboundBridge {
    sink: Arc<AudioSink>,
    events: Sender<SessionEvent>,
    user_speaking: Arc<AtomicBool>,
}

impl ProtocolEventHandler for InboundBridge {
    fn on_text_delta(&self, delta: &str) {
        let _ = self.events.send(SessionEvent::Text(delta.to_string()));
    }

    fn on_audio_delta(&self, frame: AudioFrame) {
        if !self.sink.enqueue(frame) {
            debug!("Discarded audio delta while playback is interrupted");
        }
    }

    fn on_transcript_delta(&self, delta: &str) {
        let _ = self.events.send(SessionEvent::Transcript(delta.to_string()));
    }

    fn on_speech_started(&self) {
        self.sink.interrupt();
    }

    fn on_server_error(&self, error: &ChatterError) {
        let _ = self.events.send(SessionEvent::Error(error.clone()));
    }

    fn on_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session_id } => {
                debug!("Server session {}", session_id.as_deref().unwrap_or("?"));
            }
            // A server-reported turn end resumes unless the user is still talking
            ServerEvent::SpeechStopped => {
                if !self.user_speaking.load(Ordering::SeqCst) {
                    self.sink.resume();
                }
            }
            ServerEvent::ResponseDone { .. } => {
                let _ = self.events.send(status("response complete"));
            }
            _ => {}
        }
    }
}

/// Runs on the capture thread: VAD, barge-in and audio forwarding
struct CaptureBridge {
    vad: Mutex<VoiceActivityDetector>,
    sink: Arc<AudioSink>,
    outbound: UnboundedSender<ClientEvent>,
    events: Sender<SessionEvent>,
    cancel: CancellationToken,
    failure: Arc<FailureReporter>,
    user_speaking: Arc<AtomicBool>,
}

impl CaptureBridge {
    fn send(&self, event: ClientEvent) {
        // Fails only once the forwarder has exited
        let _ = self.outbound.send(event);
    }

    fn handle_frame(&self, frame: AudioFrame) {
        if self.cancel.is_cancelled() {
            return;
        }

        let (transition, speaking) = {
            let mut vad = self.vad.lock();
            let transition = vad.process_frame(&frame);
            (transition, vad.is_speaking())
        };

        match transition {
            Some(VadTransition::SpeechStarted) => {
                self.user_speaking.store(true, Ordering::SeqCst);
                self.sink.interrupt();
                let _ = self.events.send(status("speaking"));
            }
            Some(VadTransition::SpeechEnded) => {
                self.user_speaking.store(false, Ordering::SeqCst);
                self.sink.resume();
                // The local detector owns turn-taking
                self.send(ClientEvent::audio_commit());
                self.send(ClientEvent::response_create());
                let _ = self.events.send(status("listening"));
            }
            None => {}
        }

        if speaking {
            self.send(ClientEvent::audio_append(frame.to_base64()));
        }
    }
}

impl FrameHandler for CaptureBridge {
    fn on_frame(&self, frame: AudioFrame) {
        self.failure.guard("Capture handler", || self.handle_frame(frame));
    }

    fn on_device_error(&self, error: ChatterError) {
        error!("Capture failed: {}", error);
        self.failure.report(error);
    }
}
