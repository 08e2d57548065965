#![allow(dead_code)]

use chatter::audio::{
    AudioFormat, AudioFrame, AudioSource, DeviceProvider, FrameHandler, PlaybackDevice, PlaybackErrorHandler,
};
use chatter::{ChatterError, SessionConfig};
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Request details seen by the mock server during the upgrade
#[derive(Debug, Default, Clone)]
pub struct Handshake {
    pub authorization: String,
    pub beta: String,
    pub query: String,
}

/// Accept one connection on a random port and run `script` against it
///
/// Returns the endpoint to configure and a handle resolving to the captured
/// handshake plus whatever the script returned.
pub async fn serve_once<F, Fut, T>(script: F) -> (String, JoinHandle<(Handshake, T)>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let address = listener.local_addr().expect("local addr should be available");

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("server should accept");
        let captured = Arc::new(Mutex::new(Handshake::default()));
        let captured_inner = Arc::clone(&captured);
        let ws = accept_hdr_async(stream, move |req: &Request, response: Response| {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            *captured_inner.lock().expect("handshake lock should not poison") = Handshake {
                authorization: header("authorization"),
                beta: header("openai-beta"),
                query: req.uri().query().unwrap_or_default().to_string(),
            };
            Ok(response)
        })
        .await
        .expect("handshake should succeed");

        let result = script(ws).await;
        let handshake = captured.lock().expect("handshake lock should not poison").clone();
        (handshake, result)
    });

    (format!("ws://{}/v1/realtime", address), handle)
}

pub fn test_config(endpoint: &str) -> SessionConfig {
    SessionConfig::default()
        .with_endpoint(endpoint)
        .with_api_key("sk-test")
        .with_model("test-model")
        .with_connect_timeout(Duration::from_secs(2))
}

/// Next JSON text frame from the client, or `None` on close/timeout
pub async fn next_json(ws: &mut ServerSocket) -> Option<Value> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(&text).expect("client frame should be JSON"))
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
            Ok(Some(Ok(_))) => {}
        }
    }
}

/// Read frames until one with the given `type` arrives
pub async fn expect_event(ws: &mut ServerSocket, event_type: &str) -> Value {
    loop {
        let value = next_json(ws)
            .await
            .unwrap_or_else(|| panic!("connection ended before {}", event_type));
        if value["type"] == event_type {
            return value;
        }
    }
}

/// Keep reading until the client goes away
pub async fn drain_until_closed(ws: &mut ServerSocket) {
    while let Ok(Some(Ok(message))) = timeout(Duration::from_secs(5), ws.next()).await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn loud_frame() -> AudioFrame {
    AudioFrame::from_samples(&[8_000i16; 2_400], AudioFormat::default())
}

pub fn quiet_frame() -> AudioFrame {
    AudioFrame::from_samples(&[0i16; 2_400], AudioFormat::default())
}

/// Microphone driven by the test through `push`
#[derive(Default)]
pub struct FakeSource {
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    running: AtomicBool,
    pub stops: AtomicUsize,
    pub fail_start: AtomicBool,
}

impl FakeSource {
    pub fn is_running_now(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn push(&self, frame: AudioFrame) {
        let handler = self.handler.lock().expect("handler lock").clone();
        if let Some(handler) = handler {
            if self.running.load(Ordering::SeqCst) {
                handler.on_frame(frame);
            }
        }
    }

    pub fn fail(&self, error: ChatterError) {
        let handler = self.handler.lock().expect("handler lock").clone();
        if let Some(handler) = handler {
            self.running.store(false, Ordering::SeqCst);
            handler.on_device_error(error);
        }
    }
}

impl AudioSource for FakeSource {
    fn start(&self, handler: Arc<dyn FrameHandler>) -> chatter::Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ChatterError::AudioDeviceError("microphone unplugged".into()));
        }
        *self.handler.lock().expect("handler lock") = Some(handler);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.handler.lock().expect("handler lock").take();
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn format(&self) -> AudioFormat {
        AudioFormat::default()
    }
}

/// Speaker that records samples, or stalls when `accepting` is false
pub struct FakePlayback {
    pub written: Mutex<Vec<i16>>,
    pub accepting: AtomicBool,
    pub closed: AtomicBool,
    on_error: Mutex<Option<Arc<dyn PlaybackErrorHandler>>>,
}

impl FakePlayback {
    pub fn new(accepting: bool) -> Self {
        Self {
            written: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(accepting),
            closed: AtomicBool::new(false),
            on_error: Mutex::new(None),
        }
    }

    /// Simulate the output stream dying mid-session
    pub fn fail(&self, error: ChatterError) {
        self.accepting.store(false, Ordering::SeqCst);
        let handler = self.on_error.lock().expect("error handler lock").clone();
        if let Some(handler) = handler {
            handler.on_device_error(error);
        }
    }
}

impl PlaybackDevice for FakePlayback {
    fn write(&self, samples: &[i16]) -> usize {
        if !self.accepting.load(Ordering::SeqCst) {
            return 0;
        }
        self.written.lock().expect("written lock").extend_from_slice(samples);
        samples.len()
    }

    fn clear(&self) {}

    fn buffered(&self) -> usize {
        0
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn format(&self) -> AudioFormat {
        AudioFormat::default()
    }
}

pub struct FakeDevices {
    pub source: Arc<FakeSource>,
    pub playback: Arc<FakePlayback>,
}

impl FakeDevices {
    pub fn new(playback_accepting: bool) -> Arc<Self> {
        Arc::new(Self {
            source: Arc::new(FakeSource::default()),
            playback: Arc::new(FakePlayback::new(playback_accepting)),
        })
    }
}

impl DeviceProvider for FakeDevices {
    fn open_input(&self, _format: AudioFormat, _frame_samples: usize) -> chatter::Result<Arc<dyn AudioSource>> {
        Ok(self.source.clone())
    }

    fn open_output(
        &self,
        _format: AudioFormat,
        on_error: Arc<dyn PlaybackErrorHandler>,
    ) -> chatter::Result<Arc<dyn PlaybackDevice>> {
        *self.playback.on_error.lock().expect("error handler lock") = Some(on_error);
        Ok(self.playback.clone())
    }
}
