//! Microphone capture
//!
//! Provides cross-platform audio input using cpal. A dedicated thread owns
//! the stream; the device callback converts whatever the hardware delivers
//! to mono PCM16 and cuts it into fixed-size frames (about 100 ms).

use crate::audio::device::{AudioDeviceInfo, AudioSource, FrameHandler};
use crate::audio::frame::{AudioFormat, AudioFrame};
use crate::{ChatterError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long `start()` waits for the capture thread to open the device
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

struct CaptureThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Microphone source emitting PCM16 frames of `frame_samples` samples
pub struct AudioCapture {
    device_name: Option<String>,
    format: AudioFormat,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<CaptureThread>>,
}

impl AudioCapture {
    /// Create a capture source; the device is not opened until `start()`
    ///
    /// `device_name` selects the first input device whose name contains the
    /// given text; `None` uses the host default.
    pub fn new(device_name: Option<String>, format: AudioFormat, frame_samples: usize) -> Self {
        Self {
            device_name,
            format,
            frame_samples: frame_samples.max(1),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }
}

impl AudioSource for AudioCapture {
    fn start(&self, handler: Arc<dyn FrameHandler>) -> Result<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            warn!("Already capturing, ignoring start request");
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device_name = self.device_name.clone();
        let format = self.format;
        let frame_samples = self.frame_samples;
        let running = Arc::clone(&self.running);

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("chatter-capture".into())
            .spawn(move || {
                let stream = match open_input_stream(
                    device_name.as_deref(),
                    format,
                    frame_samples,
                    Arc::clone(&running),
                    handler,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // The stream lives exactly as long as this thread
                let _ = stop_rx.recv();
                running.store(false, Ordering::SeqCst);
                drop(stream);
                debug!("Capture thread exiting");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ChatterError::AudioDeviceError(format!("Failed to spawn capture thread: {}", e))
            })?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                *slot = Some(CaptureThread { stop_tx, handle });
                info!("Audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = stop_tx.send(());
                let _ = handle.join();
                Err(ChatterError::AudioDeviceError(
                    "Timed out opening input device".into(),
                ))
            }
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(capture) = self.thread.lock().take() {
            let _ = capture.stop_tx.send(());
            if capture.handle.join().is_err() {
                warn!("Capture thread panicked");
            }
            info!("Audio capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pick the named input device, or the host default
fn select_input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| ChatterError::AudioDeviceError(format!("Failed to list input devices: {}", e)))?
            .find(|d| d.name().map(|n| n.contains(wanted)).unwrap_or(false))
            .ok_or_else(|| {
                ChatterError::AudioDeviceError(format!("No input device matching '{}'", wanted))
            }),
        None => host
            .default_input_device()
            .ok_or_else(|| ChatterError::AudioDeviceError("No input device available".into())),
    }
}

fn open_input_stream(
    device_name: Option<&str>,
    format: AudioFormat,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    handler: Arc<dyn FrameHandler>,
) -> Result<cpal::Stream> {
    let device = select_input_device(device_name)?;
    let rate = SampleRate(format.sample_rate);

    // Prefer mono, fall back to any channel count that supports the rate
    let supported = device
        .supported_input_configs()
        .map_err(|e| ChatterError::AudioDeviceError(format!("Failed to get input configs: {}", e)))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(|c| (c.channels() != 1, c.channels()))
        .ok_or_else(|| {
            ChatterError::AudioDeviceError(format!(
                "Input device does not support {}Hz",
                format.sample_rate
            ))
        })?
        .with_sample_rate(rate);

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    info!(
        "Using input device: {} ({}Hz, {} channel(s), {:?})",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, format, frame_samples, running, handler),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, format, frame_samples, running, handler),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, format, frame_samples, running, handler),
        other => Err(ChatterError::AudioDeviceError(format!(
            "Unsupported input sample format: {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| ChatterError::AudioDeviceError(format!("Failed to start input stream: {}", e)))?;

    Ok(stream)
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    format: AudioFormat,
    frame_samples: usize,
    running: Arc<AtomicBool>,
    handler: Arc<dyn FrameHandler>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let mut pending: Vec<i16> = Vec::with_capacity(frame_samples);

    let error_running = Arc::clone(&running);
    let error_handler = Arc::clone(&handler);
    let err_fn = move |err: cpal::StreamError| {
        error!("Audio input stream error: {}", err);
        // Report once; capture is considered dead from here on
        if error_running.swap(false, Ordering::SeqCst) {
            error_handler.on_device_error(ChatterError::AudioDeviceError(format!(
                "Input stream failed: {}",
                err
            )));
        }
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::SeqCst) {
                    return;
                }

                for chunk in data.chunks(channels) {
                    // Average all channels to create mono
                    let sum: i32 = chunk.iter().map(|&s| i32::from(s.to_sample::<i16>())).sum();
                    pending.push((sum / chunk.len() as i32) as i16);

                    if pending.len() == frame_samples {
                        handler.on_frame(AudioFrame::from_samples(&pending, format));
                        pending.clear();
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| ChatterError::AudioDeviceError(format!("Failed to build input stream: {}", e)))
}

/// List available audio input devices
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_device_name = host.default_input_device().and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| {
                    let name = device.name().ok()?;
                    let is_default = default_device_name.as_ref() == Some(&name);
                    Some(AudioDeviceInfo { name, is_default })
                })
                .collect()
        })
        .unwrap_or_default()
}
