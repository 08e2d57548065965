//! Seams between the session core and concrete audio hardware
//!
//! The orchestrator only talks to these traits. The cpal-backed
//! implementations live in `input` and `output`; tests plug in fakes.

use crate::audio::frame::{AudioFormat, AudioFrame};
use crate::{ChatterError, Result};
use std::sync::Arc;

/// Receives captured frames on the capture thread
///
/// Implementations must return quickly and must not panic: they run inside
/// the device callback.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: AudioFrame);

    /// The device failed mid-session; capture has stopped
    fn on_device_error(&self, error: ChatterError);
}

/// A microphone that emits fixed-size PCM16 frames
pub trait AudioSource: Send + Sync {
    /// Open the device and begin delivering frames to `handler`
    ///
    /// Device-open failures are returned as `AudioDeviceError`.
    fn start(&self, handler: Arc<dyn FrameHandler>) -> Result<()>;

    /// Halt the device and join its thread. Safe to call repeatedly and
    /// from any thread.
    fn stop(&self);

    fn is_running(&self) -> bool;

    fn format(&self) -> AudioFormat;
}

/// A speaker with a small internal buffer fed by the sink's drain thread
pub trait PlaybackDevice: Send + Sync {
    /// Queue as many samples as currently fit, returning how many were taken.
    /// Never blocks.
    fn write(&self, samples: &[i16]) -> usize;

    /// Drop everything buffered but not yet played
    fn clear(&self);

    /// Samples buffered but not yet played
    fn buffered(&self) -> usize;

    /// Release the device. Safe to call repeatedly.
    fn close(&self);

    fn format(&self) -> AudioFormat;
}

/// Told when a speaker fails after it was opened
///
/// Called at most once per device, from the device's own thread.
pub trait PlaybackErrorHandler: Send + Sync {
    fn on_device_error(&self, error: ChatterError);
}

/// Opens devices for a session
pub trait DeviceProvider: Send + Sync {
    fn open_input(&self, format: AudioFormat, frame_samples: usize) -> Result<Arc<dyn AudioSource>>;

    /// Open a speaker; runtime failures go to `on_error`
    fn open_output(
        &self,
        format: AudioFormat,
        on_error: Arc<dyn PlaybackErrorHandler>,
    ) -> Result<Arc<dyn PlaybackDevice>>;
}

/// Audio device information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the host's default device
    pub is_default: bool,
}
