pub mod buffer;
pub mod device;
pub mod frame;
#[cfg(feature = "audio-io")]
pub mod input;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod sink;
pub mod vad;

pub use buffer::PlaybackRingBuffer;
pub use device::{
    AudioDeviceInfo, AudioSource, DeviceProvider, FrameHandler, PlaybackDevice, PlaybackErrorHandler,
};
pub use frame::{AudioFormat, AudioFrame};
#[cfg(feature = "audio-io")]
pub use input::{list_input_devices, AudioCapture};
#[cfg(feature = "audio-io")]
pub use output::{list_output_devices, CpalDevices, CpalPlayback};
pub use sink::AudioSink;
pub use vad::{VadConfig, VadState, VadTransition, VoiceActivityDetector};
