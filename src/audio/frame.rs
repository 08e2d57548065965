//! PCM16 audio frames
//!
//! Frames carry raw little-endian PCM16 bytes exactly as they travel on the
//! wire. The payload is shared behind an `Arc`, so handing a frame from the
//! capture thread to the detector and on to the protocol client never copies
//! the samples again.

use crate::{ChatterError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

/// Sample layout shared by capture, playback and the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Mono PCM16 at the given rate
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Interleaved samples covering `duration`
    pub fn samples_for(&self, duration: Duration) -> usize {
        let per_channel = (u128::from(self.sample_rate) * duration.as_millis() / 1000) as usize;
        per_channel * usize::from(self.channels)
    }

    /// Bytes covering `duration`
    pub fn bytes_for(&self, duration: Duration) -> usize {
        self.samples_for(duration) * self.bytes_per_sample()
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_mono(24_000)
    }
}

/// An immutable chunk of PCM16 audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    data: Arc<[u8]>,
    format: AudioFormat,
}

impl AudioFrame {
    /// Wrap raw little-endian PCM16 bytes
    pub fn from_bytes(data: impl Into<Arc<[u8]>>, format: AudioFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    /// Encode signed 16-bit samples into a frame
    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self::from_bytes(bytes, format)
    }

    /// Decode a base64 payload received from the server
    pub fn from_base64(encoded: &str, format: AudioFormat) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ChatterError::ProtocolError(format!("Invalid base64 audio: {}", e)))?;
        Ok(Self::from_bytes(bytes, format))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode the payload into signed 16-bit samples
    ///
    /// Fails when the payload is not a whole number of 16-bit samples.
    pub fn samples(&self) -> Result<Vec<i16>> {
        if self.format.bits_per_sample != 16 {
            return Err(ChatterError::AudioProcessingError(format!(
                "Unsupported bit depth: {}",
                self.format.bits_per_sample
            )));
        }
        if self.data.len() % 2 != 0 {
            return Err(ChatterError::AudioProcessingError(format!(
                "Odd PCM16 payload length: {} bytes",
                self.data.len()
            )));
        }
        Ok(self
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Playback duration of this frame
    pub fn duration(&self) -> Duration {
        let frame_bytes = self.format.bytes_per_sample() * usize::from(self.format.channels);
        if frame_bytes == 0 || self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        let frames = (self.data.len() / frame_bytes) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / u64::from(self.format.sample_rate))
    }

    /// Base64 text for an `input_audio_buffer.append` payload
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_round_trip_little_endian() {
        let format = AudioFormat::pcm16_mono(24_000);
        let frame = AudioFrame::from_samples(&[1, -2, i16::MAX, i16::MIN], format);
        assert_eq!(frame.bytes()[..4], [0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(frame.samples().unwrap(), vec![1, -2, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_odd_payload_is_rejected() {
        let frame = AudioFrame::from_bytes(vec![0u8, 1, 2], AudioFormat::default());
        assert!(frame.samples().is_err());
    }

    #[test]
    fn test_duration_and_sizes() {
        let format = AudioFormat::pcm16_mono(24_000);
        assert_eq!(format.samples_for(Duration::from_millis(100)), 2_400);
        assert_eq!(format.bytes_for(Duration::from_millis(100)), 4_800);

        let frame = AudioFrame::from_samples(&vec![0i16; 2_400], format);
        assert_eq!(frame.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_base64_payload() {
        let format = AudioFormat::default();
        let frame = AudioFrame::from_bytes(vec![0u8, 1, 2, 3], format);
        let encoded = frame.to_base64();
        assert_eq!(encoded, "AAECAw==");
        assert_eq!(AudioFrame::from_base64(&encoded, format).unwrap(), frame);
        assert!(AudioFrame::from_base64("not base64!", format).is_err());
    }

    #[test]
    fn test_clone_shares_payload() {
        let frame = AudioFrame::from_bytes(vec![0u8; 8], AudioFormat::default());
        let copy = frame.clone();
        assert!(std::ptr::eq(frame.bytes().as_ptr(), copy.bytes().as_ptr()));
    }
}
