//! Energy-based voice activity detection
//!
//! Each frame is reduced to its root-mean-square energy, normalized to
//! [0, 1]. Speech starts after `min_speech_frames` consecutive frames above
//! the threshold and ends after `min_silence_frames` consecutive frames at or
//! below it. Raising `min_silence_frames` makes the detector ride out short
//! pauses at the cost of slower barge-in release.

use crate::audio::frame::AudioFrame;
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tuning parameters for the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Normalized RMS energy a frame must exceed to count as speech
    pub threshold: f32,
    /// Consecutive loud frames needed to enter the speaking state
    pub min_speech_frames: u32,
    /// Consecutive quiet frames needed to leave the speaking state
    pub min_silence_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            min_speech_frames: 3,
            min_silence_frames: 10,
        }
    }
}

/// Counters mutated by [`VoiceActivityDetector::process_frame`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadState {
    pub speech_frame_count: u32,
    pub silence_frame_count: u32,
    pub is_speaking: bool,
}

/// State change reported by a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechEnded,
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    last_energy: f32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::default(),
            last_energy: 0.0,
        }
    }

    /// Classify one frame and advance the hysteresis counters
    ///
    /// A frame that cannot be decoded is logged and counted as silence so
    /// the capture thread is never held up.
    pub fn process_frame(&mut self, frame: &AudioFrame) -> Option<VadTransition> {
        let energy = match frame_energy(frame) {
            Ok(energy) => energy,
            Err(e) => {
                warn!("VAD could not classify frame, treating as silence: {}", e);
                0.0
            }
        };
        self.last_energy = energy;

        if energy > self.config.threshold {
            self.state.speech_frame_count = self.state.speech_frame_count.saturating_add(1);
            self.state.silence_frame_count = 0;

            if !self.state.is_speaking
                && self.state.speech_frame_count >= self.config.min_speech_frames
            {
                self.state.is_speaking = true;
                debug!("Speech started (energy {:.4})", energy);
                return Some(VadTransition::SpeechStarted);
            }
        } else {
            self.state.silence_frame_count = self.state.silence_frame_count.saturating_add(1);
            self.state.speech_frame_count = 0;

            if self.state.is_speaking
                && self.state.silence_frame_count >= self.config.min_silence_frames
            {
                self.state.is_speaking = false;
                debug!("Speech ended after {} quiet frames", self.state.silence_frame_count);
                return Some(VadTransition::SpeechEnded);
            }
        }

        None
    }

    pub fn is_speaking(&self) -> bool {
        self.state.is_speaking
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Energy of the most recently processed frame
    pub fn last_energy(&self) -> f32 {
        self.last_energy
    }

    pub fn config(&self) -> VadConfig {
        self.config
    }

    /// Forget all counters and return to silence
    pub fn reset(&mut self) {
        self.state = VadState::default();
        self.last_energy = 0.0;
    }
}

/// Root-mean-square energy of a PCM16 frame, normalized to [0, 1]
pub fn frame_energy(frame: &AudioFrame) -> Result<f32> {
    let samples = frame.samples()?;
    if samples.is_empty() {
        return Ok(0.0);
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = f64::from(s) / 32768.0;
            normalized * normalized
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();

    Ok(rms.clamp(0.0, 1.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFormat;

    fn frame_with_amplitude(amplitude: i16) -> AudioFrame {
        let samples: Vec<i16> = (0..480)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        AudioFrame::from_samples(&samples, AudioFormat::pcm16_mono(24_000))
    }

    fn loud() -> AudioFrame {
        // ~0.3 normalized energy
        frame_with_amplitude(10_000)
    }

    fn quiet() -> AudioFrame {
        frame_with_amplitude(50)
    }

    #[test]
    fn test_energy_of_square_wave() {
        let energy = frame_energy(&frame_with_amplitude(16_384)).unwrap();
        assert!((energy - 0.5).abs() < 1e-3);
        assert_eq!(frame_energy(&frame_with_amplitude(0)).unwrap(), 0.0);
    }

    #[test]
    fn test_default_tuning() {
        let config = VadConfig::default();
        assert_eq!(config.threshold, 0.02);
        assert_eq!(config.min_speech_frames, 3);
        assert_eq!(config.min_silence_frames, 10);
    }

    #[test]
    fn test_interrupted_run_does_not_start_speech() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());

        assert_eq!(vad.process_frame(&loud()), None);
        assert_eq!(vad.process_frame(&loud()), None);
        assert_eq!(vad.process_frame(&quiet()), None);
        assert!(!vad.is_speaking());

        assert_eq!(vad.process_frame(&loud()), None);
        assert_eq!(vad.process_frame(&loud()), None);
        assert_eq!(vad.process_frame(&loud()), Some(VadTransition::SpeechStarted));
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_silence_needs_full_run_to_end_speech() {
        let config = VadConfig {
            threshold: 0.02,
            min_speech_frames: 1,
            min_silence_frames: 4,
        };
        let mut vad = VoiceActivityDetector::new(config);
        assert_eq!(vad.process_frame(&loud()), Some(VadTransition::SpeechStarted));

        // Three quiet frames then speech again: no flip
        for _ in 0..3 {
            assert_eq!(vad.process_frame(&quiet()), None);
        }
        assert_eq!(vad.process_frame(&loud()), None);
        assert!(vad.is_speaking());

        for _ in 0..3 {
            assert_eq!(vad.process_frame(&quiet()), None);
        }
        assert_eq!(vad.process_frame(&quiet()), Some(VadTransition::SpeechEnded));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_alternating_stream_never_flips_below_counts() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        for i in 0..100 {
            let frame = if i % 2 == 0 { loud() } else { quiet() };
            assert_eq!(vad.process_frame(&frame), None);
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_counters_track_runs() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default());
        vad.process_frame(&loud());
        vad.process_frame(&loud());
        assert_eq!(
            vad.state(),
            VadState {
                speech_frame_count: 2,
                silence_frame_count: 0,
                is_speaking: false,
            }
        );
        vad.process_frame(&quiet());
        assert_eq!(vad.state().speech_frame_count, 0);
        assert_eq!(vad.state().silence_frame_count, 1);
    }

    #[test]
    fn test_undecodable_frame_counts_as_silence() {
        let config = VadConfig {
            threshold: 0.02,
            min_speech_frames: 1,
            min_silence_frames: 1,
        };
        let mut vad = VoiceActivityDetector::new(config);
        vad.process_frame(&loud());
        assert!(vad.is_speaking());

        let broken = AudioFrame::from_bytes(vec![0xFFu8; 5], AudioFormat::default());
        assert_eq!(vad.process_frame(&broken), Some(VadTransition::SpeechEnded));
        assert_eq!(vad.last_energy(), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut vad = VoiceActivityDetector::new(VadConfig {
            min_speech_frames: 1,
            ..VadConfig::default()
        });
        vad.process_frame(&loud());
        assert!(vad.is_speaking());
        vad.reset();
        assert_eq!(vad.state(), VadState::default());
    }
}
