//! Interruptible playback queue
//!
//! The sink owns a FIFO of decoded frames and a drain thread that feeds them
//! to a [`PlaybackDevice`]. `interrupt()` clears the FIFO and the device
//! buffer in one critical section and rejects new frames until `resume()`,
//! which is what makes barge-in cut the assistant off mid-sentence.

use crate::audio::device::PlaybackDevice;
use crate::audio::frame::AudioFrame;
use crate::{ChatterError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between retries while the device buffer is full
const DEVICE_FULL_BACKOFF: Duration = Duration::from_millis(5);

struct SinkState {
    queue: VecDeque<AudioFrame>,
    interrupted: bool,
    running: bool,
    /// Bumped on every interrupt so the drain thread abandons a frame it
    /// was halfway through
    epoch: u64,
    frames_played: u64,
}

struct SinkShared {
    state: Mutex<SinkState>,
    signal: Condvar,
    device: Arc<dyn PlaybackDevice>,
}

pub struct AudioSink {
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioSink {
    pub fn new(device: Arc<dyn PlaybackDevice>) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                state: Mutex::new(SinkState {
                    queue: VecDeque::new(),
                    interrupted: false,
                    running: false,
                    epoch: 0,
                    frames_played: 0,
                }),
                signal: Condvar::new(),
                device,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the drain thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Audio sink already running");
            return Ok(());
        }

        {
            let mut state = self.shared.state.lock();
            state.running = true;
            state.interrupted = false;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("chatter-playback".into())
            .spawn(move || drain_loop(shared))
            .map_err(|e| {
                self.shared.state.lock().running = false;
                ChatterError::AudioDeviceError(format!("Failed to spawn playback thread: {}", e))
            })?;

        *worker = Some(handle);
        info!("Audio sink started");
        Ok(())
    }

    /// Queue a frame for playback
    ///
    /// Returns `false` when the frame was discarded because the sink is
    /// interrupted or stopped.
    pub fn enqueue(&self, frame: AudioFrame) -> bool {
        let mut state = self.shared.state.lock();
        if !state.running || state.interrupted {
            return false;
        }
        state.queue.push_back(frame);
        drop(state);
        self.shared.signal.notify_one();
        true
    }

    /// Cut playback immediately and drop anything queued
    ///
    /// Idempotent; safe to call concurrently from the receive loop and the
    /// capture thread.
    pub fn interrupt(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.queue.len();
        state.interrupted = true;
        state.queue.clear();
        state.epoch = state.epoch.wrapping_add(1);
        self.shared.device.clear();
        drop(state);

        if dropped > 0 {
            debug!("Playback interrupted, dropped {} queued frames", dropped);
        }
    }

    /// Accept frames again after an interrupt
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if state.interrupted {
            state.interrupted = false;
            debug!("Playback resumed");
        }
        drop(state);
        self.shared.signal.notify_one();
    }

    /// Halt the drain thread and release the device. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.queue.clear();
            state.epoch = state.epoch.wrapping_add(1);
        }
        self.shared.signal.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Playback thread panicked");
            }
            self.shared.device.clear();
            self.shared.device.close();
            info!("Audio sink stopped");
        }
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.state.lock().interrupted
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Frames fully handed to the device since start
    pub fn frames_played(&self) -> u64 {
        self.shared.state.lock().frames_played
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(shared: Arc<SinkShared>) {
    debug!("Playback drain thread started");

    loop {
        let (frame, epoch) = {
            let mut state = shared.state.lock();
            while state.running && (state.queue.is_empty() || state.interrupted) {
                shared.signal.wait(&mut state);
            }
            if !state.running {
                break;
            }
            match state.queue.pop_front() {
                Some(frame) => (frame, state.epoch),
                None => continue,
            }
        };

        let samples = match frame.samples() {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Skipping undecodable playback frame: {}", e);
                continue;
            }
        };

        let mut offset = 0;
        let mut completed = true;
        while offset < samples.len() {
            {
                // Writing under the state lock keeps interrupt() and the
                // device clear atomic with respect to this write
                let state = shared.state.lock();
                if !state.running || state.epoch != epoch {
                    completed = false;
                    break;
                }
                offset += shared.device.write(&samples[offset..]);
            }
            if offset < samples.len() {
                thread::sleep(DEVICE_FULL_BACKOFF);
            }
        }

        if completed {
            shared.state.lock().frames_played += 1;
        }
    }

    debug!("Playback drain thread exiting");
}
