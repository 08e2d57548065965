//! Thread-safe ring buffer between the sink drain thread and the speaker
//!
//! Unlike a capture buffer, playback never overwrites: a full buffer
//! rejects the excess and the writer retries once the device has consumed
//! some samples.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Bounded PCM16 FIFO shared by producer and device callback
#[derive(Clone)]
pub struct PlaybackRingBuffer {
    buffer: Arc<Mutex<HeapRb<i16>>>,
}

impl PlaybackRingBuffer {
    /// Create a buffer holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(capacity.max(1)))),
        }
    }

    /// Push as many samples as fit, returning the number accepted
    pub fn write(&self, samples: &[i16]) -> usize {
        self.buffer.lock().push_slice(samples)
    }

    /// Fill `out` from the buffer, returning the number of samples copied.
    /// The remainder of `out` is left untouched.
    pub fn read_into(&self, out: &mut [i16]) -> usize {
        self.buffer.lock().pop_slice(out)
    }

    /// Drop all buffered samples
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    /// Number of samples waiting to be played
    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Free space in samples
    pub fn vacant(&self) -> usize {
        self.buffer.lock().vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let buffer = PlaybackRingBuffer::new(16);
        assert_eq!(buffer.write(&[1, 2, 3, 4]), 4);
        assert_eq!(buffer.len(), 4);

        let mut out = [0i16; 3];
        assert_eq!(buffer.read_into(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_full_buffer_rejects_excess() {
        let buffer = PlaybackRingBuffer::new(4);
        let data: Vec<i16> = (0..10).collect();

        assert_eq!(buffer.write(&data), 4);
        assert_eq!(buffer.vacant(), 0);
        assert_eq!(buffer.write(&data[4..]), 0);

        // Oldest samples survive
        let mut out = [0i16; 4];
        buffer.read_into(&mut out);
        assert_eq!(out, [0, 1, 2, 3]);
    }

    #[test]
    fn test_short_read_leaves_tail() {
        let buffer = PlaybackRingBuffer::new(8);
        buffer.write(&[7, 8]);

        let mut out = [0i16; 4];
        assert_eq!(buffer.read_into(&mut out), 2);
        assert_eq!(out, [7, 8, 0, 0]);
    }

    #[test]
    fn test_clear() {
        let buffer = PlaybackRingBuffer::new(100);
        buffer.write(&[1, 2, 3]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 100);
    }

    #[test]
    fn test_clone_shares_buffer() {
        let producer = PlaybackRingBuffer::new(100);
        let consumer = producer.clone();

        producer.write(&[1, 2, 3]);
        assert_eq!(consumer.len(), 3);

        let mut out = [0i16; 3];
        consumer.read_into(&mut out);
        assert!(producer.is_empty());
    }
}
