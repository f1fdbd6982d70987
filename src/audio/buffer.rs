//! Sample ring buffer for the waveform view
//!
//! A fixed-capacity circular store of the most recent mono samples. It is
//! lossy by nature: once full, every write overwrites the oldest sample.
//! One writer thread feeds it while any number of UI readers take
//! snapshots under a shared lock.

use parking_lot::RwLock;
use std::sync::Arc;

struct RingState {
    samples: Vec<i16>,
    /// Next write position
    head: usize,
    /// Valid samples, capped at capacity
    count: usize,
}

/// Thread-safe circular buffer of i16 samples
pub struct SampleRingBuffer {
    state: RwLock<RingState>,
    capacity: usize,
}

impl SampleRingBuffer {
    /// Create a ring buffer holding `capacity` samples.
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: RwLock::new(RingState {
                samples: vec![0; capacity],
                head: 0,
                count: 0,
            }),
            capacity,
        }
    }

    /// Append samples, overwriting the oldest when full.
    ///
    /// Only one thread may write; readers may run concurrently.
    pub fn write(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }

        let mut state = self.state.write();
        for &sample in samples {
            let head = state.head;
            state.samples[head] = sample;
            state.head = (head + 1) % self.capacity;
            if state.count < self.capacity {
                state.count += 1;
            }
        }
    }

    /// Up to `n` most recent samples, oldest first.
    pub fn read_samples(&self, n: usize) -> Vec<i16> {
        let state = self.state.read();
        if state.count == 0 || n == 0 {
            return Vec::new();
        }

        let n = n.min(state.count);
        // head is the next write slot, so the newest n start n slots back
        let start = (state.head + self.capacity - n) % self.capacity;

        (0..n)
            .map(|i| state.samples[(start + i) % self.capacity])
            .collect()
    }

    /// Number of valid samples held
    pub fn count(&self) -> usize {
        self.state.read().count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.count() as f32 / self.capacity as f32
    }

    /// Forget all samples
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.head = 0;
        state.count = 0;
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<SampleRingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(SampleRingBuffer::new(capacity))
}

/// Decode S16LE bytes into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as S16LE bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
