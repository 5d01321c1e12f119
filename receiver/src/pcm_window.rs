//! Bounded PCM sample window.

use std::collections::VecDeque;

/// Fixed-capacity FIFO of samples.
///
/// Writing past capacity discards the oldest samples so the newest audio
/// always fits; readers never block.
#[derive(Debug, Clone)]
pub struct PcmWindow {
    // ---
    samples: VecDeque<i16>,
    capacity: usize,
}

impl PcmWindow {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `data`, dropping the oldest samples on overflow.
    pub fn add(&mut self, data: &[i16]) {
        // ---
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let overflow = (self.samples.len() + data.len()).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(data.iter().copied());
    }

    /// Appends `count` samples of silence.
    pub fn add_zero(&mut self, count: usize) {
        // ---
        let count = count.min(self.capacity);
        let overflow = (self.samples.len() + count).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(std::iter::repeat(0).take(count));
    }

    /// Moves up to `out.len()` samples into `out`; returns how many.
    pub fn read(&mut self, out: &mut [i16]) -> usize {
        // ---
        let n = out.len().min(self.samples.len());
        for (dst, src) in out.iter_mut().zip(self.samples.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// Discards up to `count` samples from the front.
    pub fn erase(&mut self, count: usize) {
        // ---
        let count = count.min(self.samples.len());
        self.samples.drain(..count);
    }

    pub fn sample_at(&self, index: usize) -> Option<i16> {
        // ---
        self.samples.get(index).copied()
    }

    pub fn filled(&self) -> usize {
        // ---
        self.samples.len()
    }

    pub fn free(&self) -> usize {
        // ---
        self.capacity - self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        // ---
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        // ---
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        // ---
        self.samples.clear();
    }
}
