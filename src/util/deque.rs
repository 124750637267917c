// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Growable sample FIFO used for per-channel PCM buffering.
//!
//! Each [`SampleDeque`] is single-writer single-reader and is always accessed
//! under its owner's audio mutex; consumption cursors belong to the reader.

use std::collections::VecDeque;

/// A FIFO of `f32` samples for one audio plane.
#[derive(Debug, Default)]
pub struct SampleDeque {
    buf: VecDeque<f32>,
}

impl SampleDeque {
    /// Create an empty deque.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty deque with room for `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
        }
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append samples at the back.
    pub fn push_back(&mut self, samples: &[f32]) {
        self.buf.extend(samples.iter().copied());
    }

    /// Copy up to `out.len()` samples from the front without consuming them.
    /// Returns the number of samples copied; the rest of `out` is untouched.
    pub fn peek_front(&self, out: &mut [f32]) -> usize {
        let count = out.len().min(self.buf.len());
        for (dst, src) in out.iter_mut().zip(self.buf.iter()) {
            *dst = *src;
        }
        count
    }

    /// Drop up to `count` samples from the front. Returns how many were
    /// actually dropped.
    pub fn pop_front(&mut self, count: usize) -> usize {
        let count = count.min(self.buf.len());
        self.buf.drain(..count);
        count
    }

    /// Pop exactly `out.len()` samples into `out`, zero-filling if the
    /// buffer underruns. Returns the number of real samples copied.
    pub fn pop_front_into(&mut self, out: &mut [f32]) -> usize {
        let real = self.peek_front(out);
        self.buf.drain(..real);
        for sample in &mut out[real..] {
            *sample = 0.0;
        }
        real
    }

    /// Drain the whole buffer into a vector.
    pub fn take_all(&mut self) -> Vec<f32> {
        self.buf.drain(..).collect()
    }

    /// Remove all samples.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_peek_pop() {
        let mut deque = SampleDeque::new();
        deque.push_back(&[1.0, 2.0, 3.0]);

        let mut out = [0.0; 2];
        assert_eq!(deque.peek_front(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(deque.len(), 3);

        assert_eq!(deque.pop_front(2), 2);
        assert_eq!(deque.len(), 1);

        let mut rest = [0.0; 1];
        assert_eq!(deque.peek_front(&mut rest), 1);
        assert_eq!(rest, [3.0]);
    }

    #[test]
    fn pop_more_than_available() {
        let mut deque = SampleDeque::new();
        deque.push_back(&[1.0]);
        assert_eq!(deque.pop_front(10), 1);
        assert!(deque.is_empty());
    }

    #[test]
    fn pop_into_zero_fills_underrun() {
        let mut deque = SampleDeque::new();
        deque.push_back(&[5.0, 6.0]);

        let mut out = [9.0; 4];
        assert_eq!(deque.pop_front_into(&mut out), 2);
        assert_eq!(out, [5.0, 6.0, 0.0, 0.0]);
        assert!(deque.is_empty());
    }

    #[test]
    fn take_all_drains() {
        let mut deque = SampleDeque::new();
        deque.push_back(&[1.0, 2.0]);
        assert_eq!(deque.take_all(), vec![1.0, 2.0]);
        assert!(deque.is_empty());
    }
}
