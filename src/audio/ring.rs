//! Per-session ring of f32 samples, capped at a wall-clock duration.
//!
//! Ingress pushes raw PCM (int16 or float), the inference worker reads on
//! its own cadence. Every operation is serialized by one internal lock, so
//! a VAD tick observes exactly the samples pushed up to that instant.

use std::collections::VecDeque;
use std::sync::Mutex;

/// All audio in this system is 16 kHz mono.
pub const SAMPLE_RATE: usize = 16_000;

pub struct AudioRing {
    inner: Mutex<VecDeque<f32>>,
    max_samples: usize,
    sample_rate: usize,
}

impl AudioRing {
    pub fn new(max_seconds: f32, sample_rate: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_samples: (max_seconds * sample_rate as f32) as usize,
            sample_rate,
        }
    }

    /// Append int16 samples, normalized to `[-1.0, 1.0)` as `i / 32768.0`.
    /// Oldest samples are dropped once the ring exceeds its cap.
    pub fn push_i16(&self, samples: &[i16]) {
        let mut buf = self.inner.lock().expect("audio ring lock poisoned");
        for &s in samples {
            buf.push_back(s as f32 / 32768.0);
        }
        while buf.len() > self.max_samples {
            buf.pop_front();
        }
    }

    /// Append f32 samples as-is, same drop rule as [`push_i16`](Self::push_i16).
    pub fn push_f32(&self, samples: &[f32]) {
        let mut buf = self.inner.lock().expect("audio ring lock poisoned");
        buf.extend(samples.iter().copied());
        while buf.len() > self.max_samples {
            buf.pop_front();
        }
    }

    /// Atomic read-and-clear of everything buffered so far.
    pub fn take_all_clear(&self) -> Vec<f32> {
        let mut buf = self.inner.lock().expect("audio ring lock poisoned");
        buf.drain(..).collect()
    }

    /// Copy of the last `ms` milliseconds (or fewer if the ring is smaller).
    /// Does not mutate.
    pub fn snapshot_tail_ms(&self, ms: usize) -> Vec<f32> {
        let buf = self.inner.lock().expect("audio ring lock poisoned");
        let want = ms * self.sample_rate / 1000;
        let n = want.min(buf.len());
        buf.iter().skip(buf.len() - n).copied().collect()
    }

    pub fn duration_ms(&self) -> f32 {
        let buf = self.inner.lock().expect("audio ring lock poisoned");
        (buf.len() * 1000) as f32 / self.sample_rate as f32
    }

    pub fn has_min_duration(&self, ms: usize) -> bool {
        let buf = self.inner.lock().expect("audio ring lock poisoned");
        buf.len() >= ms * self.sample_rate / 1000
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("audio ring lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("audio ring lock poisoned").clear();
    }
}
