//! Bounded interleaved sample queue between the decode, resample and output stages.
//!
//! Producers block when the queue is full, the output callback only ever pops without
//! blocking. Closing the queue wakes every waiter: producers drop what they still hold,
//! consumers drain what is buffered and then see the end.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub struct SampleQueue {
    channels: usize,
    capacity: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    samples: VecDeque<f32>,
    closed: bool,
}

pub enum PopStrategy {
    /// Wait for exactly `frames`; `None` if the queue closes first.
    BlockingExact { frames: usize },
    /// Wait for at least one frame, return up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Return what is buffered right now, up to `max_frames`.
    NonBlocking { max_frames: usize },
}

/// Queue capacity in samples for `seconds` of audio. Non-finite or non-positive
/// durations fall back to two seconds.
pub fn capacity_for(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let seconds = if seconds.is_finite() && seconds > 0.0 { seconds } else { 2.0 };
    ((rate_hz as f32 * seconds).ceil() as usize).saturating_mul(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, capacity: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            capacity: capacity.max(channels),
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len_frames(&self) -> usize {
        self.lock().samples.len() / self.channels
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed and nothing left to read.
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.samples.len() < self.channels
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    /// Push samples, waiting for room. Returns `false` if the queue closed before
    /// everything was accepted.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut inner = self.lock();
            while inner.samples.len() >= self.capacity && !inner.closed {
                inner = self.cv.wait(inner).unwrap_or_else(PoisonError::into_inner);
            }
            if inner.closed {
                return false;
            }
            let room = self.capacity - inner.samples.len();
            let take = room.min(samples.len() - offset);
            inner.samples.extend(&samples[offset..offset + take]);
            offset += take;
            drop(inner);
            self.cv.notify_all();
        }
        true
    }

    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut inner = self.lock();
        let max_frames = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while inner.samples.len() < want && !inner.closed {
                    inner = self.cv.wait(inner).unwrap_or_else(PoisonError::into_inner);
                }
                if inner.samples.len() < want {
                    return None;
                }
                frames
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while inner.samples.len() < self.channels && !inner.closed {
                    inner = self.cv.wait(inner).unwrap_or_else(PoisonError::into_inner);
                }
                max_frames
            }
            PopStrategy::NonBlocking { max_frames } => max_frames,
        };
        let frames = (inner.samples.len() / self.channels).min(max_frames);
        if frames == 0 {
            return None;
        }
        let out: Vec<f32> = inner.samples.drain(..frames * self.channels).collect();
        drop(inner);
        self.cv.notify_all();
        Some(out)
    }

    /// Wait up to `timeout` for any frame to arrive.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let inner = self.lock();
        if inner.samples.len() >= self.channels {
            return true;
        }
        let (inner, _) = self
            .cv
            .wait_timeout(inner, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        inner.samples.len() >= self.channels
    }
}
