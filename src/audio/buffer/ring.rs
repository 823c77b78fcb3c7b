//! Bounded PCM buffer between one decode thread and the scheduler.
//!
//! Capacity is expressed in interleaved samples. The `accepting` flag is the
//! backpressure signal: it is set exactly while `len < capacity`.

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::audio::constants::{FRAME_SIZE_SAMPLES, SAMPLES_PER_SECOND};

struct RingState {
    samples: VecDeque<i16>,
    accepting: bool,
    closed: bool,
}

pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    accepting: Condvar,
    readable: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(FRAME_SIZE_SAMPLES);
        Self {
            capacity,
            state: Mutex::new(RingState {
                samples: VecDeque::with_capacity(capacity),
                accepting: true,
                closed: false,
            }),
            accepting: Condvar::new(),
            readable: Condvar::new(),
        }
    }

    /// Buffer sized for `seconds` of 48 kHz stereo output.
    pub fn from_seconds(seconds: f64) -> Self {
        Self::new((seconds.max(0.0) * SAMPLES_PER_SECOND as f64) as usize)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append as much of `frame` as fits. Returns the number of samples taken;
    /// the caller keeps the remainder for its next write.
    pub fn write(&self, frame: &[i16]) -> usize {
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }

        let room = self.capacity - state.samples.len();
        let taken = frame.len().min(room);
        state.samples.extend(frame[..taken].iter().copied());
        state.accepting = state.samples.len() < self.capacity;
        drop(state);

        if taken > 0 {
            self.readable.notify_one();
        }
        taken
    }

    /// Pop up to `n` samples. `None` when nothing is buffered.
    pub fn read(&self, n: usize) -> Option<Vec<i16>> {
        let mut state = self.state.lock();
        let take = n.min(state.samples.len());
        if take == 0 {
            return None;
        }

        let out: Vec<i16> = state.samples.drain(..take).collect();
        state.accepting = state.samples.len() < self.capacity;
        drop(state);

        self.accepting.notify_one();
        Some(out)
    }

    /// Drop buffered audio, keeping at most the frame that is about to play.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.samples.truncate(FRAME_SIZE_SAMPLES);
        state.accepting = state.samples.len() < self.capacity;
        drop(state);
        self.accepting.notify_all();
    }

    /// Block until the buffer has room, it is closed, or `timeout` passes.
    /// Returns whether a write would be accepted.
    pub fn wait_accepting(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.accepting && !state.closed {
            self.accepting.wait_for(&mut state, timeout);
        }
        state.accepting && !state.closed
    }

    /// Block until data is available, the buffer is woken, or `timeout`
    /// passes. Returns whether data is available.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.samples.is_empty() && !state.closed {
            self.readable.wait_for(&mut state, timeout);
        }
        !state.samples.is_empty()
    }

    /// Wake a reader parked in [`wait_readable`](Self::wait_readable), e.g.
    /// when the producer finished without writing anything.
    pub fn wake_readers(&self) {
        self.readable.notify_all();
    }

    /// Refuse further writes and wake both sides.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.accepting.notify_all();
        self.readable.notify_all();
    }

    /// Close and free the backing storage.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.samples = VecDeque::new();
        state.accepting = true;
        drop(state);
        self.accepting.notify_all();
        self.readable.notify_all();
    }
}
