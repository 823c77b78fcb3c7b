use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{
    audio::{buffer::RingBuffer, constants::SAMPLES_PER_SECOND, filters::Filters},
    common::{errors::NodeError, types::AtomicF64},
    track::TrackDescriptor,
};

/// Everything the decode thread and the track façade share.
pub(crate) struct TrackState {
    pub descriptor: TrackDescriptor,
    pub ring: RingBuffer,
    /// `NaN` until known.
    duration: AtomicF64,
    /// End of the last frame pushed into the ring, in source seconds.
    decoded_position: AtomicF64,
    pub loading: AtomicBool,
    pub ended: AtomicBool,
    pub stopped: AtomicBool,
    filters: Mutex<Filters>,
    filters_version: AtomicU64,
    /// Source seconds per buffered output second under the current filters.
    timescale_ratio: AtomicF64,
    error: Mutex<Option<NodeError>>,
}

impl TrackState {
    pub fn new(descriptor: TrackDescriptor, buffer_seconds: f64) -> Self {
        let duration = match (descriptor.is_live, descriptor.duration) {
            (false, Some(d)) => d,
            _ => f64::NAN,
        };
        let filters = descriptor.filters.clone();
        let timescale_ratio = filters.timescale_ratio();
        let start = descriptor.start_position.max(0.0);
        Self {
            descriptor,
            ring: RingBuffer::from_seconds(buffer_seconds),
            duration: AtomicF64::new(duration),
            decoded_position: AtomicF64::new(start),
            loading: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            filters: Mutex::new(filters),
            filters_version: AtomicU64::new(0),
            timescale_ratio: AtomicF64::new(timescale_ratio),
            error: Mutex::new(None),
        }
    }

    pub fn duration(&self) -> Option<f64> {
        if self.descriptor.is_live {
            return None;
        }
        let d = self.duration.load();
        (!d.is_nan()).then_some(d)
    }

    pub fn set_duration(&self, seconds: Option<f64>) {
        if let Some(s) = seconds.filter(|s| s.is_finite() && *s > 0.0) {
            self.duration.store(s);
        }
    }

    pub fn decoded_position(&self) -> f64 {
        self.decoded_position.load()
    }

    pub fn set_decoded_position(&self, seconds: f64) {
        self.decoded_position.store(seconds.max(0.0));
    }

    /// Seconds of output audio sitting in the ring.
    pub fn buffered_seconds(&self) -> f64 {
        self.ring.len() as f64 / SAMPLES_PER_SECOND as f64
    }

    /// The ring's content measured in source time, so it can be subtracted
    /// from [`decoded_position`](Self::decoded_position).
    pub fn buffered_source_seconds(&self) -> f64 {
        self.buffered_seconds() * self.timescale_ratio.load()
    }

    pub fn filters(&self) -> Filters {
        self.filters.lock().clone()
    }

    pub fn filters_version(&self) -> u64 {
        self.filters_version.load(Ordering::Acquire)
    }

    pub fn set_filters(&self, filters: Filters) {
        self.timescale_ratio.store(filters.timescale_ratio());
        *self.filters.lock() = filters;
        self.filters_version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Record a fatal error. The first one wins.
    pub fn fail(&self, err: NodeError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take_error(&self) -> Option<NodeError> {
        self.error.lock().take()
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }
}
