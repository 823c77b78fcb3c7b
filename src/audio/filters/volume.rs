use super::AudioFilter;
use crate::audio::constants::apply_gain;

/// Filter-level volume. Shares the 2.0× ceiling with track and master gain.
pub struct VolumeFilter {
    volume: f32,
}

impl VolumeFilter {
    pub fn new(volume: f32) -> Self {
        Self {
            volume: volume.max(0.0),
        }
    }
}

impl AudioFilter for VolumeFilter {
    fn process(&mut self, samples: &mut [i16]) {
        apply_gain(samples, self.volume);
    }

    fn is_enabled(&self) -> bool {
        (self.volume - 1.0).abs() > f32::EPSILON
    }

    fn reset(&mut self) {}
}
