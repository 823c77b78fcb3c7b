use super::{AudioFilter, lfo::Lfo};

/// Slow stereo panning ("8D audio").
pub struct RotationFilter {
    lfo: Lfo,
}

impl RotationFilter {
    pub fn new(sample_rate: u32, rotation_hz: f64) -> Self {
        Self {
            lfo: Lfo::new(sample_rate, rotation_hz, 1.0),
        }
    }
}

impl AudioFilter for RotationFilter {
    fn process(&mut self, samples: &mut [i16]) {
        if self.lfo.frequency == 0.0 {
            return;
        }

        for frame in samples.chunks_exact_mut(2) {
            let pan = self.lfo.next_value();
            let left = frame[0] as f64 * (1.0 - pan) / 2.0;
            let right = frame[1] as f64 * (1.0 + pan) / 2.0;
            frame[0] = (left as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            frame[1] = (right as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }

    fn is_enabled(&self) -> bool {
        self.lfo.frequency != 0.0
    }

    fn reset(&mut self) {
        self.lfo.reset();
    }
}
