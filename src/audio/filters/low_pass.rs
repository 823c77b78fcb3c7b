use super::AudioFilter;

/// Single-pole IIR smoothing. `smoothing <= 1` disables it.
pub struct LowPassFilter {
    factor: f64,
    prev: [f64; 2],
}

impl LowPassFilter {
    pub fn new(smoothing: f32) -> Self {
        let factor = if smoothing > 1.0 {
            1.0 / smoothing as f64
        } else {
            0.0
        };
        Self {
            factor,
            prev: [0.0; 2],
        }
    }
}

impl AudioFilter for LowPassFilter {
    fn process(&mut self, samples: &mut [i16]) {
        if self.factor == 0.0 {
            return;
        }

        for frame in samples.chunks_exact_mut(2) {
            for (c, sample) in frame.iter_mut().enumerate() {
                let next = self.prev[c] + self.factor * (*sample as f64 - self.prev[c]);
                self.prev[c] = next;
                *sample = (next as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.factor > 0.0
    }

    fn reset(&mut self) {
        self.prev = [0.0; 2];
    }
}
