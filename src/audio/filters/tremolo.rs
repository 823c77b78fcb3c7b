use super::{AudioFilter, lfo::Lfo};

/// LFO-driven amplitude modulation.
pub struct TremoloFilter {
    lfo: Lfo,
}

impl TremoloFilter {
    pub fn new(sample_rate: u32, frequency: f32, depth: f32) -> Self {
        let frequency = frequency.max(0.0) as f64;
        let depth = depth.clamp(0.0, 1.0) as f64;
        Self {
            lfo: Lfo::new(sample_rate, frequency, depth),
        }
    }
}

impl AudioFilter for TremoloFilter {
    fn process(&mut self, samples: &mut [i16]) {
        // One multiplier per stereo frame so both channels stay in phase.
        for frame in samples.chunks_exact_mut(2) {
            let multiplier = self.lfo.next_multiplier();
            for sample in frame.iter_mut() {
                let s = (*sample as f64 * multiplier) as i32;
                *sample = s.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.lfo.depth > 0.0 && self.lfo.frequency > 0.0
    }

    fn reset(&mut self) {
        self.lfo.reset();
    }
}
