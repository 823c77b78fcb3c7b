use std::f64::consts::TAU;

/// Sine low-frequency oscillator shared by tremolo and rotation.
pub struct Lfo {
    phase: f64,
    step: f64,
    pub frequency: f64,
    pub depth: f64,
}

impl Lfo {
    pub fn new(sample_rate: u32, frequency: f64, depth: f64) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f64,
            frequency,
            depth,
        }
    }

    /// Raw sine value in [-1, 1]; advances the phase by one sample.
    pub fn next_value(&mut self) -> f64 {
        if self.frequency == 0.0 {
            return 0.0;
        }
        let value = self.phase.sin();
        self.phase += self.step;
        if self.phase > TAU {
            self.phase -= TAU;
        }
        value
    }

    /// Tremolo multiplier: `1 - depth * (sin + 1) / 2`.
    pub fn next_multiplier(&mut self) -> f64 {
        if self.depth == 0.0 || self.frequency == 0.0 {
            return 1.0;
        }
        let normalized = (self.next_value() + 1.0) / 2.0;
        1.0 - self.depth * normalized
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }
}
