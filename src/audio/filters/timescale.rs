/// 4-point Catmull-Rom interpolation.
fn cubic(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

/// Combined resampling ratio, each factor clamped to `[0.1, 5.0]`.
pub fn ratio(speed: f64, pitch: f64, rate: f64) -> f64 {
    speed.clamp(0.1, 5.0) * pitch.clamp(0.1, 5.0) * rate.clamp(0.1, 5.0)
}

/// Speed/pitch/rate change by cubic resampling of interleaved stereo.
///
/// Output length differs from input length, and a call may produce nothing
/// while history accumulates.
pub struct TimescaleFilter {
    ratio: f64,
    pending: Vec<i16>,
}

impl TimescaleFilter {
    pub fn new(speed: f64, pitch: f64, rate: f64) -> Self {
        Self {
            ratio: ratio(speed, pitch, rate),
            pending: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        (self.ratio - 1.0).abs() > f64::EPSILON
    }

    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        if !self.is_enabled() {
            return samples.to_vec();
        }

        self.pending.extend_from_slice(samples);
        let frames = self.pending.len() / 2;
        if frames < 4 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(((frames as f64 / self.ratio) as usize + 1) * 2);
        let mut produced = 0usize;
        loop {
            let pos = produced as f64 * self.ratio;
            let i1 = pos as usize;
            if i1 + 2 >= frames {
                break;
            }
            let t = pos - i1 as f64;
            let i0 = i1.saturating_sub(1);

            for c in 0..2 {
                let at = |i: usize| self.pending[i * 2 + c] as f64;
                let v = cubic(at(i0), at(i1), at(i1 + 1), at(i1 + 2), t);
                out.push((v as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16);
            }
            produced += 1;
        }

        let consumed = ((produced as f64 * self.ratio) as usize * 2).min(self.pending.len());
        self.pending.drain(..consumed);
        out
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
