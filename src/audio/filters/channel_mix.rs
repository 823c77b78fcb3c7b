use super::AudioFilter;

/// 2×2 matrix over the left/right pair.
pub struct ChannelMixFilter {
    ll: f64,
    lr: f64,
    rl: f64,
    rr: f64,
}

impl ChannelMixFilter {
    pub fn new(left_to_left: f32, left_to_right: f32, right_to_left: f32, right_to_right: f32) -> Self {
        Self {
            ll: left_to_left.clamp(0.0, 1.0) as f64,
            lr: left_to_right.clamp(0.0, 1.0) as f64,
            rl: right_to_left.clamp(0.0, 1.0) as f64,
            rr: right_to_right.clamp(0.0, 1.0) as f64,
        }
    }
}

impl AudioFilter for ChannelMixFilter {
    fn process(&mut self, samples: &mut [i16]) {
        for frame in samples.chunks_exact_mut(2) {
            let (left, right) = (frame[0] as f64, frame[1] as f64);
            let new_left = left * self.ll + right * self.rl;
            let new_right = left * self.lr + right * self.rr;
            frame[0] = (new_left as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            frame[1] = (new_right as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }

    fn is_enabled(&self) -> bool {
        (self.ll - 1.0).abs() > f64::EPSILON
            || self.lr.abs() > f64::EPSILON
            || self.rl.abs() > f64::EPSILON
            || (self.rr - 1.0).abs() > f64::EPSILON
    }

    fn reset(&mut self) {}
}
