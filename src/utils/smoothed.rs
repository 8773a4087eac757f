//! Click free parameter ramps.

// -------------------------------------------------------------------------------------------------

/// Linearly ramps from a current to a target value within a fixed number of sample frames.
///
/// Used to fade voices in and out on mute and gain changes, so control changes never produce
/// discontinuities in the rendered signal.
#[derive(Debug, Clone)]
pub struct LinearSmoothedValue {
    current: f32,
    target: f32,
    current_step: f32,
    num_pending_steps: u32,
    ramp_frames: u32,
}

impl LinearSmoothedValue {
    pub const DEFAULT_RAMP: std::time::Duration = std::time::Duration::from_millis(5);

    pub fn new(value: f32, sample_rate: u32) -> Self {
        assert!(sample_rate > 0, "Invalid sample rate");
        let ramp_frames =
            ((Self::DEFAULT_RAMP.as_secs_f64() * sample_rate as f64) as u32).max(1);
        Self {
            current: value,
            target: value,
            current_step: 0.0,
            num_pending_steps: 0,
            ramp_frames,
        }
    }

    #[inline(always)]
    pub fn current(&self) -> f32 {
        self.current
    }

    #[inline(always)]
    pub fn target(&self) -> f32 {
        self.target
    }

    #[inline(always)]
    pub fn need_ramp(&self) -> bool {
        self.num_pending_steps > 0
    }

    /// Set current and target to the same value.
    pub fn init(&mut self, value: f32) {
        self.current = value;
        self.target = value;
        self.num_pending_steps = 0;
    }

    /// Set a new target value and ramp towards it, when it differs from the current one.
    pub fn set_target(&mut self, target: f32) {
        self.target = target;
        if self.current == self.target {
            self.num_pending_steps = 0;
        } else {
            self.num_pending_steps = self.ramp_frames;
            self.current_step = (self.target - self.current) / self.ramp_frames as f32;
        }
    }

    /// Ramp, if needed, and get the current ramped value.
    #[inline]
    pub fn next(&mut self) -> f32 {
        if self.num_pending_steps > 0 {
            self.current += self.current_step;
            self.num_pending_steps -= 1;
            if self.num_pending_steps == 0 {
                self.current = self.target;
            }
        }
        self.current
    }

    /// Apply the smoothed value as gain to an interleaved buffer.
    pub fn apply(&mut self, buffer: &mut [f32], channel_count: usize) {
        if self.need_ramp() {
            for frame in buffer.chunks_exact_mut(channel_count) {
                let gain = self.next();
                for s in frame.iter_mut() {
                    *s *= gain;
                }
            }
        } else if (1.0 - self.target).abs() > 0.000001 {
            super::buffer::scale_buffer(buffer, self.target);
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramps_in_fixed_steps() {
        let mut value = LinearSmoothedValue::new(1.0, 1000);
        value.set_target(0.0);
        assert!(value.need_ramp());
        for _ in 0..4 {
            let v = value.next();
            assert!(v > 0.0 && v < 1.0);
        }
        assert_eq!(value.next(), 0.0);
        assert!(!value.need_ramp());
    }

    #[test]
    fn apply_constant_gain() {
        let mut value = LinearSmoothedValue::new(0.5, 44100);
        let mut buffer = vec![1.0; 8];
        value.apply(&mut buffer, 2);
        assert_eq!(buffer, vec![0.5; 8]);
    }
}
