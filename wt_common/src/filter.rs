//! Exponential moving average filter.
//!
//! `alpha = 0` disables the filter. The first sample seeds the state so a
//! sensor's very first publish is never biased towards zero.

/// EMA state for one sensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    /// Smoothing factor in (0, 1); 0 disables.
    alpha: f32,
    /// Previous output, `None` until seeded.
    state: Option<f32>,
}

impl Ema {
    /// Create a filter with the given smoothing factor.
    pub fn new(alpha: f32) -> Self {
        Self { alpha, state: None }
    }

    /// Whether filtering is active.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.alpha > 0.0
    }

    /// Apply one sample, returning the filtered value.
    #[inline]
    pub fn apply(&mut self, sample: f32) -> f32 {
        if !self.enabled() {
            return sample;
        }
        let out = match self.state {
            None => sample,
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
        };
        self.state = Some(out);
        out
    }

    /// Drop the seeded state, e.g. after a re-bind.
    #[inline]
    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_alpha_passes_through() {
        let mut ema = Ema::new(0.0);
        assert_eq!(ema.apply(5.0), 5.0);
        assert_eq!(ema.apply(-3.0), -3.0);
        assert!(!ema.enabled());
    }

    #[test]
    fn first_sample_seeds_the_filter() {
        let mut ema = Ema::new(0.5);
        assert_eq!(ema.apply(10.0), 10.0);
        // Second sample blends.
        assert_eq!(ema.apply(0.0), 5.0);
        assert_eq!(ema.apply(0.0), 2.5);
    }

    #[test]
    fn reset_reseeds() {
        let mut ema = Ema::new(0.5);
        ema.apply(10.0);
        ema.reset();
        assert_eq!(ema.apply(2.0), 2.0);
    }

    #[test]
    fn converges_towards_constant_input() {
        let mut ema = Ema::new(0.2);
        ema.apply(0.0);
        let mut last = 0.0;
        for _ in 0..100 {
            last = ema.apply(1.0);
        }
        assert!((last - 1.0).abs() < 1e-6);
    }
}
