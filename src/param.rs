//! Smoothed audio parameter.

/// A bounded value that glides toward its target by a fixed fraction per
/// call to [`AudioParameter::next_value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParameter {
    current: f32,
    target: f32,
    min: f32,
    max: f32,
    frac: f32,
    smoothing: bool,
}

impl Default for AudioParameter {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, 0.5)
    }
}

impl AudioParameter {
    const EPSILON: f32 = 1e-6;

    pub fn new(value: f32, min: f32, max: f32, smooth: f32) -> Self {
        let (min, max) = (min.min(max), min.max(max));
        let value = value.clamp(min, max);
        Self {
            current: value,
            target: value,
            min,
            max,
            frac: smooth.clamp(0.0, 1.0),
            smoothing: false,
        }
    }

    pub fn value(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn is_smoothing(&self) -> bool {
        self.smoothing || self.current != self.target
    }

    /// Set a new target, or jump to it immediately when `force` is true.
    pub fn set_value(&mut self, v: f32, force: bool) {
        self.target = v.clamp(self.min, self.max);
        if force {
            self.current = self.target;
            self.smoothing = false;
        } else {
            self.update_smoothing();
        }
    }

    pub fn set_value_with_smoothing(&mut self, v: f32, smooth: f32, force: bool) {
        self.frac = smooth.clamp(0.0, 1.0);
        self.set_value(v, force);
    }

    pub fn set_smoothing(&mut self, smooth: f32) {
        self.frac = smooth.clamp(0.0, 1.0);
    }

    pub fn set_range(&mut self, min: f32, max: f32) {
        self.min = min.min(max);
        self.max = min.max(max);
    }

    #[inline]
    pub fn next_value(&mut self) -> f32 {
        self.update_smoothing();
        if self.smoothing {
            self.current = self.target * self.frac + self.current * (1.0 - self.frac);
            self.update_smoothing();
        }
        self.current
    }

    fn update_smoothing(&mut self) {
        self.smoothing = (self.current - self.target).abs() > Self::EPSILON;
        if !self.smoothing {
            self.current = self.target;
        }
    }
}
