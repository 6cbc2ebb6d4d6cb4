//! Interpolator: stereo 4-point Lagrange resampler.
//!
//! Converts the internal 44.1 kHz stream to the host rate. The caller pushes
//! input frames while [`Interpolator::can_write`] holds and pulls output
//! frames while [`Interpolator::can_read`] holds.

use crate::consts::lagrange4;

#[derive(Debug, Clone)]
pub struct Interpolator {
    acc_l: [f32; 8],
    acc_r: [f32; 8],
    index: usize,
    frac: f32,
    ratio: f32,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Interpolator {
    /// `ratio` is input rate over output rate.
    pub fn new(ratio: f32) -> Self {
        Self {
            acc_l: [0.0; 8],
            acc_r: [0.0; 8],
            index: 0,
            frac: 0.0,
            ratio,
        }
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn set_ratio(&mut self, ratio: f32) {
        self.ratio = ratio;
    }

    pub fn reset(&mut self) {
        self.acc_l = [0.0; 8];
        self.acc_r = [0.0; 8];
        self.index = 0;
        self.frac = 0.0;
    }

    pub fn can_read(&self) -> bool {
        self.frac < 1.0
    }

    pub fn can_write(&self) -> bool {
        self.frac >= 1.0
    }

    pub fn read(&mut self) -> Option<(f32, f32)> {
        if !self.can_read() {
            return None;
        }
        let i = self.index;
        let l = lagrange4([self.acc_l[i], self.acc_l[i + 1], self.acc_l[i + 2], self.acc_l[i + 3]], self.frac);
        let r = lagrange4([self.acc_r[i], self.acc_r[i + 1], self.acc_r[i + 2], self.acc_r[i + 3]], self.frac);
        self.frac += self.ratio;
        Some((l, r))
    }

    pub fn write(&mut self, l: f32, r: f32) -> bool {
        if !self.can_write() {
            return false;
        }
        // Mirrored so four consecutive taps are always contiguous.
        self.acc_l[self.index] = l;
        self.acc_l[self.index + 4] = l;
        self.acc_r[self.index] = r;
        self.acc_r[self.index + 4] = r;
        self.index = (self.index + 1) % 4;
        self.frac -= 1.0;
        true
    }
}
