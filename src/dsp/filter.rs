//! Biquad filter: RBJ cookbook coefficients, direct form I.

use std::f32::consts::{LN_2, PI};

/// Filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    LowPass,
    HighPass,
    BandPass,
    Notch,
    AllPass,
    PeakingEq,
    LowShelf,
    HighShelf,
}

/// A biquad IIR filter (2nd order).
///
/// Coefficient formulas from the Audio EQ Cookbook (Robert Bristow-Johnson).
/// For band-pass, notch and peaking types `q` is interpreted as a bandwidth
/// in octaves; for shelves it is the shelf slope.
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    pub filter_type: FilterType,
    pub frequency: f32,
    pub q: f32,
    /// Only used by peaking and shelving types.
    pub gain_db: f32,

    b: [f32; 3],
    a: [f32; 2],

    // Direct form I history
    x: [f32; 2],
    y: [f32; 2],

    sample_rate: f32,
    dirty: bool,
}

impl BiquadFilter {
    pub fn new(filter_type: FilterType, sample_rate: f32) -> Self {
        let mut f = BiquadFilter {
            filter_type,
            frequency: 1000.0,
            q: std::f32::consts::FRAC_1_SQRT_2,
            gain_db: 0.0,
            b: [1.0, 0.0, 0.0],
            a: [0.0, 0.0],
            x: [0.0; 2],
            y: [0.0; 2],
            sample_rate,
            dirty: true,
        };
        f.update_coefficients();
        f
    }

    pub fn with_params(filter_type: FilterType, sample_rate: f32, frequency: f32, q: f32) -> Self {
        let mut f = Self::new(filter_type, sample_rate);
        f.frequency = frequency.clamp(1.0, sample_rate * 0.5 - 1.0);
        f.q = q.max(1e-3);
        f.update_coefficients();
        f
    }

    /// Recompute filter coefficients from current parameters.
    pub fn update_coefficients(&mut self) {
        let a_lin = match self.filter_type {
            FilterType::PeakingEq | FilterType::LowShelf | FilterType::HighShelf => {
                10.0_f32.powf(self.gain_db / 40.0)
            }
            _ => 10.0_f32.powf(self.gain_db / 20.0).sqrt(),
        };

        let w0 = 2.0 * PI * self.frequency / self.sample_rate;
        let cos_w0 = w0.cos();
        let sin_w0 = w0.sin();

        let alpha = match self.filter_type {
            FilterType::LowPass | FilterType::HighPass | FilterType::AllPass => {
                sin_w0 / (2.0 * self.q)
            }
            FilterType::BandPass | FilterType::Notch | FilterType::PeakingEq => {
                sin_w0 * (LN_2 / 2.0 * self.q * w0 / sin_w0).sinh()
            }
            FilterType::LowShelf | FilterType::HighShelf => {
                sin_w0 / 2.0 * ((a_lin + 1.0 / a_lin) * (1.0 / self.q - 1.0) + 2.0).sqrt()
            }
        };

        let sqrt_a2 = 2.0 * a_lin.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match self.filter_type {
            FilterType::LowPass => {
                let b1 = 1.0 - cos_w0;
                (b1 / 2.0, b1, b1 / 2.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
            }
            FilterType::HighPass => {
                let b0 = (1.0 + cos_w0) / 2.0;
                (b0, -(1.0 + cos_w0), b0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
            }
            // Constant 0 dB peak gain
            FilterType::BandPass => (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha),
            FilterType::Notch => (1.0, -2.0 * cos_w0, 1.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha),
            FilterType::AllPass => (
                1.0 - alpha,
                -2.0 * cos_w0,
                1.0 + alpha,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            FilterType::PeakingEq => (
                1.0 + alpha * a_lin,
                -2.0 * cos_w0,
                1.0 - alpha * a_lin,
                1.0 + alpha / a_lin,
                -2.0 * cos_w0,
                1.0 - alpha / a_lin,
            ),
            FilterType::LowShelf => (
                a_lin * ((a_lin + 1.0) - (a_lin - 1.0) * cos_w0 + sqrt_a2),
                2.0 * a_lin * ((a_lin - 1.0) - (a_lin + 1.0) * cos_w0),
                a_lin * ((a_lin + 1.0) - (a_lin - 1.0) * cos_w0 - sqrt_a2),
                (a_lin + 1.0) + (a_lin - 1.0) * cos_w0 + sqrt_a2,
                -2.0 * ((a_lin - 1.0) + (a_lin + 1.0) * cos_w0),
                (a_lin + 1.0) + (a_lin - 1.0) * cos_w0 - sqrt_a2,
            ),
            FilterType::HighShelf => (
                a_lin * ((a_lin + 1.0) + (a_lin - 1.0) * cos_w0 + sqrt_a2),
                -2.0 * a_lin * ((a_lin - 1.0) + (a_lin + 1.0) * cos_w0),
                a_lin * ((a_lin + 1.0) + (a_lin - 1.0) * cos_w0 - sqrt_a2),
                (a_lin + 1.0) - (a_lin - 1.0) * cos_w0 + sqrt_a2,
                2.0 * ((a_lin - 1.0) - (a_lin + 1.0) * cos_w0),
                (a_lin + 1.0) - (a_lin - 1.0) * cos_w0 - sqrt_a2,
            ),
        };

        // Normalize by a0
        self.b = [b0 / a0, b1 / a0, b2 / a0];
        self.a = [a1 / a0, a2 / a0];
        self.dirty = false;
    }

    /// Process a single sample through the filter.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        if self.dirty {
            self.update_coefficients();
        }

        let output = self.b[0] * input + self.b[1] * self.x[0] + self.b[2] * self.x[1]
            - self.a[0] * self.y[0]
            - self.a[1] * self.y[1];

        self.x[1] = self.x[0];
        self.x[0] = input;
        self.y[1] = self.y[0];
        self.y[0] = output;

        output
    }

    /// Filter a buffer in place.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for s in buffer.iter_mut() {
            *s = self.process(*s);
        }
    }

    /// Reset filter state.
    pub fn reset(&mut self) {
        self.x = [0.0; 2];
        self.y = [0.0; 2];
    }

    /// Set frequency and mark coefficients dirty.
    pub fn set_frequency(&mut self, freq: f32) {
        if freq != self.frequency {
            self.frequency = freq;
            self.dirty = true;
        }
    }

    /// Set Q and mark coefficients dirty.
    pub fn set_q(&mut self, q: f32) {
        if q != self.q {
            self.q = q;
            self.dirty = true;
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.dirty = true;
    }
}
