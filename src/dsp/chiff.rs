//! Chiff: filtered noise burst at pipe onset.

use rand::Rng;

use super::envelope::{Envelope, EnvelopeTrigger};
use super::filter::{BiquadFilter, FilterType};

/// Noise shaped by a band-pass at the pipe frequency, a low-pass a few
/// octaves above it, and its own envelope.
#[derive(Debug, Clone)]
pub struct Chiff {
    pub envelope_trigger: EnvelopeTrigger,
    pub gain: f32,

    sample_rate: f32,
    envelope: Envelope,
    band_pass: BiquadFilter,
    low_pass: BiquadFilter,
}

impl Chiff {
    pub fn new(sample_rate: f32) -> Self {
        let mut band_pass = BiquadFilter::new(FilterType::BandPass, sample_rate);
        band_pass.q = std::f32::consts::FRAC_1_SQRT_2;
        let mut low_pass = BiquadFilter::new(FilterType::LowPass, sample_rate);
        low_pass.q = std::f32::consts::FRAC_1_SQRT_2;

        Self {
            envelope_trigger: EnvelopeTrigger {
                attack: 0.0,
                decay: 0.0,
                sustain: 0.0,
                release: 0.0,
            },
            gain: 1.0,
            sample_rate,
            envelope: Envelope::new(),
            band_pass,
            low_pass,
        }
    }

    pub fn set_frequency(&mut self, f: f32) {
        self.band_pass.set_frequency(f);
        self.low_pass.set_frequency((self.sample_rate * 0.45).min(8.0 * f));
    }

    pub fn reset(&mut self) {
        self.band_pass.reset();
        self.low_pass.reset();
    }

    pub fn trigger(&mut self) {
        self.band_pass.update_coefficients();
        self.band_pass.reset();
        self.low_pass.update_coefficients();
        self.low_pass.reset();
        self.envelope.trigger(&self.envelope_trigger, self.sample_rate);
    }

    pub fn release(&mut self) {
        self.envelope.release();
    }

    pub fn is_active(&self) -> bool {
        !self.envelope.is_finished()
    }

    /// Add the chiff noise into `out`.
    pub fn process<R: Rng>(&mut self, out: &mut [f32], rng: &mut R) {
        if !self.is_active() {
            return;
        }
        for s in out.iter_mut() {
            let x = self.gain * rng.gen_range(-1.0_f32..1.0);
            let x = self.band_pass.process(x);
            let x = self.low_pass.process(x);
            *s += x * self.envelope.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn burst() -> Chiff {
        let mut c = Chiff::new(44100.0);
        c.envelope_trigger = EnvelopeTrigger {
            attack: 0.002,
            decay: 0.01,
            sustain: 0.0,
            release: 0.01,
        };
        c.set_frequency(440.0);
        c
    }

    #[test]
    fn inactive_chiff_adds_nothing() {
        let mut c = burst();
        let mut rng = StdRng::seed_from_u64(1);
        let mut out = [0.25_f32; 64];
        c.process(&mut out, &mut rng);
        assert!(out.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn burst_is_audible_then_ends() {
        let mut c = burst();
        let mut rng = StdRng::seed_from_u64(7);
        c.trigger();

        let mut energy = 0.0_f32;
        let mut frames = 0;
        while c.is_active() {
            let mut out = [0.0_f32; 64];
            c.process(&mut out, &mut rng);
            energy += out.iter().map(|s| s * s).sum::<f32>();
            frames += 1;
            assert!(frames < 1000, "chiff never finished");
        }
        assert!(energy > 0.0, "chiff should produce noise");
    }

    #[test]
    fn low_pass_tracks_frequency_up_to_limit() {
        let mut c = Chiff::new(44100.0);
        c.set_frequency(100.0);
        assert_eq!(c.low_pass.frequency, 800.0);
        c.set_frequency(4000.0);
        assert!((c.low_pass.frequency - 44100.0 * 0.45).abs() < 1e-3);
    }
}
