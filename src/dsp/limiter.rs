//! Limiter: sample-peak gain limiter for the master bus.
//!
//! The gain drops quickly toward `threshold / |x|` whenever a sample exceeds
//! the threshold, is then held for `sustain` samples, and only afterwards
//! recovers toward unity with the (slow) release rate.

/// A mono peak limiter. Use one per channel.
#[derive(Debug, Clone)]
pub struct Limiter {
    /// Linear amplitude threshold.
    pub threshold: f32,
    /// Per-sample smoothing factor while reducing gain, in `(0, 1]`.
    pub attack: f32,
    /// Per-sample smoothing factor while recovering gain, in `(0, 1]`.
    pub release: f32,
    /// Number of samples the reduced gain is held before releasing.
    pub sustain: u32,

    gain: f32,
    hold: u32,
}

impl Limiter {
    /// Create a limiter with the master-bus settings for `sample_rate`.
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(0.75, 10000.0 / sample_rate, 1.0 / sample_rate, (sample_rate * 0.5) as u32)
    }

    pub fn with_params(threshold: f32, attack: f32, release: f32, sustain: u32) -> Self {
        Self {
            threshold: threshold.clamp(1e-3, 1.0),
            attack: attack.clamp(1e-6, 1.0),
            release: release.clamp(1e-6, 1.0),
            sustain,
            gain: 1.0,
            hold: 0,
        }
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let level = input.abs();
        let target = if level > self.threshold { self.threshold / level } else { 1.0 };

        if self.gain > target {
            self.gain = (self.gain + (target - self.gain) * self.attack).max(target);
            self.hold = self.sustain;
        } else if self.hold > 0 {
            self.hold -= 1;
        } else {
            self.gain = (self.gain + (target - self.gain) * self.release).min(target);
        }

        input * self.gain
    }

    /// Process a block of audio in-place.
    pub fn process_block(&mut self, buffer: &mut [f32]) {
        for s in buffer.iter_mut() {
            *s = self.process(*s);
        }
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
        self.hold = 0;
    }

    /// Current gain (for metering).
    pub fn gain(&self) -> f32 {
        self.gain
    }
}
