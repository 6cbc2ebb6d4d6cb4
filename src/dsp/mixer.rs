//! Mixer: stereo frame buffers and output level metering.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::consts::SUB_FRAME_LENGTH;

/// One stereo sub-frame of audio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoFrame {
    pub left: [f32; SUB_FRAME_LENGTH],
    pub right: [f32; SUB_FRAME_LENGTH],
}

impl Default for StereoFrame {
    fn default() -> Self {
        Self {
            left: [0.0; SUB_FRAME_LENGTH],
            right: [0.0; SUB_FRAME_LENGTH],
        }
    }
}

impl StereoFrame {
    pub fn clear(&mut self) {
        self.left.fill(0.0);
        self.right.fill(0.0);
    }

    /// Accumulate another frame into this one.
    pub fn add(&mut self, other: &StereoFrame) {
        let ops = super::simd::ops();
        ops.add(&mut self.left, &other.left);
        ops.add(&mut self.right, &other.right);
    }

    pub fn scale(&mut self, gain: f32) {
        let ops = super::simd::ops();
        ops.scale(&mut self.left, gain);
        ops.scale(&mut self.right, gain);
    }

    pub fn is_silent(&self) -> bool {
        self.left.iter().chain(self.right.iter()).all(|&s| s == 0.0)
    }

    pub fn peak(&self) -> f32 {
        self.left
            .iter()
            .chain(self.right.iter())
            .fold(0.0_f32, |m, &s| m.max(s.abs()))
    }
}

/// Peak and RMS of the last processed block.
///
/// Values are stored as `f32` bits in atomics so a UI thread can poll them
/// while the audio thread updates.
#[derive(Debug, Default)]
pub struct LevelMeter {
    peak: AtomicU32,
    rms: AtomicU32,
}

impl Clone for LevelMeter {
    fn clone(&self) -> Self {
        Self {
            peak: AtomicU32::new(self.peak.load(Ordering::Relaxed)),
            rms: AtomicU32::new(self.rms.load(Ordering::Relaxed)),
        }
    }
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peak_level(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }

    pub fn rms_level(&self) -> f32 {
        f32::from_bits(self.rms.load(Ordering::Relaxed))
    }

    pub fn process(&self, buffer: &[f32]) {
        let (peak, rms) = if buffer.is_empty() {
            (0.0, 0.0)
        } else {
            let peak = buffer.iter().fold(0.0_f32, |m, &s| m.max(s.abs()));
            let sum = buffer.iter().map(|&s| s * s).sum::<f32>();
            (peak, (sum / buffer.len() as f32).sqrt())
        };
        self.peak.store(peak.to_bits(), Ordering::Relaxed);
        self.rms.store(rms.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_is_silent() {
        let f = StereoFrame::default();
        assert!(f.is_silent());
        assert_eq!(f.peak(), 0.0);
    }

    #[test]
    fn frames_accumulate() {
        let mut a = StereoFrame::default();
        let mut b = StereoFrame::default();
        b.left[3] = 0.5;
        b.right[5] = -0.25;
        a.add(&b);
        a.add(&b);
        assert_eq!(a.left[3], 1.0);
        assert_eq!(a.right[5], -0.5);
        a.scale(0.5);
        assert_eq!(a.left[3], 0.5);
        assert_eq!(a.peak(), 0.5);
    }

    #[test]
    fn meter_reports_peak_and_rms() {
        let meter = LevelMeter::new();
        meter.process(&[1.0, -1.0, 1.0, -1.0]);
        assert_eq!(meter.peak_level(), 1.0);
        assert!((meter.rms_level() - 1.0).abs() < 1e-6);

        meter.process(&[0.0, 0.5, 0.0, 0.0]);
        assert_eq!(meter.peak_level(), 0.5);
        assert!((meter.rms_level() - 0.25).abs() < 1e-6);
    }
}
