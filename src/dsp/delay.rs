//! Delay line: circular buffer with linearly interpolated fractional reads.

use crate::consts::lerp;

/// A mono delay line.
///
/// Writing moves a single index backwards through the buffer, so a read at
/// `delay` samples is simply an offset forward from the write position. The
/// most recent sample sits at delay `0.0`.
#[derive(Debug, Clone, Default)]
pub struct DelayLine {
    buffer: Vec<f32>,
    write_index: usize,
}

impl DelayLine {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            write_index: 0,
        }
    }

    /// Reallocate the buffer and clear it. Not for the audio thread.
    pub fn resize(&mut self, size: usize) {
        self.buffer.resize(size.max(1), 0.0);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.write_index = 0;
        self.buffer.fill(0.0);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn write(&mut self, x: f32) {
        self.write_index = if self.write_index == 0 {
            self.buffer.len() - 1
        } else {
            self.write_index - 1
        };
        self.buffer[self.write_index] = x;
    }

    /// Read `delay` samples behind the last write. Delays beyond the buffer
    /// length wrap around.
    #[inline]
    pub fn read(&self, delay: f32) -> f32 {
        let len = self.buffer.len();
        let whole = delay.max(0.0).floor();
        let frac = delay.max(0.0) - whole;
        let index = (whole as usize + self.write_index) % len;
        let a = self.buffer[index];
        let b = if index + 1 < len { self.buffer[index + 1] } else { self.buffer[0] };
        lerp(a, b, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_delay_returns_past_sample() {
        let mut d = DelayLine::new(16);
        for i in 0..10 {
            d.write(i as f32);
        }
        assert_eq!(d.read(0.0), 9.0);
        assert_eq!(d.read(3.0), 6.0);
    }

    #[test]
    fn fractional_delay_interpolates() {
        let mut d = DelayLine::new(8);
        d.write(1.0);
        d.write(0.0);
        let y = d.read(0.25);
        assert!((y - 0.25).abs() < 1e-6, "expected 0.25, got {y}");
    }

    #[test]
    fn impulse_travels_through_the_line() {
        let mut d = DelayLine::new(32);
        let delay = 10.0;
        let mut out = Vec::new();
        for i in 0..20 {
            d.write(if i == 0 { 1.0 } else { 0.0 });
            out.push(d.read(delay));
        }
        let peak = out.iter().position(|&y| y == 1.0);
        assert_eq!(peak, Some(10));
    }

    #[test]
    fn wraps_when_full() {
        let mut d = DelayLine::new(4);
        for i in 0..9 {
            d.write(i as f32);
        }
        assert_eq!(d.read(0.0), 8.0);
        assert_eq!(d.read(3.0), 5.0);
        // Index past the end wraps back to the newest sample.
        assert_eq!(d.read(4.0), 8.0);
    }

    #[test]
    fn reset_clears() {
        let mut d = DelayLine::new(4);
        d.write(1.0);
        d.reset();
        assert_eq!(d.read(0.0), 0.0);
    }
}
