//! Spatial source: mono pipe placed in front of a two-eared listener.
//!
//! Positions are 2D, in metres. Each ear hears the source through its own
//! propagation delay, an angular attenuation and a gentle air-absorption
//! low-pass that darkens with distance.

use std::f32::consts::TAU;

use super::delay::DelayLine;

const SPEED_OF_SOUND: f32 = 330.0;
const EAR_DISTANCE: f32 = 0.3;
const ANGULAR_ATTENUATION: f32 = 0.7;
/// Air absorption cutoff at the source position; it decays with distance.
const AIR_CUTOFF: f32 = 18000.0;
const AIR_CUTOFF_DECAY: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn rotate(&mut self, a: f32) {
        let (s, c) = a.sin_cos();
        let x = c * self.x - s * self.y;
        let y = s * self.x + c * self.y;
        self.x = x;
        self.y = y;
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }

    pub fn angle_to(&self, other: &Position) -> f32 {
        other.y.atan2(other.x) - self.y.atan2(self.x)
    }
}

/// One-pole low-pass.
#[derive(Debug, Clone, Copy, Default)]
struct OnePole {
    a: f32,
    z: f32,
}

impl OnePole {
    fn set_cutoff(&mut self, cutoff: f32, sample_rate: f32) {
        self.a = (-TAU * cutoff.min(sample_rate * 0.49) / sample_rate).exp();
    }

    #[inline]
    fn tick(&mut self, x: f32) -> f32 {
        self.z = x + self.a * (self.z - x);
        self.z
    }
}

#[derive(Debug, Clone)]
pub struct SpatialSource {
    sample_rate: f32,
    source: Position,
    listener: Position,
    listener_orientation: f32,
    delay_line: DelayLine,
    left_delay: f32,
    right_delay: f32,
    left_attenuation: f32,
    right_attenuation: f32,
    left_air: OnePole,
    right_air: OnePole,
}

impl SpatialSource {
    pub fn new(sample_rate: f32) -> Self {
        let mut s = Self {
            sample_rate,
            source: Position::default(),
            listener: Position::default(),
            listener_orientation: 0.0,
            delay_line: DelayLine::new(1),
            left_delay: 0.0,
            right_delay: 0.0,
            left_attenuation: 1.0,
            right_attenuation: 1.0,
            left_air: OnePole::default(),
            right_air: OnePole::default(),
        };
        s.recalculate();
        s
    }

    pub fn set_source_position(&mut self, x: f32, y: f32) {
        self.source = Position::new(x, y);
    }

    pub fn set_listener_position(&mut self, x: f32, y: f32) {
        self.listener = Position::new(x, y);
    }

    pub fn reset(&mut self) {
        self.delay_line.reset();
        self.left_air.z = 0.0;
        self.right_air.z = 0.0;
    }

    /// Number of samples the source keeps sounding after its input stops.
    pub fn tail_samples(&self) -> usize {
        self.delay_line.len()
    }

    pub fn left_attenuation(&self) -> f32 {
        self.left_attenuation
    }

    pub fn right_attenuation(&self) -> f32 {
        self.right_attenuation
    }

    /// Recompute delays and gains after the positions changed.
    ///
    /// The delay line only reallocates when it must grow, so calling this
    /// on an already sized source with a nearer position is allocation-free.
    pub fn recalculate(&mut self) {
        let mut left = Position::new(-0.5 * EAR_DISTANCE, 0.0);
        let mut right = Position::new(0.5 * EAR_DISTANCE, 0.0);
        left.rotate(self.listener_orientation);
        right.rotate(self.listener_orientation);

        let relative = Position::new(self.source.x - self.listener.x, self.source.y - self.listener.y);
        let left_angle = left.angle_to(&relative);
        let right_angle = right.angle_to(&relative);

        left.x += self.listener.x;
        left.y += self.listener.y;
        right.x += self.listener.x;
        right.y += self.listener.y;

        let left_distance = self.source.distance_to(&left);
        let right_distance = self.source.distance_to(&right);
        let max_distance = left_distance.max(right_distance);

        let length = (self.sample_rate * max_distance / SPEED_OF_SOUND + 0.5) as usize + 2;
        if length > self.delay_line.len() {
            self.delay_line.resize(length);
        } else {
            self.delay_line.reset();
        }

        self.left_delay = left_distance * self.sample_rate / SPEED_OF_SOUND;
        self.right_delay = right_distance * self.sample_rate / SPEED_OF_SOUND;

        let att = ANGULAR_ATTENUATION;
        self.left_attenuation = 0.5 * att * (left_angle.cos() + 1.0) + 1.0 - att;
        self.right_attenuation = 0.5 * att * (right_angle.cos() + 1.0) + 1.0 - att;

        self.left_air
            .set_cutoff(AIR_CUTOFF * (-AIR_CUTOFF_DECAY * left_distance).exp(), self.sample_rate);
        self.right_air
            .set_cutoff(AIR_CUTOFF * (-AIR_CUTOFF_DECAY * right_distance).exp(), self.sample_rate);
    }

    #[inline]
    pub fn tick(&mut self, x: f32) -> (f32, f32) {
        self.delay_line.write(x);
        let l = self.delay_line.read(self.left_delay) * self.left_attenuation;
        let r = self.delay_line.read(self.right_delay) * self.right_attenuation;
        (self.left_air.tick(l), self.right_air.tick(r))
    }

    /// Spatialize `input` and add it into the stereo outputs.
    pub fn process_add(&mut self, input: &[f32], left: &mut [f32], right: &mut [f32]) {
        for ((&x, l), r) in input.iter().zip(left.iter_mut()).zip(right.iter_mut()) {
            let (yl, yr) = self.tick(x);
            *l += yl;
            *r += yr;
        }
    }
}
