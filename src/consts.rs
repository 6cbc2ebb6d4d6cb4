//! Engine-wide constants and small numeric helpers.

use std::f32::consts::TAU;

/// Internal processing sample rate. Pipes carry few enough harmonics that
/// upsampling to the host rate needs no anti-imaging filter.
pub const SAMPLE_RATE: u32 = 44100;
pub const SAMPLE_RATE_F: f32 = SAMPLE_RATE as f32;

/// Length of one processing sub-frame, in samples.
pub const SUB_FRAME_LENGTH: usize = 64;

/// Number of harmonics a pipe model describes.
pub const N_HARM: usize = 64;

/// Number of control points in a per-note function.
pub const N_NOTES: usize = 11;

/// Distance in semitones between two control points.
pub const NOTES_GAP: usize = 6;

pub const NOTE_MIN: u8 = 36;
pub const NOTE_MAX: u8 = 96;

/// Number of MIDI notes.
pub const TOTAL_NOTES: usize = 128;

/// Maximum number of ranks a single zone (mixture) can combine.
pub const MAX_RANK: usize = 5;

/// Master gain applied after the divisions are mixed.
pub const VOLUME_GAIN: f32 = 4.0;

pub const TREMULANT_FREQUENCY: f32 = 6.283184;
pub const TREMULANT_PHASE_INCREMENT: f32 = TAU * TREMULANT_FREQUENCY / SAMPLE_RATE_F;
pub const TREMULANT_LEVEL: f32 = 1.0;
/// Tremulant pitch wobble: a delay read swinging around its centre.
pub const TREMULANT_DELAY_CENTRE: f32 = 8.0;
pub const TREMULANT_DELAY_DEPTH: f32 = 4.0;
pub const TREMULANT_DELAY_LENGTH: usize = 16;
/// Largest tremulant depth; keeps the swinging read inside the delay line.
pub const TREMULANT_MAX_DEPTH: f32 = 1.0;
/// Depth of the tremulant amplitude modulation.
pub const TREMULANT_GAIN_DEPTH: f32 = 0.15;

pub const SEQUENCER_N_STEPS: usize = 16;

pub const TUNING_FREQUENCY_MIN: f32 = 350.0;
pub const TUNING_FREQUENCY_MAX: f32 = 550.0;
pub const TUNING_FREQUENCY_DEFAULT: f32 = 440.0;

/// Upper bound on divisions and on stops per division (bitmask width).
pub const MAX_DIVISIONS: usize = 64;
pub const MAX_STOPS: usize = 64;

/// Default number of preallocated voices.
pub const DEFAULT_VOICE_POOL_SIZE: usize = 512;

// ── MIDI controllers ────────────────────────────────────────

pub const CC_MODULATION: u8 = 1;
pub const CC_VOLUME: u8 = 7;
pub const CC_REVERB: u8 = 91;
pub const CC_STOP_BUTTONS: u8 = 98;
pub const CC_ALL_NOTES_OFF: u8 = 123;

/// Values used by the first generation of pipe model files.
pub mod deprecated {
    pub const N_HARM: usize = 48;
    pub const NOTE_MAX: u8 = 46;
}

/// `2^x`.
#[inline]
pub fn exp2ap(x: f32) -> f32 {
    x.exp2()
}

#[inline]
pub fn lerp(a: f32, b: f32, frac: f32) -> f32 {
    a + (b - a) * frac
}

/// 4-point Lagrange interpolation between `x[1]` and `x[2]`.
#[inline]
pub fn lagrange4(x: [f32; 4], frac: f32) -> f32 {
    let c1 = x[2] - (1.0 / 3.0) * x[0] - 0.5 * x[1] - (1.0 / 6.0) * x[3];
    let c2 = 0.5 * (x[0] + x[2]) - x[1];
    let c3 = (1.0 / 6.0) * (x[3] - x[0]) + 0.5 * (x[1] - x[2]);
    ((c3 * frac + c2) * frac + c1) * frac + x[1]
}
