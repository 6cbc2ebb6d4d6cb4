//! Pipewave: wavetable generation and playback for a single pipe.
//!
//! The wavetable holds an attack segment, in which the pipe speaks from a
//! detuned start towards its target pitch with per-harmonic onset shapes,
//! followed by a loop containing a whole number of periods. The loop length
//! is found with a continued-fraction search so that the integer sample count
//! approximates the target frequency closely. A copy of the loop head is
//! appended so that interpolated reads can run past the loop end.

use std::f32::consts::TAU;
use std::sync::Arc;

use rand::Rng;

use crate::consts::{exp2ap, N_HARM, SUB_FRAME_LENGTH};
use crate::model::PipeModel;

/// Envelope of a sounding pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeEnvelope {
    #[default]
    Idle,
    Attack,
    Release,
    Over,
}

/// Identifies a pipe inside a rank bank: rank index, pipe set, note index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeRef {
    pub rank: usize,
    pub set: usize,
    pub index: usize,
}

/// Playback cursor for one triggered pipe.
///
/// Holds only indices into the pipe's wavetable; the table itself stays
/// with the [`Pipewave`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackState {
    pub pipe: Option<PipeRef>,
    pub envelope: PipeEnvelope,
    play: Option<usize>,
    play_interpolation: f32,
    play_speed: f32,
    release: Option<usize>,
    release_interpolation: f32,
    release_gain: f32,
    release_count: usize,
}

impl PlaybackState {
    pub fn is_idle(&self) -> bool {
        self.envelope == PipeEnvelope::Idle
    }

    pub fn is_over(&self) -> bool {
        self.envelope == PipeEnvelope::Over
    }

    pub fn is_releasing(&self) -> bool {
        self.envelope == PipeEnvelope::Release
    }

    /// Start the release cross-fade. No effect unless attacking.
    pub fn release(&mut self) {
        if self.envelope == PipeEnvelope::Attack {
            self.envelope = PipeEnvelope::Release;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Find a loop of `len` samples holding `cycles` periods of `f` at sample
/// rate `fs`, with `len <= lmax`.
///
/// Walks the continued-fraction expansion of `fs / f` for up to eight
/// convergents and stops at the first one whose frequency error is below
/// 0.1 Hz and 0.03 %. If a convergent exceeds `lmax`, the longest loop that
/// fits is used instead.
pub fn looplen(f: f32, fs: f32, lmax: usize) -> (usize, usize) {
    const N: usize = 8;
    let lmax = lmax as i64;
    let mut z = [0i64; N];
    let mut a = 0i64;
    let mut b = 0i64;
    let mut g = fs / f;

    for i in 0..N {
        a = (g + 0.5).floor() as i64;
        z[i] = a;
        g -= a as f32;
        b = 1;
        let mut j = i;
        while j > 0 {
            j -= 1;
            let t = a;
            a = z[j] * a + b;
            b = t;
        }
        if a < 0 {
            a = -a;
            b = -b;
        }

        if a <= lmax {
            let d = fs * b as f32 / a as f32 - f;
            if d.abs() < 0.1 && d.abs() < 3e-4 * f {
                break;
            }
            g = if g.abs() < 1e-6 { 1e6 } else { 1.0 / g };
        } else {
            b = (lmax as f32 * f / fs) as i64;
            a = (b as f32 * fs / f + 0.5) as i64;
            break;
        }
    }

    (a.max(1) as usize, b.max(1) as usize)
}

/// Attack gain curve over `n` samples.
///
/// Rises from 0 towards 1 in 24 segments. A positive profile `p` makes the
/// upper harmonics overshoot early, which gives reeds and principals their
/// characteristic onset; `p == 0` yields a plain linear ramp.
pub fn attgain(n: usize, p: f32) -> Vec<f32> {
    let mut att = vec![0.0; n];
    let w = 0.05;
    let mut y = 0.6;
    if p > 0.0 {
        y += 0.11 * p;
    }

    let mut z = 0.0_f32;
    let mut j = 0;
    for i in 1..=24 {
        let k = n * i / 24;
        let x = 1.0 - z - 1.5 * y;
        y += w * x;
        let d = if k == j { 0.0 } else { w * y * p / (k - j) as f32 };
        while j < k {
            let m = j as f32 / n as f32;
            att[j] = (1.0 - m) * z + m;
            j += 1;
            z += d;
        }
    }
    att
}

/// One pipe of a rank: its frequency and generated wavetable.
#[derive(Debug, Clone)]
pub struct Pipewave {
    model: Arc<PipeModel>,
    /// Note index relative to the model's lowest note.
    note: usize,
    frequency: f32,
    sample_rate: f32,
    needs_rebuild: bool,

    attack_length: usize,
    loop_length: usize,
    sample_step: usize,
    release_length: usize,
    release_multiplier: f32,
    release_detune: f32,
    instability: f32,

    wavetable: Vec<f32>,
}

impl Pipewave {
    pub fn new(model: Arc<PipeModel>, note: usize, frequency: f32) -> Self {
        Self {
            model,
            note,
            frequency,
            sample_rate: 0.0,
            needs_rebuild: true,
            attack_length: 0,
            loop_length: 0,
            sample_step: 1,
            release_length: 0,
            release_multiplier: 0.0,
            release_detune: 0.0,
            instability: 0.0,
            wavetable: Vec::new(),
        }
    }

    /// MIDI note number of this pipe.
    pub fn midi_note(&self) -> u8 {
        self.model.note_min() + self.note as u8
    }

    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    /// Change the target frequency. Takes effect at the next rebuild.
    pub fn set_frequency(&mut self, frequency: f32) {
        self.frequency = frequency;
    }

    pub fn mark_dirty(&mut self) {
        self.needs_rebuild = true;
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// (Re)generate the wavetable if it is missing, stale or was generated
    /// for another sample rate.
    pub fn prepare_to_play<R: Rng>(&mut self, sample_rate: f32, rng: &mut R) {
        if self.wavetable.is_empty() || self.sample_rate != sample_rate || self.needs_rebuild {
            self.sample_rate = sample_rate;
            self.generate(rng);
        }
    }

    pub fn attack_length(&self) -> usize {
        self.attack_length
    }

    pub fn loop_length(&self) -> usize {
        self.loop_length
    }

    pub fn sample_step(&self) -> usize {
        self.sample_step
    }

    /// Release duration in sub-frames.
    pub fn release_length(&self) -> usize {
        self.release_length
    }

    pub fn wavetable(&self) -> &[f32] {
        &self.wavetable
    }

    /// Start playback. The state stays idle while a rebuild is pending.
    pub fn trigger(&self) -> PlaybackState {
        let mut state = PlaybackState::default();
        if !self.needs_rebuild {
            state.envelope = PipeEnvelope::Attack;
        }
        state
    }

    pub fn release(&self, state: &mut PlaybackState) {
        state.release();
    }

    /// Add one sub-frame of this pipe into `out`.
    pub fn play<R: Rng>(&self, state: &mut PlaybackState, out: &mut [f32], rng: &mut R) {
        let frames = out.len().min(SUB_FRAME_LENGTH);

        if self.needs_rebuild || self.wavetable.is_empty() {
            // Retuned while sounding; the table no longer matches the cursors.
            out[..frames].fill(0.0);
            state.envelope = PipeEnvelope::Over;
            state.play = None;
            state.release = None;
            return;
        }

        let loop_start = self.attack_length;
        let loop_end = loop_start + self.loop_length;
        let step = self.sample_step;
        let w = &self.wavetable;

        let mut p = state.play;
        let mut r = state.release;

        match state.envelope {
            PipeEnvelope::Attack => {
                if p.is_none() {
                    p = Some(0);
                    state.play_interpolation = 0.0;
                    state.play_speed = 0.0;
                }
            }
            PipeEnvelope::Release => {
                if r.is_none() {
                    r = p.take();
                    state.release_gain = 1.0;
                    state.release_interpolation = state.play_interpolation;
                    state.release_count = self.release_length;
                }
            }
            PipeEnvelope::Idle | PipeEnvelope::Over => return,
        }

        if let Some(mut ri) = r {
            let mut g = state.release_gain;
            let remaining = state.release_count.saturating_sub(1);
            let mut dg = g / SUB_FRAME_LENGTH as f32;
            if remaining > 0 {
                dg *= self.release_multiplier;
            }

            if ri < loop_start {
                for o in out[..frames].iter_mut() {
                    *o += g * w[ri];
                    ri += 1;
                    g -= dg;
                }
            } else {
                let mut y = state.release_interpolation;
                let dy = self.release_detune;
                for o in out[..frames].iter_mut() {
                    y += dy;
                    if y > 1.0 {
                        y -= 1.0;
                        ri += 1;
                    } else if y < 0.0 {
                        y += 1.0;
                        ri = ri.saturating_sub(1);
                    }
                    *o += g * (w[ri] + y * (w[ri + 1] - w[ri]));
                    g -= dg;
                    ri += step;
                    if ri >= loop_end {
                        ri -= self.loop_length;
                    }
                }
                state.release_interpolation = y;
            }

            if remaining > 0 {
                state.release_gain = g;
                state.release_count = remaining;
                r = Some(ri);
            } else {
                r = None;
                state.envelope = PipeEnvelope::Over;
            }
        }

        if let Some(mut pi) = p {
            if pi < loop_start {
                for (o, &x) in out[..frames].iter_mut().zip(&w[pi..]) {
                    *o += x;
                }
                pi += frames;
            } else {
                let mut y = state.play_interpolation;
                let ins = self.instability;
                state.play_speed += ins * 0.0005 * (0.05 * ins * (rng.r#gen::<f32>() - 0.5) - state.play_speed);
                let dy = state.play_speed * step as f32;
                for o in out[..frames].iter_mut() {
                    y += dy;
                    if y > 1.0 {
                        y -= 1.0;
                        pi += 1;
                    } else if y < 0.0 {
                        y += 1.0;
                        pi = pi.saturating_sub(1);
                    }
                    *o += w[pi] + y * (w[pi + 1] - w[pi]);
                    pi += step;
                    if pi >= loop_end {
                        pi -= self.loop_length;
                    }
                }
                state.play_interpolation = y;
            }
            p = Some(pi);
        }

        if p.is_none() && r.is_none() {
            state.envelope = PipeEnvelope::Over;
        }
        state.play = p;
        state.release = r;
    }

    fn generate<R: Rng>(&mut self, rng: &mut R) {
        let model = Arc::clone(&self.model);
        let n = self.note;
        let sr = self.sample_rate;

        let longest_attack = (0..N_HARM)
            .map(|h| model.harmonic_attack(h, n))
            .fold(model.note_attack(n), f32::max);

        // Attack ends on a sub-frame boundary.
        let attack = (sr * longest_attack + 0.5).max(0.0) as usize;
        self.attack_length = attack.div_ceil(SUB_FRAME_LENGTH) * SUB_FRAME_LENGTH;

        let f1 = (self.frequency + model.note_offset(n) + model.note_randomisation(n) * (2.0 * rng.r#gen::<f32>() + 1.0))
            / sr;
        let f0 = f1 * exp2ap(model.note_attack_detune(n) / 1200.0);

        // Highest audible harmonic decides how fast the table may be read.
        let mut f = 0.0;
        for h in (0..N_HARM).rev() {
            f = (h + 1) as f32 * f1;
            if f < 0.45 && model.harmonic_level(h, n) >= -40.0 {
                break;
            }
        }
        self.sample_step = if f > 0.25 {
            3
        } else if f > 0.125 {
            2
        } else {
            1
        };
        let step = self.sample_step;

        let (mut loop_len, mut cycles) = looplen(f1 * sr, step as f32 * sr, (sr / 6.0) as usize);
        if loop_len < step * SUB_FRAME_LENGTH {
            let k = (step * SUB_FRAME_LENGTH - 1) / loop_len + 1;
            loop_len *= k;
            cycles *= k;
        }
        self.loop_length = loop_len;

        let attack_len = self.attack_length;
        let total = attack_len + loop_len + step * (SUB_FRAME_LENGTH + 4);
        self.wavetable.clear();
        self.wavetable.resize(total, 0.0);

        self.release_length = (model.note_release(n) * sr / SUB_FRAME_LENGTH as f32).ceil().max(0.0) as usize + 1;
        self.release_multiplier = 1.0 - 0.1_f32.powf(1.0 / self.release_length as f32);
        self.release_detune = step as f32 * (exp2ap(model.note_release_detune(n) / 1200.0) - 1.0);
        self.instability = model.note_instability(n);

        // Phase along the table: glide from f0 to f1 during the note attack,
        // then an exact periodic advance over the loop.
        let mut arg = vec![0.0_f32; total];
        let k = (sr * model.note_attack(n) + 0.5).max(0.0) as usize;
        let mut t = 0.0_f32;
        for (i, a) in arg.iter_mut().enumerate().take(attack_len + 1) {
            *a = t - (t + 0.5).floor();
            t += if i < k {
                ((k - i) as f32 * f0 + i as f32 * f1) / k as f32
            } else {
                f1
            };
        }
        let loop_origin = arg[attack_len];
        for i in 1..loop_len {
            let t = loop_origin + i as f32 * cycles as f32 / loop_len as f32;
            arg[attack_len + i] = t - (t + 0.5).floor();
        }

        let v0 = exp2ap(0.1661 * model.note_volume(n));
        for h in 0..N_HARM {
            let order = (h + 1) as f32;
            if order * f1 > 0.45 {
                break;
            }
            let level = model.harmonic_level(h, n);
            if level < -80.0 {
                continue;
            }

            let v = v0
                * exp2ap(0.1661 * (level + model.harmonic_randomisation(h, n) * (2.0 * rng.r#gen::<f32>() - 1.0)));
            let k = (sr * model.harmonic_attack(h, n) + 0.5).max(0.0) as usize;
            let att = attgain(k, model.harmonic_attack_profile(h, n));

            for (i, (s, &a)) in self.wavetable[..attack_len + loop_len].iter_mut().zip(&arg).enumerate() {
                let mut t = a * order;
                t -= t.floor();
                let mut m = v * (TAU * t).sin();
                if i < k {
                    m *= att[i];
                }
                *s += m;
            }
        }

        let tail = step * (SUB_FRAME_LENGTH + 4);
        self.wavetable
            .copy_within(attack_len..attack_len + tail, attack_len + loop_len);

        self.needs_rebuild = false;
    }
}
