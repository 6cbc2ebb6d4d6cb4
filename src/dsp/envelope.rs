//! ADSR Envelope generator with exponential segments.

/// Envelope stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Segment timings, in seconds. Sustain is a level in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeTrigger {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for EnvelopeTrigger {
    fn default() -> Self {
        Self {
            attack: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 1.0,
        }
    }
}

/// ADSR envelope whose segments approach an overshooting target
/// exponentially, giving the usual analog feel. A zero sustain makes the
/// envelope end on its own after the decay.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    stage: Stage,
    level: f32,

    attack_coef: f32,
    attack_base: f32,
    decay_coef: f32,
    decay_base: f32,
    release_coef: f32,
    release_base: f32,
    sustain: f32,
}

impl Envelope {
    pub const ATTACK_TARGET_RATIO: f32 = 0.3;
    pub const DECAY_RELEASE_TARGET_RATIO: f32 = 0.0001;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Off
    }

    /// Start the attack from silence.
    pub fn trigger(&mut self, t: &EnvelopeTrigger, sample_rate: f32) {
        const R: f32 = Envelope::DECAY_RELEASE_TARGET_RATIO;

        self.sustain = t.sustain.clamp(0.0, 1.0);

        self.attack_coef = coefficient(t.attack * sample_rate, Self::ATTACK_TARGET_RATIO);
        self.attack_base = (1.0 + Self::ATTACK_TARGET_RATIO) * (1.0 - self.attack_coef);

        self.decay_coef = coefficient(t.decay * sample_rate, R);
        self.decay_base = (self.sustain - R) * (1.0 - self.decay_coef);

        self.release_coef = coefficient(t.release * sample_rate, R);
        self.release_base = -R * (1.0 - self.release_coef);

        self.stage = Stage::Attack;
        self.level = 0.0;
    }

    /// Enter the release segment with the timing given at trigger.
    pub fn release(&mut self) {
        if self.stage != Stage::Off {
            self.stage = Stage::Release;
        }
    }

    /// Enter the release segment with a new release time.
    pub fn release_with(&mut self, release: f32, sample_rate: f32) {
        self.release_coef = coefficient(release * sample_rate, Self::DECAY_RELEASE_TARGET_RATIO);
        self.release_base = -Self::DECAY_RELEASE_TARGET_RATIO * (1.0 - self.release_coef);
        self.release();
    }

    /// Generate the next envelope sample.
    #[inline]
    pub fn next(&mut self) -> f32 {
        match self.stage {
            Stage::Off | Stage::Sustain => {}
            Stage::Attack => {
                self.level = self.attack_base + self.level * self.attack_coef;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                }
            }
            Stage::Decay => {
                self.level = self.decay_base + self.level * self.decay_coef;
                if self.level <= self.sustain {
                    self.level = self.sustain;
                    self.stage = if self.level > 0.0 { Stage::Sustain } else { Stage::Off };
                }
            }
            Stage::Release => {
                self.level = self.release_base + self.level * self.release_coef;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = Stage::Off;
                }
            }
        }
        self.level
    }
}

fn coefficient(rate: f32, target_ratio: f32) -> f32 {
    if rate <= 0.0 {
        0.0
    } else {
        (-((1.0 + target_ratio) / target_ratio).ln() / rate).exp()
    }
}
