//! Rankwave: one rank of pipes sharing a pipe model.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::model::PipeModel;
use crate::pipewave::{PipeRef, Pipewave, PlaybackState};
use crate::scale::Scale;

/// Number of pipe sets per rank. One plays while the other is retuned.
const PIPE_SETS: usize = 2;

/// All pipes of one rank, over the model's note range.
///
/// Pipes are kept in two sets. Retuning writes the inactive set,
/// [`prepare_to_play`](Self::prepare_to_play) regenerates it and makes it
/// active. Voices still holding a reference into the old set keep playing
/// from it until that set is retuned again.
#[derive(Debug, Clone)]
pub struct Rankwave {
    id: usize,
    name: String,
    model: Arc<PipeModel>,
    note_min: u8,
    note_max: u8,
    pipes: [Vec<Pipewave>; PIPE_SETS],
    set_index: usize,
}

impl Rankwave {
    pub fn new(id: usize, name: impl Into<String>, model: Arc<PipeModel>) -> Self {
        let note_min = model.note_min();
        let note_max = model.note_max();
        Self {
            id,
            name: name.into(),
            model,
            note_min,
            note_max,
            pipes: [Vec::new(), Vec::new()],
            set_index: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Arc<PipeModel> {
        &self.model
    }

    pub fn note_min(&self) -> u8 {
        self.note_min
    }

    pub fn note_max(&self) -> u8 {
        self.note_max
    }

    pub fn active_set(&self) -> usize {
        self.set_index
    }

    fn next_set(&self) -> usize {
        (self.set_index + 1) % PIPE_SETS
    }

    fn base_frequency(&self, tuning: f32) -> f32 {
        tuning * self.model.ratio()
    }

    /// Build both pipe sets from scratch. Pipes stay inert until prepared.
    pub fn create_pipes(&mut self, scale: &Scale, tuning: f32) {
        let fbase = self.base_frequency(tuning);
        for set in self.pipes.iter_mut() {
            set.clear();
            for note in self.note_min..=self.note_max {
                let index = (note - self.note_min) as usize;
                set.push(Pipewave::new(
                    Arc::clone(&self.model),
                    index,
                    scale.frequency_for_note(note, fbase),
                ));
            }
        }
        self.set_index = 0;
    }

    /// Retune the inactive pipe set. Takes effect after the next
    /// [`prepare_to_play`](Self::prepare_to_play).
    pub fn retune_pipes(&mut self, scale: &Scale, tuning: f32) {
        let fbase = self.base_frequency(tuning);
        let next = self.next_set();
        let note_min = self.note_min;
        for (i, pipe) in self.pipes[next].iter_mut().enumerate() {
            pipe.set_frequency(scale.frequency_for_note(note_min + i as u8, fbase));
            pipe.mark_dirty();
        }
    }

    /// Generate the inactive set and switch to it.
    pub fn prepare_to_play(&mut self, sample_rate: f32, rng: &mut StdRng) {
        let next = self.next_set();
        for pipe in self.pipes[next].iter_mut() {
            pipe.prepare_to_play(sample_rate, rng);
        }
        self.set_index = next;
    }

    /// Start a pipe of the active set. Idle when the note is out of range or
    /// the pipe is still waiting for its wavetable.
    pub fn trigger(&self, note: u8) -> PlaybackState {
        if note < self.note_min || note > self.note_max {
            return PlaybackState::default();
        }
        let index = (note - self.note_min) as usize;
        let Some(pipe) = self.pipes[self.set_index].get(index) else {
            return PlaybackState::default();
        };

        let mut state = pipe.trigger();
        if !state.is_idle() {
            state.pipe = Some(PipeRef {
                rank: self.id,
                set: self.set_index,
                index,
            });
        }
        state
    }

    pub fn pipe(&self, set: usize, index: usize) -> Option<&Pipewave> {
        self.pipes.get(set)?.get(index)
    }

    /// Add one sub-frame of the pipe referenced by `state` into `out`.
    pub fn play(&self, state: &mut PlaybackState, out: &mut [f32], rng: &mut StdRng) {
        let Some(r) = state.pipe else {
            return;
        };
        if let Some(pipe) = self.pipe(r.set, r.index) {
            pipe.play(state, out, rng);
        }
    }

    /// Pipe frequency of `note` in the active set.
    pub fn frequency(&self, note: u8) -> Option<f32> {
        if note < self.note_min {
            return None;
        }
        self.pipes[self.set_index]
            .get((note - self.note_min) as usize)
            .map(Pipewave::frequency)
    }
}

/// All ranks used by an organ, addressed by index.
#[derive(Debug, Clone, Default)]
pub struct RankBank {
    ranks: Vec<Rankwave>,
    seed: u64,
    generation: u64,
}

impl RankBank {
    pub fn new(seed: u64) -> Self {
        Self {
            ranks: Vec::new(),
            seed,
            generation: 0,
        }
    }

    /// Add a rank for `model`, or return the existing one with that name.
    pub fn add(&mut self, model: Arc<PipeModel>) -> usize {
        if let Some(id) = self.index_of(&model.name) {
            return id;
        }
        let id = self.ranks.len();
        let name = model.name.clone();
        self.ranks.push(Rankwave::new(id, name, model));
        id
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.ranks.iter().position(|r| r.name() == name)
    }

    pub fn get(&self, id: usize) -> Option<&Rankwave> {
        self.ranks.get(id)
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rankwave> {
        self.ranks.iter()
    }

    pub fn create_all(&mut self, scale: &Scale, tuning: f32) {
        for rank in self.ranks.iter_mut() {
            rank.create_pipes(scale, tuning);
        }
    }

    pub fn retune_all(&mut self, scale: &Scale, tuning: f32) {
        info!("Retuning {} ranks to {tuning} Hz, {}", self.ranks.len(), scale.temperament().name());
        for rank in self.ranks.iter_mut() {
            rank.retune_pipes(scale, tuning);
        }
    }

    /// Prepare every rank for `sample_rate`, one scoped thread per rank.
    ///
    /// Each rank draws its randomisation from its own generator seeded from
    /// the bank seed, so the result does not depend on thread scheduling.
    pub fn prepare_all(&mut self, sample_rate: f32) {
        let start = Instant::now();
        let seed = self.seed;
        let generation = self.generation;
        self.generation += 1;

        thread::scope(|s| {
            for rank in self.ranks.iter_mut() {
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(
                        seed ^ (rank.id() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ generation,
                    );
                    rank.prepare_to_play(sample_rate, &mut rng);
                });
            }
        });

        debug!("Prepared {} ranks in {:?}", self.ranks.len(), start.elapsed());
    }

    pub fn play(&self, state: &mut PlaybackState, out: &mut [f32], rng: &mut StdRng) {
        if let Some(rank) = state.pipe.and_then(|p| self.ranks.get(p.rank)) {
            rank.play(state, out, rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{SAMPLE_RATE_F, SUB_FRAME_LENGTH};
    use crate::model::ModelRegistry;
    use crate::scale::Temperament;

    fn bank() -> RankBank {
        let reg = ModelRegistry::builtin();
        let mut bank = RankBank::new(42);
        bank.add(Arc::clone(reg.get("Principal 8").expect("builtin")));
        bank.add(Arc::clone(reg.get("Octave 4").expect("builtin")));
        bank.create_all(&Scale::default(), 440.0);
        bank
    }

    #[test]
    fn add_is_idempotent_by_name() {
        let reg = ModelRegistry::builtin();
        let mut bank = bank();
        let id = bank.add(Arc::clone(reg.get("Octave 4").expect("builtin")));
        assert_eq!(id, 1);
        assert_eq!(bank.len(), 2);
        assert_eq!(bank.index_of("Principal 8"), Some(0));
    }

    #[test]
    fn trigger_before_prepare_is_idle() {
        let bank = bank();
        let rank = bank.get(0).expect("rank");
        assert!(rank.trigger(60).is_idle());
    }

    #[test]
    fn prepare_flips_pipe_set() {
        let mut bank = bank();
        bank.prepare_all(SAMPLE_RATE_F);
        let rank = bank.get(0).expect("rank");
        assert_eq!(rank.active_set(), 1);

        let state = rank.trigger(60);
        assert!(!state.is_idle());
        let r = state.pipe.expect("pipe reference");
        assert_eq!((r.rank, r.set, r.index), (0, 1, 60 - rank.note_min() as usize));
        assert!(rank.trigger(rank.note_max() + 1).is_idle());
        assert!(rank.trigger(rank.note_min() - 1).is_idle());
    }

    #[test]
    fn octave_rank_follows_ratio() {
        let mut bank = bank();
        bank.prepare_all(SAMPLE_RATE_F);
        let f8 = bank.get(0).and_then(|r| r.frequency(69)).expect("8'");
        let f4 = bank.get(1).and_then(|r| r.frequency(69)).expect("4'");
        assert!((f8 - 440.0).abs() < 1e-3, "got {f8}");
        assert!((f4 - 880.0).abs() < 1e-2, "got {f4}");
    }

    #[test]
    fn retune_applies_after_prepare() {
        let mut bank = bank();
        bank.prepare_all(SAMPLE_RATE_F);

        let mut rng = StdRng::seed_from_u64(1);
        let mut old = bank.get(0).expect("rank").trigger(69);
        let mut out = [0.0; SUB_FRAME_LENGTH];
        bank.play(&mut old, &mut out, &mut rng);

        bank.retune_all(&Scale::new(Temperament::EqualTemp), 415.0);
        // Old set is still active and playable.
        out.fill(0.0);
        bank.play(&mut old, &mut out, &mut rng);
        assert!(!old.is_over());

        bank.prepare_all(SAMPLE_RATE_F);
        let rank = bank.get(0).expect("rank");
        assert_eq!(rank.active_set(), 0);
        let f = rank.frequency(69).expect("frequency");
        assert!((f - 415.0).abs() < 1e-3, "got {f}");
    }

    #[test]
    fn preparation_is_reproducible() {
        let mut a = bank();
        let mut b = bank();
        a.prepare_all(SAMPLE_RATE_F);
        b.prepare_all(SAMPLE_RATE_F);
        let pa = a.get(0).and_then(|r| r.pipe(1, 10)).expect("pipe");
        let pb = b.get(0).and_then(|r| r.pipe(1, 10)).expect("pipe");
        assert_eq!(pa.wavetable(), pb.wavetable());
    }
}
