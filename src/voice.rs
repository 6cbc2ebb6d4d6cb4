//! Voice: one sounding pipe, and the fixed pool voices are drawn from.
//!
//! A voice adds a chiff burst in front of the pipe tone, delays the tone
//! slightly behind it, and places the result in the stereo field. Voices
//! live in a preallocated arena and are threaded onto index-linked lists,
//! so triggering, releasing and recycling never allocate.

use rand::rngs::StdRng;

use crate::consts::{SAMPLE_RATE_F, SUB_FRAME_LENGTH, TREMULANT_DELAY_LENGTH};
use crate::dsp::chiff::Chiff;
use crate::dsp::delay::DelayLine;
use crate::dsp::envelope::EnvelopeTrigger;
use crate::dsp::spatial::SpatialSource;
use crate::pipewave::PlaybackState;
use crate::rankwave::RankBank;

/// Longest delay of the tone behind the chiff, in samples.
const PRE_DELAY_LENGTH: usize = 2048;
/// Tone delay, in pipe periods.
const PRE_DELAY_PERIODS: f32 = 2.0;
/// Reference frequency above which chiff gets quieter.
const CHIFF_REFERENCE_FREQUENCY: f32 = 200.0;

/// Index of a voice in its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(usize);

impl VoiceId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-trigger voice settings, taken from the stop and the pipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSetup {
    /// Index of the stop that owns the voice, within its division.
    pub stop: usize,
    pub gain: f32,
    pub chiff_gain: f32,
    /// Pipe frequency, drives the chiff filters and timings.
    pub frequency: f32,
}

impl Default for VoiceSetup {
    fn default() -> Self {
        Self {
            stop: 0,
            gain: 1.0,
            chiff_gain: 0.0,
            frequency: 440.0,
        }
    }
}

/// Stereo position of a pipe: notes alternate sides by parity and spread
/// wider the further they are from the centre of the keyboard.
pub fn pipe_position(note: u8) -> (f32, f32) {
    let k = if note % 2 != 0 { 1.0 } else { -1.0 };
    let x = 0.15 * (note as f32 - 65.0).abs() * k + 0.3;
    (x, 5.0)
}

#[derive(Debug, Clone)]
pub struct Voice {
    state: PlaybackState,
    note: u8,
    stop: usize,
    gain: f32,

    chiff: Chiff,
    chiff_enabled: bool,
    pre_delay: DelayLine,
    pre_delay_samples: f32,
    spatial: SpatialSource,
    post_release_counter: usize,
    buffer: [f32; SUB_FRAME_LENGTH],

    prev: Option<VoiceId>,
    next: Option<VoiceId>,
}

impl Default for Voice {
    fn default() -> Self {
        Self::new()
    }
}

impl Voice {
    pub fn new() -> Self {
        let mut spatial = SpatialSource::new(SAMPLE_RATE_F);
        // Size the delay line for the widest position once, so later
        // triggers never grow it.
        spatial.set_source_position(pipe_position(0).0, 5.0);
        spatial.recalculate();
        spatial.set_source_position(pipe_position(127).0, 5.0);
        spatial.recalculate();

        Self {
            state: PlaybackState::default(),
            note: 0,
            stop: 0,
            gain: 1.0,
            chiff: Chiff::new(SAMPLE_RATE_F),
            chiff_enabled: false,
            pre_delay: DelayLine::new(PRE_DELAY_LENGTH),
            pre_delay_samples: 0.0,
            spatial,
            post_release_counter: 0,
            buffer: [0.0; SUB_FRAME_LENGTH],
            prev: None,
            next: None,
        }
    }

    pub fn trigger(&mut self, state: PlaybackState, note: u8, setup: &VoiceSetup) {
        self.state = state;
        self.note = note;
        self.stop = setup.stop;
        self.gain = setup.gain;

        let period = 1.0 / setup.frequency.max(1.0);
        self.chiff_enabled = setup.chiff_gain > 0.0;
        if self.chiff_enabled {
            self.chiff.gain = setup.chiff_gain * (CHIFF_REFERENCE_FREQUENCY / setup.frequency.max(1.0)).sqrt().min(1.0);
            self.chiff.envelope_trigger = EnvelopeTrigger {
                attack: 2.0 * period,
                decay: 8.0 * period,
                sustain: 0.0,
                release: 4.0 * period,
            };
            self.chiff.set_frequency(setup.frequency);
            self.chiff.trigger();
            self.pre_delay_samples =
                (PRE_DELAY_PERIODS * period * SAMPLE_RATE_F).min((PRE_DELAY_LENGTH - 2) as f32);
        } else {
            self.pre_delay_samples = 0.0;
        }

        let (x, y) = pipe_position(note);
        self.spatial.set_source_position(x, y);
        self.spatial.recalculate();

        self.post_release_counter =
            self.spatial.tail_samples() + self.pre_delay_samples.ceil() as usize + TREMULANT_DELAY_LENGTH;
    }

    /// Start the release. Voices already over are left alone until reclaimed.
    pub fn release(&mut self) {
        if self.state.is_over() {
            return;
        }
        self.state.release();
        if self.chiff_enabled {
            self.chiff.release();
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.chiff.reset();
        self.chiff_enabled = false;
        self.pre_delay.reset();
        self.pre_delay_samples = 0.0;
        self.spatial.reset();
        self.post_release_counter = 0;
    }

    /// Add one sub-frame of this voice into the stereo outputs.
    pub fn process(&mut self, ranks: &RankBank, rng: &mut StdRng, out_l: &mut [f32], out_r: &mut [f32]) {
        self.buffer.fill(0.0);

        if self.state.is_over() {
            self.post_release_counter -= self.post_release_counter.min(SUB_FRAME_LENGTH);
        } else {
            ranks.play(&mut self.state, &mut self.buffer, rng);
            if self.gain != 1.0 {
                for s in self.buffer.iter_mut() {
                    *s *= self.gain;
                }
            }
        }

        if self.pre_delay_samples > 0.0 {
            for s in self.buffer.iter_mut() {
                self.pre_delay.write(*s);
                *s = self.pre_delay.read(self.pre_delay_samples);
            }
        }
        if self.chiff_enabled {
            self.chiff.process(&mut self.buffer, rng);
        }

        self.spatial.process_add(&self.buffer, out_l, out_r);
    }

    /// Envelope finished and every delayed sample flushed.
    pub fn is_over(&self) -> bool {
        self.state.is_over() && self.post_release_counter == 0
    }

    pub fn is_releasing(&self) -> bool {
        self.state.is_releasing() || self.state.is_over()
    }

    pub fn is_for_note(&self, note: u8) -> bool {
        self.state.pipe.is_some() && self.note == note
    }

    pub fn note(&self) -> u8 {
        self.note
    }

    pub fn stop(&self) -> usize {
        self.stop
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }
}

/// Head, tail and length of an index-linked list of voices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceList {
    head: Option<VoiceId>,
    tail: Option<VoiceId>,
    len: usize,
}

impl VoiceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first(&self) -> Option<VoiceId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity arena of voices.
///
/// Idle voices sit on the pool's own list. Triggering moves a voice from
/// there to the caller's list; [`reset_and_return`](Self::reset_and_return)
/// moves it back.
#[derive(Debug, Clone)]
pub struct VoicePool {
    voices: Vec<Voice>,
    idle: VoiceList,
    active: usize,
}

impl VoicePool {
    pub fn new(capacity: usize) -> Self {
        let mut pool = Self {
            voices: (0..capacity).map(|_| Voice::new()).collect(),
            idle: VoiceList::new(),
            active: 0,
        };
        let mut idle = VoiceList::new();
        for i in 0..capacity {
            pool.push_back(&mut idle, VoiceId(i));
        }
        pool.idle = idle;
        pool
    }

    pub fn capacity(&self) -> usize {
        self.voices.len()
    }

    /// Number of voices currently taken from the pool.
    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len
    }

    /// Take an idle voice, start it and append it to `list`. `None` when the
    /// pool is exhausted; the note is dropped.
    pub fn trigger(
        &mut self,
        list: &mut VoiceList,
        state: PlaybackState,
        note: u8,
        setup: &VoiceSetup,
    ) -> Option<VoiceId> {
        let mut idle = self.idle;
        let id = idle.head?;
        self.remove(&mut idle, id);
        self.idle = idle;

        self.voices[id.0].trigger(state, note, setup);
        self.push_back(list, id);
        self.active += 1;
        Some(id)
    }

    /// Unlink a finished voice from `list`, reset it and make it idle again.
    pub fn reset_and_return(&mut self, list: &mut VoiceList, id: VoiceId) {
        self.remove(list, id);
        self.voices[id.0].reset();
        let mut idle = self.idle;
        self.push_back(&mut idle, id);
        self.idle = idle;
        self.active = self.active.saturating_sub(1);
    }

    pub fn push_back(&mut self, list: &mut VoiceList, id: VoiceId) {
        let tail = list.tail;
        {
            let v = &mut self.voices[id.0];
            v.prev = tail;
            v.next = None;
        }
        match tail {
            Some(t) => self.voices[t.0].next = Some(id),
            None => list.head = Some(id),
        }
        list.tail = Some(id);
        list.len += 1;
    }

    /// Unlink `id` from `list`. The voice's own links are cleared; callers
    /// traversing the list must read [`next`](Self::next) first.
    pub fn remove(&mut self, list: &mut VoiceList, id: VoiceId) {
        let (prev, next) = {
            let v = &self.voices[id.0];
            (v.prev, v.next)
        };
        match prev {
            Some(p) => self.voices[p.0].next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.voices[n.0].prev = prev,
            None => list.tail = prev,
        }
        let v = &mut self.voices[id.0];
        v.prev = None;
        v.next = None;
        list.len = list.len.saturating_sub(1);
    }

    pub fn next(&self, id: VoiceId) -> Option<VoiceId> {
        self.voices.get(id.0).and_then(|v| v.next)
    }

    pub fn voice(&self, id: VoiceId) -> &Voice {
        &self.voices[id.0]
    }

    pub fn voice_mut(&mut self, id: VoiceId) -> &mut Voice {
        &mut self.voices[id.0]
    }

    pub fn iter<'a>(&'a self, list: &VoiceList) -> VoiceIter<'a> {
        VoiceIter {
            pool: self,
            current: list.head,
        }
    }
}

pub struct VoiceIter<'a> {
    pool: &'a VoicePool,
    current: Option<VoiceId>,
}

impl<'a> Iterator for VoiceIter<'a> {
    type Item = (VoiceId, &'a Voice);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        self.current = self.pool.next(id);
        Some((id, self.pool.voice(id)))
    }
}
