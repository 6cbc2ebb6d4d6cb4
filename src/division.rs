//! Division: one keyboard with its stops, links, tremulant and swell.
//!
//! Notes arrive through [`dispatch_note_on`] / [`dispatch_note_off`], which
//! also forward them along enabled links. Every sub-frame the engine calls
//! [`aggregate_link_keys`] once, then [`Division::process`] and
//! [`Division::modulate`] on each division.

use log::warn;
use rand::rngs::StdRng;

use crate::consts::{
    CC_MODULATION, CC_VOLUME, MAX_STOPS, SAMPLE_RATE_F, SUB_FRAME_LENGTH, TREMULANT_DELAY_CENTRE,
    TREMULANT_DELAY_DEPTH, TREMULANT_DELAY_LENGTH, TREMULANT_GAIN_DEPTH, TREMULANT_MAX_DEPTH,
};
use crate::controls::{channel_matches, ControlUpdate, DivisionParams};
use crate::dsp::delay::DelayLine;
use crate::dsp::filter::{BiquadFilter, FilterType};
use crate::dsp::mixer::{LevelMeter, StereoFrame};
use crate::param::AudioParameter;
use crate::rankwave::RankBank;
use crate::state::DivisionState;
use crate::stop::Stop;
use crate::voice::{VoiceList, VoicePool, VoiceSetup};

/// Per-sample smoothing of the swell and tremulant depth.
const SMOOTHING: f32 = 0.005;
const SWELL_MIN_CUTOFF: f32 = 250.0;
const SWELL_CUTOFF_RANGE: f32 = 15750.0;

/// Set of MIDI notes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySet(u128);

impl KeySet {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, note: u8) {
        if note < 128 {
            self.0 |= 1 << note;
        }
    }

    pub fn clear(&mut self, note: u8) {
        if note < 128 {
            self.0 &= !(1 << note);
        }
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    pub fn contains(&self, note: u8) -> bool {
        note < 128 && self.0 & (1 << note) != 0
    }

    pub fn union(self, other: KeySet) -> KeySet {
        KeySet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let n = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            Some(n)
        })
    }
}

/// What the audio-thread division code needs from the engine.
pub struct DivisionContext<'a> {
    pub ranks: &'a RankBank,
    pub pool: &'a mut VoicePool,
    pub rng: &'a mut StdRng,
}

/// Fixed properties of a division, resolved from the organ configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DivisionOptions {
    /// Target division indices, in link order.
    pub links: Vec<usize>,
    /// Tremulant depth, `None` when the division has no tremulant.
    pub tremulant: Option<f32>,
    pub swell: bool,
    pub gain: f32,
    pub params: DivisionParams,
}

impl Default for DivisionOptions {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            tremulant: None,
            swell: false,
            gain: 1.0,
            params: DivisionParams::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Division {
    name: String,
    stops: Vec<Stop>,
    links: Vec<usize>,
    tremulant_depth: Option<f32>,
    has_swell: bool,
    gain: f32,

    params: DivisionParams,
    voices: VoiceList,
    keys: KeySet,
    link_keys: KeySet,
    sounding: Vec<KeySet>,

    swell: AudioParameter,
    tremulant_level: AudioParameter,
    tremulant_delay: [DelayLine; 2],
    swell_filter: [BiquadFilter; 2],
    levels: [LevelMeter; 2],
}

impl Division {
    pub fn new(name: impl Into<String>, mut stops: Vec<Stop>, options: DivisionOptions) -> Self {
        let name = name.into();
        if stops.len() > MAX_STOPS {
            warn!("Division '{name}' has {} stops, only {MAX_STOPS} are used", stops.len());
            stops.truncate(MAX_STOPS);
        }
        let stop_count = stops.len();
        let params = options.params;
        let swell = AudioParameter::new(params.swell, 0.0, 1.0, SMOOTHING);
        let tremulant = if params.tremulant && options.tremulant.is_some() { 1.0 } else { 0.0 };

        let filter = || BiquadFilter::with_params(FilterType::LowPass, SAMPLE_RATE_F, swell_cutoff(params.swell), 0.7071);
        let delay = || DelayLine::new(TREMULANT_DELAY_LENGTH);

        Self {
            name,
            stops,
            links: options.links,
            tremulant_depth: options.tremulant.map(|d| d.max(0.0).min(TREMULANT_MAX_DEPTH)),
            has_swell: options.swell,
            gain: options.gain,
            params,
            voices: VoiceList::new(),
            keys: KeySet::new(),
            link_keys: KeySet::new(),
            sounding: vec![KeySet::new(); stop_count],
            swell,
            tremulant_level: AudioParameter::new(tremulant, 0.0, 1.0, SMOOTHING),
            tremulant_delay: [delay(), delay()],
            swell_filter: [filter(), filter()],
            levels: [LevelMeter::new(), LevelMeter::new()],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    pub fn stop(&self, index: usize) -> Option<&Stop> {
        self.stops.get(index)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn links(&self) -> &[usize] {
        &self.links
    }

    pub fn params(&self) -> &DivisionParams {
        &self.params
    }

    /// Apply one field-level change from a controller.
    pub fn apply_update(&mut self, update: &ControlUpdate) {
        match *update {
            ControlUpdate::EnableStop { stop, enable, .. } => self.enable_stop(stop, enable),
            ControlUpdate::Tremulant { enable, .. } => self.set_tremulant_enabled(enable),
            ControlUpdate::Link { link, enable, .. } => self.enable_link(link, enable),
            ControlUpdate::MidiChannels { mask, .. } => self.set_midi_channels_mask(mask),
            ControlUpdate::Swell { gain, .. } => self.set_swell_gain(gain),
        }
    }

    pub fn enable_stop(&mut self, index: usize, enable: bool) {
        if index < self.stops.len() {
            self.params.enable_stop(index, enable);
        }
    }

    pub fn is_stop_enabled(&self, index: usize) -> bool {
        self.params.is_stop_enabled(index)
    }

    pub fn disable_all_stops(&mut self) {
        self.params.stops = 0;
    }

    pub fn has_tremulant(&self) -> bool {
        self.tremulant_depth.is_some()
    }

    /// No effect on divisions without a tremulant.
    pub fn set_tremulant_enabled(&mut self, enable: bool) {
        if self.has_tremulant() {
            self.params.tremulant = enable;
            self.tremulant_level.set_value(if enable { 1.0 } else { 0.0 }, false);
        }
    }

    pub fn is_tremulant_enabled(&self) -> bool {
        self.params.tremulant
    }

    pub fn enable_link(&mut self, index: usize, enable: bool) {
        if index < self.links.len() {
            self.params.enable_link(index, enable);
        }
    }

    pub fn is_link_enabled(&self, index: usize) -> bool {
        index < self.links.len() && self.params.is_link_enabled(index)
    }

    pub fn set_midi_channels_mask(&mut self, mask: u16) {
        self.params.midi_channels = mask;
    }

    pub fn midi_channels_mask(&self) -> u16 {
        self.params.midi_channels
    }

    pub fn has_swell(&self) -> bool {
        self.has_swell
    }

    pub fn set_swell_gain(&mut self, gain: f32) {
        self.params.swell = gain.clamp(0.0, 1.0);
        self.swell.set_value(self.params.swell, false);
    }

    pub fn swell_gain(&self) -> f32 {
        self.params.swell
    }

    /// Keys held on this division's own channels.
    pub fn keys(&self) -> KeySet {
        self.keys
    }

    /// Keys reaching this division through enabled links.
    pub fn link_keys(&self) -> KeySet {
        self.link_keys
    }

    pub fn active_voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn voices(&self) -> &VoiceList {
        &self.voices
    }

    pub fn levels(&self) -> &[LevelMeter; 2] {
        &self.levels
    }

    /// Lowest and highest note any stop responds to.
    pub fn available_range(&self) -> Option<(u8, u8)> {
        self.stops
            .iter()
            .filter_map(Stop::key_range)
            .map(|r| (*r.start(), *r.end()))
            .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)))
    }

    /// Handle a note-on for this division only. Channel 0 marks an event
    /// forwarded by a link: it sounds but does not hold the key. Returns
    /// whether the event should travel on along this division's links.
    pub fn note_on(&mut self, ctx: &mut DivisionContext<'_>, note: u8, channel: u8) -> bool {
        if note >= 128 || !channel_matches(self.params.midi_channels, channel) {
            return false;
        }
        if channel != 0 {
            self.keys.set(note);
        }
        for s in 0..self.stops.len() {
            if self.params.is_stop_enabled(s) && !self.sounding[s].contains(note) {
                self.trigger_stop(ctx, s, note);
            }
        }
        true
    }

    /// Mirror of [`note_on`](Self::note_on). Voices are released unless the
    /// key is still held, on this division's own channels or through its
    /// linked keys.
    pub fn note_off(&mut self, ctx: &mut DivisionContext<'_>, note: u8, channel: u8) -> bool {
        if !self.clear_key(note, channel) {
            return false;
        }
        self.release_unheld(ctx.pool, note);
        true
    }

    /// The key half of [`note_off`](Self::note_off): clear the held key and
    /// report whether the event applies to this division.
    fn clear_key(&mut self, note: u8, channel: u8) -> bool {
        if note >= 128 || !channel_matches(self.params.midi_channels, channel) {
            return false;
        }
        if channel != 0 {
            self.keys.clear(note);
        }
        true
    }

    fn release_unheld(&mut self, pool: &mut VoicePool, note: u8) {
        if !self.keys.contains(note) && !self.link_keys.contains(note) {
            self.release_note(pool, note);
        }
    }

    pub fn all_notes_off(&mut self, ctx: &mut DivisionContext<'_>) {
        self.keys.clear_all();
        self.link_keys.clear_all();
        let mut cur = self.voices.first();
        while let Some(id) = cur {
            cur = ctx.pool.next(id);
            ctx.pool.voice_mut(id).release();
        }
        for s in self.sounding.iter_mut() {
            s.clear_all();
        }
    }

    fn release_note(&mut self, pool: &mut VoicePool, note: u8) {
        let mut cur = self.voices.first();
        while let Some(id) = cur {
            cur = pool.next(id);
            let voice = pool.voice_mut(id);
            if voice.is_for_note(note) && !voice.is_releasing() {
                let stop = voice.stop();
                voice.release();
                if let Some(s) = self.sounding.get_mut(stop) {
                    s.clear(note);
                }
            }
        }
    }

    /// Start every rank of `stop` for `note`. The pair only counts as
    /// sounding once a voice actually started, so a pipe awaiting its
    /// wavetable is retried on the next block.
    fn trigger_stop(&mut self, ctx: &mut DivisionContext<'_>, s: usize, note: u8) {
        let stop = &self.stops[s];
        let mut triggered = false;
        for rank_id in stop.ranks_for(note) {
            let Some(rank) = ctx.ranks.get(rank_id) else {
                continue;
            };
            let state = rank.trigger(note);
            if state.is_idle() {
                continue;
            }
            let setup = VoiceSetup {
                stop: s,
                gain: stop.gain,
                chiff_gain: stop.chiff_gain,
                frequency: rank.frequency(note).unwrap_or(440.0),
            };
            if ctx.pool.trigger(&mut self.voices, state, note, &setup).is_some() {
                triggered = true;
            }
        }
        if triggered {
            self.sounding[s].set(note);
        }
    }

    /// Run one sub-frame: start voices for held keys that lack one, then in
    /// a single pass over the active list release voices of disabled stops
    /// or unheld keys, mix every voice into `frame`, and return finished
    /// voices to the pool. Returns whether any voice was mixed.
    pub fn process(&mut self, ctx: &mut DivisionContext<'_>, frame: &mut StereoFrame) -> bool {
        let held = self.keys.union(self.link_keys);

        if !held.is_empty() {
            for s in 0..self.stops.len() {
                if !self.params.is_stop_enabled(s) {
                    continue;
                }
                for note in held.iter() {
                    if !self.sounding[s].contains(note) && self.stops[s].covers(note) {
                        self.trigger_stop(ctx, s, note);
                    }
                }
            }
        }

        let had_voices = !self.voices.is_empty();
        let mut cur = self.voices.first();
        while let Some(id) = cur {
            cur = ctx.pool.next(id);
            let voice = ctx.pool.voice_mut(id);

            if !voice.is_releasing() {
                let (stop, note) = (voice.stop(), voice.note());
                if !self.params.is_stop_enabled(stop) || !held.contains(note) {
                    voice.release();
                    if let Some(s) = self.sounding.get_mut(stop) {
                        s.clear(note);
                    }
                }
            }

            voice.process(ctx.ranks, ctx.rng, &mut frame.left, &mut frame.right);

            if voice.is_over() {
                ctx.pool.reset_and_return(&mut self.voices, id);
            }
        }
        had_voices
    }

    /// Apply division gain, swell and tremulant to a mixed sub-frame.
    pub fn modulate(&mut self, frame: &mut StereoFrame, tremulant: &[f32; SUB_FRAME_LENGTH]) {
        let depth = self.tremulant_depth.unwrap_or(0.0);
        let [delay_l, delay_r] = &mut self.tremulant_delay;

        for i in 0..SUB_FRAME_LENGTH {
            let g = self.swell.next_value() * self.gain;
            let m = self.tremulant_level.next_value() * depth * tremulant[i];

            if self.tremulant_depth.is_some() {
                let gain = g * (1.0 + TREMULANT_GAIN_DEPTH * m);
                let delay = TREMULANT_DELAY_CENTRE + TREMULANT_DELAY_DEPTH * m;
                delay_l.write(frame.left[i]);
                delay_r.write(frame.right[i]);
                frame.left[i] = delay_l.read(delay) * gain;
                frame.right[i] = delay_r.read(delay) * gain;
            } else {
                frame.left[i] *= g;
                frame.right[i] *= g;
            }
        }

        if self.has_swell {
            let cutoff = swell_cutoff(self.swell.value());
            let [f_l, f_r] = &mut self.swell_filter;
            f_l.set_frequency(cutoff);
            f_r.set_frequency(cutoff);
            f_l.process_block(&mut frame.left);
            f_r.process_block(&mut frame.right);
        }

        self.levels[0].process(&frame.left);
        self.levels[1].process(&frame.right);
    }

    /// Reset the level meters of a division that produced nothing.
    pub fn meter_silence(&self) {
        self.levels[0].process(&[]);
        self.levels[1].process(&[]);
    }

    /// React to a controller change: modulation switches the tremulant on
    /// this division's channels, volume drives the swell on swell channels.
    pub fn handle_control(&mut self, cc: u8, value: u8, channel: u8, swell_channels: u16) {
        match cc {
            CC_MODULATION if self.has_tremulant() && channel_matches(self.params.midi_channels, channel) => {
                self.set_tremulant_enabled(value >= 64);
            }
            CC_VOLUME if self.has_swell && channel_matches(swell_channels, channel) => {
                self.set_swell_gain(value as f32 / 127.0);
            }
            _ => {}
        }
    }

    pub fn capture_state(&self) -> DivisionState {
        DivisionState {
            stops: (0..self.stops.len()).map(|i| self.is_stop_enabled(i)).collect(),
            tremulant: self.is_tremulant_enabled(),
            links: (0..self.links.len()).map(|i| self.is_link_enabled(i)).collect(),
            midi_channels_mask: self.params.midi_channels,
        }
    }

    /// Apply a saved state. Entries beyond this division's stops or links
    /// are ignored; missing ones keep their current value.
    pub fn restore_state(&mut self, state: &DivisionState) {
        for (i, &on) in state.stops.iter().enumerate().take(self.stops.len()) {
            self.enable_stop(i, on);
        }
        for (i, &on) in state.links.iter().enumerate().take(self.links.len()) {
            self.enable_link(i, on);
        }
        self.set_tremulant_enabled(state.tremulant);
        self.params.midi_channels = state.midi_channels_mask;
    }
}

/// Swell low-pass cutoff: closing the box darkens the sound.
pub fn swell_cutoff(gain: f32) -> f32 {
    SWELL_MIN_CUTOFF + SWELL_CUTOFF_RANGE * gain * gain
}

/// Deliver a note-on to division `idx` and along its enabled links.
/// `visited` holds one bit per division and breaks link cycles; callers
/// clear it before each dispatch.
pub fn dispatch_note_on(
    divisions: &mut [Division],
    idx: usize,
    note: u8,
    channel: u8,
    ctx: &mut DivisionContext<'_>,
    visited: &mut u64,
) {
    if idx >= divisions.len() || idx >= 64 || *visited & (1 << idx) != 0 {
        return;
    }
    *visited |= 1 << idx;

    if divisions[idx].note_on(ctx, note, channel) {
        for l in 0..divisions[idx].links.len() {
            if divisions[idx].is_link_enabled(l) {
                let target = divisions[idx].links[l];
                dispatch_note_on(divisions, target, note, 0, ctx, visited);
            }
        }
    }
}

/// See [`dispatch_note_on`]. Keys are cleared along the links first and the
/// linked keys recomputed, so a division still reached by another held key
/// keeps sounding.
pub fn dispatch_note_off(
    divisions: &mut [Division],
    idx: usize,
    note: u8,
    channel: u8,
    ctx: &mut DivisionContext<'_>,
    visited: &mut u64,
) {
    let mut reached = 0;
    clear_keys(divisions, idx, note, channel, visited, &mut reached);
    if reached == 0 {
        return;
    }
    aggregate_link_keys(divisions);
    for (i, d) in divisions.iter_mut().enumerate().take(64) {
        if reached & (1 << i) != 0 {
            d.release_unheld(ctx.pool, note);
        }
    }
}

fn clear_keys(divisions: &mut [Division], idx: usize, note: u8, channel: u8, visited: &mut u64, reached: &mut u64) {
    if idx >= divisions.len() || idx >= 64 || *visited & (1 << idx) != 0 {
        return;
    }
    *visited |= 1 << idx;

    if divisions[idx].clear_key(note, channel) {
        *reached |= 1 << idx;
        for l in 0..divisions[idx].links.len() {
            if divisions[idx].is_link_enabled(l) {
                let target = divisions[idx].links[l];
                clear_keys(divisions, target, note, 0, visited, reached);
            }
        }
    }
}

/// Recompute every division's linked key set: the keys held on, or
/// reaching, any division with an enabled link into it. Iterates to a
/// fixed point, so chains and cycles of links resolve fully.
pub fn aggregate_link_keys(divisions: &mut [Division]) {
    for d in divisions.iter_mut() {
        d.link_keys.clear_all();
    }
    // Each pass can only add keys, and there are at most as many useful
    // passes as divisions.
    for _ in 0..divisions.len() {
        let mut changed = false;
        for src in 0..divisions.len() {
            let reaching = divisions[src].keys.union(divisions[src].link_keys);
            if reaching.is_empty() {
                continue;
            }
            for l in 0..divisions[src].links.len() {
                if !divisions[src].is_link_enabled(l) {
                    continue;
                }
                let target = divisions[src].links[l];
                if let Some(t) = divisions.get_mut(target) {
                    let merged = t.link_keys.union(reaching);
                    if merged != t.link_keys {
                        t.link_keys = merged;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelRegistry, PipeModel};
    use crate::pipewave::PipeEnvelope;
    use crate::scale::Scale;
    use crate::stop::StopType;
    use rand::SeedableRng;
    use std::sync::Arc;

    struct Rig {
        ranks: RankBank,
        pool: VoicePool,
        rng: StdRng,
    }

    impl Rig {
        fn new() -> Self {
            let reg = ModelRegistry::builtin();
            let mut ranks = RankBank::new(5);
            ranks.add(Arc::clone(reg.get("Principal 8").expect("builtin")));
            ranks.add(Arc::clone(reg.get("Gedackt 8").expect("builtin")));
            let mut short = PipeModel::new("Short");
            short.n_vol.reset(-10.0);
            short.h_lev.set_value(0, 4, 0.0);
            ranks.add(Arc::new(short));
            ranks.create_all(&Scale::default(), 440.0);
            ranks.prepare_all(SAMPLE_RATE_F);
            Self {
                ranks,
                pool: VoicePool::new(32),
                rng: StdRng::seed_from_u64(9),
            }
        }

        fn ctx(&mut self) -> DivisionContext<'_> {
            DivisionContext {
                ranks: &self.ranks,
                pool: &mut self.pool,
                rng: &mut self.rng,
            }
        }

        fn stop(&self, name: &str, rank: usize) -> Stop {
            let mut stop = Stop::new(name, StopType::Principal);
            stop.add_zone(&self.ranks, &[rank]);
            stop
        }
    }

    fn division(stops: Vec<Stop>, links: Vec<usize>, channels: u16) -> Division {
        let params = DivisionParams {
            midi_channels: channels,
            ..DivisionParams::default()
        };
        Division::new(
            "Test",
            stops,
            DivisionOptions {
                links,
                params,
                ..DivisionOptions::default()
            },
        )
    }

    fn run(d: &mut Division, rig: &mut Rig, frames: usize) -> f32 {
        let mut peak = 0.0_f32;
        for _ in 0..frames {
            let mut frame = StereoFrame::default();
            d.process(&mut rig.ctx(), &mut frame);
            peak = peak.max(frame.peak());
        }
        peak
    }

    #[test]
    fn key_set_iterates_in_order() {
        let mut k = KeySet::new();
        for n in [127, 0, 60, 61] {
            k.set(n);
        }
        k.clear(61);
        assert_eq!(k.iter().collect::<Vec<_>>(), vec![0, 60, 127]);
        assert_eq!(k.len(), 3);
        assert!(k.contains(127) && !k.contains(61));
    }

    #[test]
    fn single_stop_scenario() {
        let mut rig = Rig::new();
        let mut d = division(vec![rig.stop("Principal", 0)], vec![], 0b1);
        d.enable_stop(0, true);

        assert!(d.note_on(&mut rig.ctx(), 60, 1));
        run(&mut d, &mut rig, 1);
        assert_eq!(d.active_voice_count(), 1);
        let (id, voice) = rig.pool.iter(d.voices()).next().expect("voice");
        assert!(voice.is_for_note(60));

        d.note_off(&mut rig.ctx(), 60, 1);
        run(&mut d, &mut rig, 1);
        assert!(
            matches!(rig.pool.voice(id).state().envelope, PipeEnvelope::Release | PipeEnvelope::Over),
            "voice should be releasing"
        );

        let release_len = rig
            .ranks
            .get(0)
            .and_then(|r| r.pipe(r.active_set(), 60 - r.note_min() as usize))
            .map(|p| p.release_length())
            .expect("pipe");
        run(&mut d, &mut rig, release_len);
        assert_eq!(rig.pool.voice(id).state().envelope, PipeEnvelope::Over);

        // The voice then drains its delays and returns to the pool.
        run(&mut d, &mut rig, 200);
        assert_eq!(d.active_voice_count(), 0);
        assert_eq!(rig.pool.active_count(), 0);
    }

    #[test]
    fn channel_mask_filters_notes() {
        let mut rig = Rig::new();
        let mut d = division(vec![rig.stop("Principal", 0)], vec![], 0b10);
        d.enable_stop(0, true);
        assert!(!d.note_on(&mut rig.ctx(), 60, 1));
        assert_eq!(d.active_voice_count(), 0);
        assert!(d.note_on(&mut rig.ctx(), 60, 2));
        assert_eq!(d.active_voice_count(), 1);
    }

    #[test]
    fn overlapping_stops_sound_once_each() {
        let mut rig = Rig::new();
        let mut d = division(vec![rig.stop("Principal", 0), rig.stop("Gedackt", 1)], vec![], 0xFFFF);
        d.enable_stop(0, true);
        d.enable_stop(1, true);

        d.note_on(&mut rig.ctx(), 60, 1);
        d.note_on(&mut rig.ctx(), 60, 1);
        run(&mut d, &mut rig, 3);
        d.note_on(&mut rig.ctx(), 60, 1);
        assert_eq!(d.active_voice_count(), 2);
    }

    #[test]
    fn enabling_a_stop_while_holding_sounds_it() {
        let mut rig = Rig::new();
        let mut d = division(vec![rig.stop("Principal", 0)], vec![], 0xFFFF);
        d.note_on(&mut rig.ctx(), 62, 1);
        run(&mut d, &mut rig, 1);
        assert_eq!(d.active_voice_count(), 0);

        d.enable_stop(0, true);
        run(&mut d, &mut rig, 1);
        assert_eq!(d.active_voice_count(), 1);
    }

    #[test]
    fn disabling_a_stop_releases_smoothly() {
        let mut rig = Rig::new();
        let mut d = division(vec![rig.stop("Short", 2)], vec![], 0xFFFF);
        d.enable_stop(0, true);
        d.note_on(&mut rig.ctx(), 69, 1);

        // Largest sample-to-sample step of the steady tone.
        let mut prev = 0.0_f32;
        let mut steady_step = 0.0_f32;
        for i in 0..300 {
            let mut frame = StereoFrame::default();
            d.process(&mut rig.ctx(), &mut frame);
            if i >= 200 {
                for &x in frame.left.iter() {
                    steady_step = steady_step.max((x - prev).abs());
                    prev = x;
                }
            }
            prev = frame.left[SUB_FRAME_LENGTH - 1];
        }
        assert!(steady_step > 0.0);

        d.enable_stop(0, false);
        let mut frames = 0;
        let mut last_peak = 1.0;
        while d.active_voice_count() > 0 {
            let mut frame = StereoFrame::default();
            d.process(&mut rig.ctx(), &mut frame);
            for &x in frame.left.iter() {
                let step = (x - prev).abs();
                assert!(step <= 1.5 * steady_step, "release jumped by {step}, steady {steady_step}");
                prev = x;
            }
            last_peak = frame.peak();
            frames += 1;
            assert!(frames < 2000, "voice never finished");
        }
        assert!(frames > 1, "release should not cut the sound");
        assert!(last_peak < 1e-3, "got {last_peak}");
    }

    #[test]
    fn links_forward_without_holding_keys() {
        let mut rig = Rig::new();
        let a = division(vec![rig.stop("Principal", 0)], vec![1], 0b01);
        let b = division(vec![rig.stop("Gedackt", 1)], vec![], 0b10);
        let mut divisions = vec![a, b];
        divisions[0].enable_link(0, true);
        divisions[1].enable_stop(0, true);

        let mut visited = 0;
        dispatch_note_on(&mut divisions, 0, 60, 1, &mut rig.ctx(), &mut visited);
        let mut visited = 0;
        dispatch_note_on(&mut divisions, 1, 60, 1, &mut rig.ctx(), &mut visited);

        assert_eq!(divisions[1].active_voice_count(), 1);
        assert!(!divisions[1].keys().contains(60), "forwarded note must not set the key");
        assert!(divisions[0].keys().contains(60));

        // The forwarded note stays held through the aggregated link keys.
        aggregate_link_keys(&mut divisions);
        assert!(divisions[1].link_keys().contains(60));
        let mut frame = StereoFrame::default();
        divisions[1].process(&mut rig.ctx(), &mut frame);
        assert_eq!(divisions[1].active_voice_count(), 1);

        let mut visited = 0;
        dispatch_note_off(&mut divisions, 0, 60, 1, &mut rig.ctx(), &mut visited);
        let voice = rig.pool.iter(divisions[1].voices()).next().map(|(_, v)| v.is_releasing());
        assert_eq!(voice, Some(true));
    }

    #[test]
    fn coupled_note_held_by_another_source_keeps_sounding() {
        let mut rig = Rig::new();
        let mut divisions = vec![
            division(vec![rig.stop("Principal", 0)], vec![2], 0b001),
            division(vec![rig.stop("Gedackt", 1)], vec![2], 0b010),
            division(vec![rig.stop("Flute", 1)], vec![], 0b100),
        ];
        divisions[0].enable_link(0, true);
        divisions[1].enable_link(0, true);
        divisions[2].enable_stop(0, true);

        for channel in [1, 2] {
            for idx in 0..divisions.len() {
                let mut visited = 0;
                dispatch_note_on(&mut divisions, idx, 60, channel, &mut rig.ctx(), &mut visited);
            }
        }
        aggregate_link_keys(&mut divisions);
        assert_eq!(divisions[2].active_voice_count(), 1);

        let releasing = |divisions: &[Division], rig: &Rig| {
            rig.pool.iter(divisions[2].voices()).map(|(_, v)| v.is_releasing()).collect::<Vec<_>>()
        };

        let mut visited = 0;
        dispatch_note_off(&mut divisions, 0, 60, 1, &mut rig.ctx(), &mut visited);
        assert_eq!(releasing(&divisions, &rig), vec![false], "still coupled from division 1");

        let mut visited = 0;
        dispatch_note_off(&mut divisions, 1, 60, 2, &mut rig.ctx(), &mut visited);
        assert_eq!(releasing(&divisions, &rig), vec![true]);
    }

    #[test]
    fn link_cycles_terminate() {
        let mut rig = Rig::new();
        let mut divisions = vec![
            division(vec![rig.stop("Principal", 0)], vec![1], 0b1),
            division(vec![rig.stop("Gedackt", 1)], vec![2], 0b10),
            division(vec![rig.stop("Short", 2)], vec![0], 0b100),
        ];
        for d in divisions.iter_mut() {
            d.enable_link(0, true);
            d.enable_stop(0, true);
        }

        let mut visited = 0;
        dispatch_note_on(&mut divisions, 0, 64, 1, &mut rig.ctx(), &mut visited);
        assert_eq!(visited, 0b111);
        assert!(divisions.iter().all(|d| d.active_voice_count() == 1));

        aggregate_link_keys(&mut divisions);
        assert!(divisions[0].link_keys().contains(64), "cycle feeds back into the source");
        assert!(divisions[2].link_keys().contains(64));
    }

    #[test]
    fn disabled_link_stops_aggregation() {
        let mut rig = Rig::new();
        let mut divisions = vec![
            division(vec![rig.stop("Principal", 0)], vec![1], 0b1),
            division(vec![rig.stop("Gedackt", 1)], vec![], 0b10),
        ];
        divisions[0].note_on(&mut rig.ctx(), 50, 1);
        aggregate_link_keys(&mut divisions);
        assert!(divisions[1].link_keys().is_empty());
        divisions[0].enable_link(0, true);
        aggregate_link_keys(&mut divisions);
        assert!(divisions[1].link_keys().contains(50));
    }

    #[test]
    fn state_round_trip() {
        let rig = Rig::new();
        let mut d = Division::new(
            "Swell",
            vec![rig.stop("a", 0), rig.stop("b", 1), rig.stop("c", 2)],
            DivisionOptions {
                links: vec![0],
                tremulant: Some(1.0),
                ..DivisionOptions::default()
            },
        );
        d.enable_stop(0, true);
        d.enable_stop(2, true);
        d.set_tremulant_enabled(true);
        let saved = d.capture_state();

        let mut other = d.clone();
        other.disable_all_stops();
        other.set_tremulant_enabled(false);
        other.restore_state(&saved);
        for i in 0..3 {
            assert_eq!(other.is_stop_enabled(i), d.is_stop_enabled(i), "stop {i}");
        }
        assert_eq!(other.is_tremulant_enabled(), d.is_tremulant_enabled());
        assert_eq!(other.capture_state(), saved);
    }

    #[test]
    fn controllers_drive_tremulant_and_swell() {
        let rig = Rig::new();
        let mut d = Division::new(
            "Swell",
            vec![rig.stop("a", 0)],
            DivisionOptions {
                tremulant: Some(1.0),
                swell: true,
                ..DivisionOptions::default()
            },
        );
        d.handle_control(CC_MODULATION, 127, 1, 0xFFFF);
        assert!(d.is_tremulant_enabled());
        d.handle_control(CC_MODULATION, 0, 1, 0xFFFF);
        assert!(!d.is_tremulant_enabled());
        d.handle_control(CC_VOLUME, 0, 3, 0b1);
        assert_eq!(d.swell_gain(), 1.0, "channel 3 is not a swell channel");
        d.handle_control(CC_VOLUME, 0, 1, 0b1);
        assert_eq!(d.swell_gain(), 0.0);
    }

    #[test]
    fn deep_tremulant_stays_inside_its_delay_line() {
        let rig = Rig::new();
        let d = Division::new(
            "Swell",
            vec![rig.stop("a", 0)],
            DivisionOptions {
                tremulant: Some(3.0),
                ..DivisionOptions::default()
            },
        );
        assert_eq!(d.tremulant_depth, Some(TREMULANT_MAX_DEPTH));
        let longest = TREMULANT_DELAY_CENTRE + TREMULANT_DELAY_DEPTH * TREMULANT_MAX_DEPTH;
        assert!(longest + 2.0 <= TREMULANT_DELAY_LENGTH as f32);
    }

    #[test]
    fn closed_swell_darkens_and_attenuates() {
        assert_eq!(swell_cutoff(0.0), 250.0);
        assert_eq!(swell_cutoff(1.0), 16000.0);

        let rig = Rig::new();
        let mut d = Division::new(
            "Swell",
            vec![rig.stop("a", 0)],
            DivisionOptions {
                swell: true,
                ..DivisionOptions::default()
            },
        );
        d.set_swell_gain(0.0);
        let tremulant = [0.0; SUB_FRAME_LENGTH];
        let mut last = 1.0;
        for _ in 0..100 {
            let mut frame = StereoFrame::default();
            frame.left.fill(1.0);
            frame.right.fill(1.0);
            d.modulate(&mut frame, &tremulant);
            last = frame.peak();
        }
        assert!(last < 0.01, "got {last}");
    }

    #[test]
    fn available_range_spans_stops() {
        let rig = Rig::new();
        let mut treble = Stop::new("Treble", StopType::Flute);
        treble.add_zone_with_range(60, 100, vec![0]);
        let d = division(vec![rig.stop("a", 0), treble], vec![], 0xFFFF);
        assert_eq!(d.available_range(), Some((36, 100)));
        assert_eq!(division(vec![], vec![], 0xFFFF).available_range(), None);
    }
}
