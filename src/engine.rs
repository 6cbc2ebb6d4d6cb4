//! Organ engine: owns the ranks, divisions, voice pool and sequencer, turns
//! MIDI into division events and renders stereo audio at the host rate.
//!
//! Audio is produced in 64-sample sub-frames at the internal rate, resampled
//! to the host rate, then passed through the reverb, master volume and
//! limiter.

use std::f32::consts::TAU;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::{EngineSettings, KeySwitch, OrganConfig, PipeNames, StopConfig, clamp_tuning};
use crate::consts::{
    CC_ALL_NOTES_OFF, CC_MODULATION, CC_REVERB, CC_STOP_BUTTONS, MAX_RANK, SAMPLE_RATE_F, SUB_FRAME_LENGTH,
    TREMULANT_LEVEL, TREMULANT_PHASE_INCREMENT, VOLUME_GAIN,
};
use crate::controls::{ControlReceiver, DivisionParams, OrganController, channel_matches};
use crate::division::{Division, DivisionContext, DivisionOptions, aggregate_link_keys, dispatch_note_off, dispatch_note_on};
use crate::dsp::convolver::{Convolver, ImpulseResponse};
use crate::dsp::interpolator::Interpolator;
use crate::dsp::limiter::Limiter;
use crate::dsp::mixer::{LevelMeter, StereoFrame};
use crate::error::{OrganError, StateError};
use crate::model::ModelRegistry;
use crate::param::AudioParameter;
use crate::rankwave::RankBank;
use crate::scale::{Scale, Temperament};
use crate::sequencer::Sequencer;
use crate::state::{EngineState, TuningState};
use crate::stop::Stop;
use crate::voice::VoicePool;

const VOLUME_SMOOTHING: f32 = 0.005;

/// A decoded channel message. Channels are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
}

impl MidiMessage {
    /// Decode a raw message. System and unsupported messages give `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status, data) = bytes.split_first()?;
        let channel = (status & 0x0F) + 1;
        let byte = |i: usize| data.get(i).map(|b| b & 0x7F);
        match status & 0xF0 {
            0x80 => Some(MidiMessage::NoteOff { channel, note: byte(0)? }),
            0x90 => Some(MidiMessage::NoteOn {
                channel,
                note: byte(0)?,
                velocity: byte(1)?,
            }),
            0xB0 => Some(MidiMessage::ControlChange {
                channel,
                controller: byte(0)?,
                value: byte(1)?,
            }),
            0xC0 => Some(MidiMessage::ProgramChange { channel, program: byte(0)? }),
            _ => None,
        }
    }
}

/// What the button byte of a stop control sequence does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopControlMode {
    Disabled,
    SetOff,
    SetOn,
    Toggle,
}

impl StopControlMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => StopControlMode::Disabled,
            1 => StopControlMode::SetOff,
            2 => StopControlMode::SetOn,
            _ => StopControlMode::Toggle,
        }
    }
}

pub struct Engine {
    ranks: RankBank,
    divisions: Vec<Division>,
    pool: VoicePool,
    rng: StdRng,
    sequencer: Sequencer,
    controls: Option<ControlReceiver>,

    backward_keys: Vec<u8>,
    forward_keys: Vec<u8>,
    midi_ctrl_channels: u16,
    midi_swell_channels: u16,
    stop_control: Option<(StopControlMode, usize)>,

    scale: Scale,
    tuning: f32,
    ir_name: Option<String>,

    tremulant: [f32; SUB_FRAME_LENGTH],
    tremulant_phase: f32,
    sub_frame: StereoFrame,
    division_frame: StereoFrame,
    sub_frame_pos: usize,
    rendered_frames: u64,

    sample_rate: f32,
    interpolator: Interpolator,
    convolver: Convolver,
    reverb_wet: f32,
    reverb_tail: usize,
    volume: AudioParameter,
    limiters: [Limiter; 2],
    levels: [LevelMeter; 2],
}

impl Engine {
    /// Build an organ. Wavetables are not generated until
    /// [`prepare_to_play`](Self::prepare_to_play).
    pub fn new(config: &OrganConfig, registry: &ModelRegistry, settings: &EngineSettings) -> Result<Self, OrganError> {
        config.validate(registry)?;

        let mut ranks = RankBank::new(settings.seed);
        let mut divisions = Vec::with_capacity(config.divisions.len());
        for dc in &config.divisions {
            let mut params = DivisionParams {
                midi_channels: dc.midi_channels,
                ..DivisionParams::default()
            };
            let mut stops = Vec::with_capacity(dc.stops.len());
            for (i, sc) in dc.stops.iter().enumerate() {
                stops.push(build_stop(sc, registry, &mut ranks));
                params.enable_stop(i, sc.enabled);
            }
            let options = DivisionOptions {
                links: dc.links.iter().filter_map(|t| config.division_index(t)).collect(),
                tremulant: dc.tremulant.map(|t| t.depth),
                swell: dc.swell,
                gain: dc.gain,
                params,
            };
            divisions.push(Division::new(dc.name.clone(), stops, options));
        }

        let scale = Scale::new(settings.temperament);
        let tuning = settings.clamped_tuning();
        ranks.create_all(&scale, tuning);

        let layout: Vec<usize> = divisions.iter().map(Division::stop_count).collect();
        let sequencer = Sequencer::new(settings.sequencer_steps, &layout);

        let keys = |k: &Option<KeySwitch>| k.as_ref().map(KeySwitch::notes).unwrap_or_default();

        info!(
            "organ ready: {} divisions, {} stops, {} ranks, {} voices",
            divisions.len(),
            layout.iter().sum::<usize>(),
            ranks.len(),
            settings.max_voices
        );

        let mut engine = Self {
            ranks,
            divisions,
            pool: VoicePool::new(settings.max_voices),
            rng: StdRng::seed_from_u64(settings.seed),
            sequencer,
            controls: None,
            backward_keys: keys(&config.sequencer.backward_key),
            forward_keys: keys(&config.sequencer.forward_key),
            midi_ctrl_channels: settings.midi_ctrl_channels,
            midi_swell_channels: settings.midi_swell_channels,
            stop_control: None,
            scale,
            tuning,
            ir_name: None,
            tremulant: [0.0; SUB_FRAME_LENGTH],
            tremulant_phase: 0.0,
            sub_frame: StereoFrame::default(),
            division_frame: StereoFrame::default(),
            sub_frame_pos: SUB_FRAME_LENGTH,
            rendered_frames: 0,
            sample_rate: SAMPLE_RATE_F,
            interpolator: Interpolator::default(),
            convolver: Convolver::new(),
            reverb_wet: settings.reverb_wet.clamp(0.0, 1.0),
            reverb_tail: 0,
            volume: AudioParameter::new(settings.volume, 0.0, 1.0, VOLUME_SMOOTHING),
            limiters: [Limiter::new(SAMPLE_RATE_F), Limiter::new(SAMPLE_RATE_F)],
            levels: [LevelMeter::new(), LevelMeter::new()],
        };
        engine.configure_output(SAMPLE_RATE_F);
        Ok(engine)
    }

    /// Generate every wavetable and set up the output chain for the host
    /// sample rate. Must not run concurrently with [`process`](Self::process).
    pub fn prepare_to_play(&mut self, sample_rate: f32) {
        self.ranks.prepare_all(SAMPLE_RATE_F);
        self.configure_output(sample_rate);
        info!("prepared for {sample_rate} Hz");
    }

    fn configure_output(&mut self, sample_rate: f32) {
        let sample_rate = sample_rate.max(1.0);
        self.sample_rate = sample_rate;
        self.limiters = [Limiter::new(sample_rate), Limiter::new(sample_rate)];
        self.convolver.set_dry_wet(1.0, self.reverb_wet, true);
        self.convolver.reset();
        self.reverb_tail = 0;
        self.interpolator.set_ratio(SAMPLE_RATE_F / sample_rate);
        self.interpolator.reset();
        self.sub_frame_pos = SUB_FRAME_LENGTH;
    }

    /// Create the control handle for another thread. Any earlier handle
    /// stops reaching the engine.
    pub fn controller(&mut self) -> OrganController {
        let params = self.divisions.iter().map(|d| *d.params()).collect();
        let counts = self.divisions.iter().map(Division::stop_count).collect();
        let (controller, receiver) = OrganController::new(params, counts);
        self.controls = Some(receiver);
        controller
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn divisions(&self) -> &[Division] {
        &self.divisions
    }

    pub fn division(&self, index: usize) -> Option<&Division> {
        self.divisions.get(index)
    }

    pub fn division_index(&self, name: &str) -> Option<usize> {
        self.divisions.iter().position(|d| d.name() == name)
    }

    pub fn ranks(&self) -> &RankBank {
        &self.ranks
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn active_voice_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Lowest and highest note any division responds to.
    pub fn keyboard_range(&self) -> Option<(u8, u8)> {
        self.divisions
            .iter()
            .filter_map(Division::available_range)
            .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)))
    }

    pub fn backward_keys(&self) -> &[u8] {
        &self.backward_keys
    }

    pub fn forward_keys(&self) -> &[u8] {
        &self.forward_keys
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Frames rendered at the internal rate since the engine was built.
    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames
    }

    pub fn levels(&self) -> &[LevelMeter; 2] {
        &self.levels
    }

    pub fn tuning(&self) -> (f32, Temperament) {
        (self.tuning, self.scale.temperament())
    }

    // ── Registration ────────────────────────────────────────

    pub fn enable_stop(&mut self, division: usize, stop: usize, enable: bool) {
        if let Some(d) = self.divisions.get_mut(division) {
            d.enable_stop(stop, enable);
            self.sequencer.set_dirty(true);
        }
    }

    pub fn is_stop_enabled(&self, division: usize, stop: usize) -> bool {
        self.divisions.get(division).is_some_and(|d| d.is_stop_enabled(stop))
    }

    pub fn set_tremulant_enabled(&mut self, division: usize, enable: bool) {
        if let Some(d) = self.divisions.get_mut(division) {
            d.set_tremulant_enabled(enable);
            self.sequencer.set_dirty(true);
        }
    }

    pub fn enable_link(&mut self, division: usize, link: usize, enable: bool) {
        if let Some(d) = self.divisions.get_mut(division) {
            d.enable_link(link, enable);
        }
    }

    pub fn set_midi_channels_mask(&mut self, division: usize, mask: u16) {
        if let Some(d) = self.divisions.get_mut(division) {
            d.set_midi_channels_mask(mask);
        }
    }

    pub fn set_swell(&mut self, division: usize, gain: f32) {
        if let Some(d) = self.divisions.get_mut(division) {
            d.set_swell_gain(gain);
        }
    }

    pub fn set_midi_ctrl_channels_mask(&mut self, mask: u16) {
        self.midi_ctrl_channels = mask;
    }

    pub fn midi_ctrl_channels_mask(&self) -> u16 {
        self.midi_ctrl_channels
    }

    pub fn set_midi_swell_channels_mask(&mut self, mask: u16) {
        self.midi_swell_channels = mask;
    }

    pub fn midi_swell_channels_mask(&self) -> u16 {
        self.midi_swell_channels
    }

    pub fn set_sequencer_step(&mut self, index: usize) -> bool {
        self.sequencer.set_step(index, true, &mut self.divisions)
    }

    pub fn step_forward(&mut self) -> bool {
        self.sequencer.step_forward(&mut self.divisions)
    }

    pub fn step_backward(&mut self) -> bool {
        self.sequencer.step_backward(&mut self.divisions)
    }

    /// Store the current registration into the current step.
    pub fn capture_step(&mut self) {
        self.sequencer.capture(&self.divisions);
    }

    // ── Output settings ─────────────────────────────────────

    pub fn set_volume(&mut self, volume: f32) {
        self.volume.set_value(volume, false);
    }

    pub fn volume(&self) -> f32 {
        self.volume.target()
    }

    pub fn set_reverb_wet(&mut self, wet: f32) {
        self.reverb_wet = wet.clamp(0.0, 1.0);
        self.convolver.set_wet(self.reverb_wet);
    }

    pub fn reverb_wet(&self) -> f32 {
        self.reverb_wet
    }

    /// Offline rendering computes every reverb partition inline.
    pub fn set_non_realtime(&mut self, non_realtime: bool) {
        self.convolver.set_non_realtime(non_realtime);
    }

    pub fn set_impulse_response(&mut self, ir: &ImpulseResponse, name: Option<String>) {
        self.convolver.set_impulse_response(ir);
        self.convolver.set_dry_wet(1.0, self.reverb_wet, true);
        self.reverb_tail = 0;
        self.ir_name = name;
    }

    pub fn load_impulse_response(&mut self, path: &Path) -> Result<(), OrganError> {
        let ir = ImpulseResponse::from_wav_file(path)?;
        self.set_impulse_response(&ir, Some(path.display().to_string()));
        Ok(())
    }

    pub fn clear_impulse_response(&mut self) {
        self.set_impulse_response(&ImpulseResponse::default(), None);
    }

    pub fn impulse_response_name(&self) -> Option<&str> {
        self.ir_name.as_deref()
    }

    /// Retune every rank and rebuild its wavetables. Pipes already sounding
    /// keep the tables they started with until those are replaced.
    pub fn set_tuning(&mut self, frequency: f32, temperament: Temperament) {
        let frequency = clamp_tuning(frequency);
        if frequency == self.tuning && temperament == self.scale.temperament() {
            return;
        }
        self.tuning = frequency;
        self.scale.set_temperament(temperament);
        self.ranks.retune_all(&self.scale, frequency);
        self.ranks.prepare_all(SAMPLE_RATE_F);
    }

    // ── Events ──────────────────────────────────────────────

    fn is_ctrl_channel(&self, channel: u8) -> bool {
        channel != 0 && channel_matches(self.midi_ctrl_channels, channel)
    }

    /// Start a note. On control channels the sequencer's key switches are
    /// handled first and never sound.
    pub fn note_on(&mut self, note: u8, channel: u8) {
        if self.is_ctrl_channel(channel) {
            if self.backward_keys.contains(&note) {
                self.sequencer.step_backward(&mut self.divisions);
                return;
            }
            if self.forward_keys.contains(&note) {
                self.sequencer.step_forward(&mut self.divisions);
                return;
            }
        }

        let mut ctx = DivisionContext {
            ranks: &self.ranks,
            pool: &mut self.pool,
            rng: &mut self.rng,
        };
        for idx in 0..self.divisions.len() {
            let mut visited = 0;
            dispatch_note_on(&mut self.divisions, idx, note, channel, &mut ctx, &mut visited);
        }
    }

    pub fn note_off(&mut self, note: u8, channel: u8) {
        if self.is_ctrl_channel(channel) && (self.backward_keys.contains(&note) || self.forward_keys.contains(&note)) {
            return;
        }

        let mut ctx = DivisionContext {
            ranks: &self.ranks,
            pool: &mut self.pool,
            rng: &mut self.rng,
        };
        for idx in 0..self.divisions.len() {
            let mut visited = 0;
            dispatch_note_off(&mut self.divisions, idx, note, channel, &mut ctx, &mut visited);
        }
    }

    pub fn all_notes_off(&mut self) {
        let mut ctx = DivisionContext {
            ranks: &self.ranks,
            pool: &mut self.pool,
            rng: &mut self.rng,
        };
        for d in self.divisions.iter_mut() {
            d.all_notes_off(&mut ctx);
        }
    }

    pub fn handle_midi(&mut self, message: MidiMessage) {
        match message {
            MidiMessage::NoteOn { channel, note, velocity } if velocity > 0 => self.note_on(note, channel),
            MidiMessage::NoteOn { channel, note, .. } | MidiMessage::NoteOff { channel, note } => {
                self.note_off(note, channel)
            }
            MidiMessage::ProgramChange { channel, program } => {
                if self.is_ctrl_channel(channel) {
                    self.sequencer.set_step(program as usize, true, &mut self.divisions);
                }
            }
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => self.handle_control(controller, value, channel),
        }
    }

    fn handle_control(&mut self, cc: u8, value: u8, channel: u8) {
        let ctrl = self.is_ctrl_channel(channel);
        match cc {
            CC_REVERB if ctrl => self.set_reverb_wet(value as f32 / 127.0),
            CC_STOP_BUTTONS if ctrl => self.handle_stop_control(value),
            CC_ALL_NOTES_OFF => self.all_notes_off(),
            _ => {
                for d in self.divisions.iter_mut() {
                    d.handle_control(cc, value, channel, self.midi_swell_channels);
                }
                if cc == CC_MODULATION {
                    self.sequencer.set_dirty(true);
                }
            }
        }
    }

    /// Stop control sequence: a mode byte `01mm0ggg` picks the mode and the
    /// division, then any number of button bytes `000bbbbb` apply it.
    /// Mode 0 clears the division at once. Any other byte ends the sequence.
    fn handle_stop_control(&mut self, value: u8) {
        if value & 0xC8 == 0x40 {
            let group = (value & 0x07) as usize;
            match StopControlMode::from_bits(value >> 4) {
                StopControlMode::Disabled => {
                    if let Some(d) = self.divisions.get_mut(group) {
                        d.disable_all_stops();
                        self.sequencer.set_dirty(true);
                    }
                    self.stop_control = None;
                }
                mode => self.stop_control = Some((mode, group)),
            }
        } else if value & 0xE0 == 0 {
            let Some((mode, group)) = self.stop_control else {
                return;
            };
            let button = (value & 0x1F) as usize;
            let Some(d) = self.divisions.get_mut(group) else {
                return;
            };
            if button >= d.stop_count() {
                return;
            }
            let enable = match mode {
                StopControlMode::SetOn => true,
                StopControlMode::Toggle => !d.is_stop_enabled(button),
                StopControlMode::SetOff | StopControlMode::Disabled => false,
            };
            d.enable_stop(button, enable);
            self.sequencer.set_dirty(true);
        } else {
            self.stop_control = None;
        }
    }

    fn apply_controls(&mut self) {
        let Some(mut controls) = self.controls.take() else {
            return;
        };
        while let Some(update) = controls.pop_update() {
            if let Some(d) = self.divisions.get_mut(update.division()) {
                let before = (d.params().stops, d.is_tremulant_enabled());
                d.apply_update(&update);
                if before != (d.params().stops, d.is_tremulant_enabled()) {
                    self.sequencer.set_dirty(true);
                }
            }
        }
        while let Some(event) = controls.pop_note() {
            if event.on {
                self.note_on(event.note, event.channel);
            } else {
                self.note_off(event.note, event.channel);
            }
        }
        self.controls = Some(controls);
    }

    // ── Audio ───────────────────────────────────────────────

    /// Render one internal sub-frame into `sub_frame`. Returns whether any
    /// division had voices.
    fn process_sub_frame(&mut self) -> bool {
        for t in self.tremulant.iter_mut() {
            *t = TREMULANT_LEVEL * self.tremulant_phase.sin();
            self.tremulant_phase += TREMULANT_PHASE_INCREMENT;
            if self.tremulant_phase > TAU {
                self.tremulant_phase -= TAU;
            }
        }

        aggregate_link_keys(&mut self.divisions);

        self.sub_frame.clear();
        let mut ctx = DivisionContext {
            ranks: &self.ranks,
            pool: &mut self.pool,
            rng: &mut self.rng,
        };
        let mut sounding = false;
        for d in self.divisions.iter_mut() {
            self.division_frame.clear();
            if d.process(&mut ctx, &mut self.division_frame) {
                d.modulate(&mut self.division_frame, &self.tremulant);
                self.sub_frame.add(&self.division_frame);
                sounding = true;
            } else {
                d.meter_silence();
            }
        }
        self.rendered_frames += SUB_FRAME_LENGTH as u64;
        sounding
    }

    /// Fill both buffers with the next block at the host rate. Pending
    /// control updates and note events are applied first.
    pub fn process(&mut self, out_l: &mut [f32], out_r: &mut [f32]) {
        self.apply_controls();

        let n = out_l.len().min(out_r.len());
        let (out_l, out_r) = (&mut out_l[..n], &mut out_r[..n]);

        let mut generated = false;
        for i in 0..n {
            while self.interpolator.can_write() {
                if self.sub_frame_pos == SUB_FRAME_LENGTH {
                    generated |= self.process_sub_frame();
                    self.sub_frame_pos = 0;
                }
                let p = self.sub_frame_pos;
                self.interpolator.write(self.sub_frame.left[p], self.sub_frame.right[p]);
                self.sub_frame_pos += 1;
            }
            let (l, r) = self.interpolator.read().unwrap_or((0.0, 0.0));
            out_l[i] = l;
            out_r[i] = r;
        }

        if generated {
            self.reverb_tail = self.convolver.length();
        } else {
            self.reverb_tail = self.reverb_tail.saturating_sub(n);
        }
        if self.reverb_tail > 0 && self.convolver.is_audible() {
            self.convolver.process_in_place(out_l, out_r);
        }

        for i in 0..n {
            let gain = self.volume.next_value() * VOLUME_GAIN;
            out_l[i] *= gain;
            out_r[i] *= gain;
        }

        self.limiters[0].process_block(out_l);
        self.limiters[1].process_block(out_r);
        self.levels[0].process(out_l);
        self.levels[1].process(out_r);
    }

    // ── State ───────────────────────────────────────────────

    pub fn capture_state(&self) -> EngineState {
        EngineState {
            midi_ctrl_channels_mask: self.midi_ctrl_channels,
            midi_swell_channels_mask: self.midi_swell_channels,
            ir: self.ir_name.clone(),
            tuning: TuningState {
                frequency: self.tuning,
                temperament: self.scale.temperament(),
            },
            divisions: self.divisions.iter().map(Division::capture_state).collect(),
            sequencer: self.sequencer.capture_state(),
        }
    }

    /// Apply a saved state. A state saved from an organ with a different
    /// number of divisions is rejected and nothing changes. An impulse
    /// response that cannot be loaded is skipped with a warning.
    pub fn restore_state(&mut self, state: &EngineState) -> Result<(), OrganError> {
        if state.divisions.len() != self.divisions.len() {
            warn!(
                "state has {} divisions, organ has {}; ignored",
                state.divisions.len(),
                self.divisions.len()
            );
            return Err(StateError::DivisionCountMismatch {
                expected: self.divisions.len(),
                found: state.divisions.len(),
            }
            .into());
        }

        self.midi_ctrl_channels = state.midi_ctrl_channels_mask;
        self.midi_swell_channels = state.midi_swell_channels_mask;
        for (d, s) in self.divisions.iter_mut().zip(&state.divisions) {
            d.restore_state(s);
        }
        self.set_tuning(state.tuning.frequency, state.tuning.temperament);

        if state.ir != self.ir_name {
            match &state.ir {
                Some(path) => {
                    if let Err(e) = self.load_impulse_response(Path::new(path)) {
                        warn!("impulse response '{path}' not loaded: {e}");
                    }
                }
                None => self.clear_impulse_response(),
            }
        }

        self.sequencer.restore_state(&state.sequencer, &mut self.divisions);
        Ok(())
    }
}

fn build_stop(config: &StopConfig, registry: &ModelRegistry, ranks: &mut RankBank) -> Stop {
    let mut stop = Stop::new(config.name.clone(), config.stop_type());
    stop.gain = config.gain;
    stop.chiff_gain = config.chiff;

    let rank_ids = |pipes: &PipeNames, ranks: &mut RankBank| -> Vec<usize> {
        let mut ids: Vec<usize> = pipes
            .names()
            .filter_map(|name| registry.get(name))
            .map(|model| ranks.add(Arc::clone(model)))
            .collect();
        if ids.len() > MAX_RANK {
            warn!("stop '{}' combines {} ranks, only {MAX_RANK} are used", config.name, ids.len());
            ids.truncate(MAX_RANK);
        }
        ids
    };

    if let Some(pipe) = &config.pipe {
        let ids = rank_ids(pipe, ranks);
        stop.add_zone(ranks, &ids);
    }
    for zone in &config.zones {
        let ids = rank_ids(&zone.pipe, ranks);
        stop.add_zone_with_range(zone.range[0], zone.range[1], ids);
    }
    stop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequencerConfig;

    const GREAT: usize = 0;
    const SWELL: usize = 1;

    fn settings() -> EngineSettings {
        EngineSettings {
            max_voices: 64,
            ..EngineSettings::default()
        }
    }

    fn engine() -> Engine {
        Engine::new(&OrganConfig::default_organ(), &ModelRegistry::builtin(), &settings()).expect("engine")
    }

    fn render(engine: &mut Engine, frames: usize) -> f32 {
        let mut l = vec![0.0; 512];
        let mut r = vec![0.0; 512];
        let mut peak = 0.0_f32;
        let mut left = frames;
        while left > 0 {
            let n = left.min(512);
            engine.process(&mut l[..n], &mut r[..n]);
            for (&a, &b) in l[..n].iter().zip(&r[..n]) {
                assert!(a.is_finite() && b.is_finite());
                peak = peak.max(a.abs()).max(b.abs());
            }
            left -= n;
        }
        peak
    }

    #[test]
    fn builds_the_default_organ() {
        let e = engine();
        assert_eq!(e.divisions().len(), 3);
        assert_eq!(e.division_index("Pedal"), Some(2));
        assert!(e.is_stop_enabled(GREAT, 0));
        assert!(!e.is_stop_enabled(GREAT, 1));
        assert_eq!(e.divisions()[GREAT].links(), &[SWELL]);
        assert_eq!(e.keyboard_range(), Some((36, 96)));
        // Principal 8 is shared by the Great and the Pedal.
        assert_eq!(e.ranks().len(), 11);
    }

    #[test]
    fn rejects_unknown_pipes() {
        let mut organ = OrganConfig::default_organ();
        organ.divisions[0].stops[0].pipe = Some(PipeNames::One("Nope".into()));
        assert!(matches!(
            Engine::new(&organ, &ModelRegistry::builtin(), &settings()),
            Err(OrganError::Config(_))
        ));
    }

    #[test]
    fn decodes_midi_bytes() {
        assert_eq!(
            MidiMessage::from_bytes(&[0x91, 60, 100]),
            Some(MidiMessage::NoteOn { channel: 2, note: 60, velocity: 100 })
        );
        assert_eq!(MidiMessage::from_bytes(&[0x80, 60, 0]), Some(MidiMessage::NoteOff { channel: 1, note: 60 }));
        assert_eq!(
            MidiMessage::from_bytes(&[0xBF, 98, 0x60]),
            Some(MidiMessage::ControlChange { channel: 16, controller: 98, value: 0x60 })
        );
        assert_eq!(MidiMessage::from_bytes(&[0xC0, 3]), Some(MidiMessage::ProgramChange { channel: 1, program: 3 }));
        assert_eq!(MidiMessage::from_bytes(&[0x90, 60]), None);
        assert_eq!(MidiMessage::from_bytes(&[0xF8]), None);
    }

    #[test]
    fn single_note_sounds_and_dies_away() {
        let mut e = engine();
        e.prepare_to_play(44100.0);
        e.note_on(60, 1);
        let peak = render(&mut e, 8192);
        assert!(peak > 0.01, "got {peak}");
        assert_eq!(e.active_voice_count(), 1);
        assert!(e.levels()[0].peak_level() > 0.0);

        e.note_off(60, 1);
        render(&mut e, 44100);
        assert_eq!(e.active_voice_count(), 0);
        let tail = render(&mut e, 1024);
        assert!(tail < 1e-4, "got {tail}");
    }

    #[test]
    fn coupled_division_sounds_through_the_link() {
        let mut e = engine();
        e.prepare_to_play(44100.0);
        e.enable_link(GREAT, 0, true);
        e.note_on(64, 1);
        render(&mut e, 512);
        assert_eq!(e.division(SWELL).map(Division::active_voice_count), Some(1));
        assert!(!e.divisions()[SWELL].keys().contains(64));

        e.note_off(64, 1);
        render(&mut e, 44100);
        assert_eq!(e.active_voice_count(), 0);
    }

    #[test]
    fn resamples_to_the_host_rate() {
        let mut e = engine();
        e.prepare_to_play(48000.0);
        e.note_on(69, 1);
        let peak = render(&mut e, 48000);
        assert!(peak > 0.01);
        let internal = e.rendered_frames() as i64;
        assert!((internal - 44100).abs() <= 2 * SUB_FRAME_LENGTH as i64, "rendered {internal}");
    }

    #[test]
    fn stop_control_sequences() {
        let mut e = engine();
        let cc = |e: &mut Engine, v: u8| {
            e.handle_midi(MidiMessage::ControlChange {
                channel: 1,
                controller: CC_STOP_BUTTONS,
                value: v,
            })
        };

        // Set on, group 0, then buttons 1 and 3.
        cc(&mut e, 0x60);
        cc(&mut e, 0x01);
        cc(&mut e, 0x03);
        assert!(e.is_stop_enabled(GREAT, 1) && e.is_stop_enabled(GREAT, 3));

        // Toggle in the swell.
        cc(&mut e, 0x71);
        cc(&mut e, 0x00);
        assert!(!e.is_stop_enabled(SWELL, 0));

        // A stray byte ends the sequence.
        cc(&mut e, 0x7F);
        cc(&mut e, 0x02);
        assert!(!e.is_stop_enabled(SWELL, 2));

        // Set off.
        cc(&mut e, 0x50);
        cc(&mut e, 0x01);
        assert!(!e.is_stop_enabled(GREAT, 1));
        assert!(e.is_stop_enabled(GREAT, 3));

        // Mode 0 clears the group immediately.
        cc(&mut e, 0x40);
        assert!((0..5).all(|s| !e.is_stop_enabled(GREAT, s)));
        cc(&mut e, 0x02);
        assert!(!e.is_stop_enabled(GREAT, 2), "no mode after a clear");
        assert!(e.sequencer().is_dirty());
    }

    #[test]
    fn key_switches_step_the_sequencer() {
        let mut organ = OrganConfig::default_organ();
        organ.sequencer = SequencerConfig {
            backward_key: Some(KeySwitch::One(21)),
            forward_key: Some(KeySwitch::Many(vec![22, 23])),
        };
        let s = EngineSettings {
            midi_ctrl_channels: 1 << 15,
            ..settings()
        };
        let mut e = Engine::new(&organ, &ModelRegistry::builtin(), &s).expect("engine");

        e.note_on(23, 16);
        assert_eq!(e.sequencer().current_step(), 1);
        // Step 1 is empty.
        assert!(!e.is_stop_enabled(GREAT, 0));
        e.note_on(21, 16);
        assert_eq!(e.sequencer().current_step(), 0);
        assert!(e.is_stop_enabled(GREAT, 0));

        // Not a control channel: an ordinary (out of range) note.
        e.note_on(22, 1);
        assert_eq!(e.sequencer().current_step(), 0);

        e.handle_midi(MidiMessage::ProgramChange { channel: 16, program: 5 });
        assert_eq!(e.sequencer().current_step(), 5);
        e.handle_midi(MidiMessage::ProgramChange { channel: 16, program: 99 });
        assert_eq!(e.sequencer().current_step(), 5);
    }

    #[test]
    fn controllers_reach_divisions() {
        let mut e = engine();
        e.handle_midi(MidiMessage::ControlChange {
            channel: 2,
            controller: CC_MODULATION,
            value: 127,
        });
        assert!(e.divisions()[SWELL].is_tremulant_enabled());
        e.handle_midi(MidiMessage::ControlChange {
            channel: 2,
            controller: 7,
            value: 0,
        });
        assert_eq!(e.divisions()[SWELL].swell_gain(), 0.0);
        e.handle_midi(MidiMessage::ControlChange {
            channel: 1,
            controller: CC_REVERB,
            value: 127,
        });
        assert_eq!(e.reverb_wet(), 1.0);
    }

    #[test]
    fn control_updates_apply_at_the_next_block() {
        let mut e = engine();
        let mut ctl = e.controller();
        assert!(ctl.enable_stop(GREAT, 2, true));
        assert!(ctl.set_tremulant_enabled(SWELL, true));
        assert!(!e.is_stop_enabled(GREAT, 2));

        render(&mut e, 64);
        assert!(e.is_stop_enabled(GREAT, 2));
        assert!(e.divisions()[SWELL].is_tremulant_enabled());
        assert!(e.sequencer().is_dirty());

        ctl.note_on(60, 1);
        render(&mut e, 64);
        assert!(e.divisions()[GREAT].keys().contains(60));
    }

    #[test]
    fn controller_keeps_midi_changes() {
        let mut e = engine();
        e.set_midi_ctrl_channels_mask(0xFFFF);
        let mut ctl = e.controller();

        for v in [0x60, 0x01] {
            e.handle_midi(MidiMessage::ControlChange {
                channel: 16,
                controller: CC_STOP_BUTTONS,
                value: v,
            });
        }
        e.handle_midi(MidiMessage::ControlChange {
            channel: 2,
            controller: 7,
            value: 0,
        });
        assert!(e.is_stop_enabled(GREAT, 1));

        assert!(ctl.set_tremulant_enabled(SWELL, true));
        assert!(ctl.set_swell(GREAT, 0.5));
        assert!(ctl.enable_stop(GREAT, 2, true));
        render(&mut e, 512);

        assert!(e.is_stop_enabled(GREAT, 1), "stop drawn over MIDI is kept");
        assert!(e.is_stop_enabled(GREAT, 2));
        assert!(e.is_stop_enabled(GREAT, 0));
        assert!(e.divisions()[SWELL].is_tremulant_enabled());
        assert_eq!(e.divisions()[SWELL].swell_gain(), 0.0);
        assert_eq!(e.divisions()[GREAT].swell_gain(), 0.5);

        e.set_sequencer_step(3);
        assert!(!e.is_stop_enabled(GREAT, 0));
        assert!(ctl.set_midi_channels_mask(GREAT, 0b11));
        render(&mut e, 64);
        assert!(!e.is_stop_enabled(GREAT, 0), "sequencer recall is kept");
        assert_eq!(e.divisions()[GREAT].midi_channels_mask(), 0b11);
    }

    #[test]
    fn state_round_trip() {
        let mut e = engine();
        e.enable_stop(SWELL, 2, true);
        e.set_tremulant_enabled(SWELL, true);
        e.set_midi_channels_mask(GREAT, 0b1001);
        e.set_midi_swell_channels_mask(0b10);
        e.set_tuning(415.0, Temperament::Vallotti);
        let saved = e.capture_state();

        let json = saved.to_json().expect("serialize");
        let mut other = engine();
        other
            .restore_state(&EngineState::from_json(&json).expect("parse"))
            .expect("restore");
        assert_eq!(other.capture_state(), saved);
        assert_eq!(other.tuning(), (415.0, Temperament::Vallotti));
        assert!(other.is_stop_enabled(SWELL, 2));
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let mut e = engine();
        let mut state = e.capture_state();
        state.divisions.pop();
        state.midi_ctrl_channels_mask = 0;
        let err = e.restore_state(&state);
        assert!(matches!(
            err,
            Err(OrganError::State(StateError::DivisionCountMismatch { expected: 3, found: 2 }))
        ));
        assert_eq!(e.midi_ctrl_channels_mask(), 0xFFFF);
    }
}
