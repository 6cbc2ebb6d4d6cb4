//! Control surface for a running engine.
//!
//! The audio thread never reads shared mutable state. A control thread holds
//! an [`OrganController`] and pushes single-field [`ControlUpdate`]s over an
//! SPSC queue; the engine applies every pending update and note event at the
//! start of the next block. An update touches only its own field, so changes
//! made on the audio thread (MIDI, sequencer steps, state restore) survive
//! later controller calls.

use rtrb::{Consumer, Producer, RingBuffer};

use crate::consts::MAX_STOPS;

/// Capacity of the control and note queues.
pub const QUEUE_CAPACITY: usize = 1024;

pub const ALL_MIDI_CHANNELS: u16 = 0xFFFF;

/// Whether a 1-based MIDI channel is selected by `mask`. Channel 0 is an
/// internal event and always matches.
pub fn channel_matches(mask: u16, channel: u8) -> bool {
    channel == 0 || (1..=16).contains(&channel) && mask & (1 << (channel - 1)) != 0
}

/// Everything about a division a performer can change while playing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivisionParams {
    pub stops: u64,
    pub links: u64,
    pub tremulant: bool,
    pub midi_channels: u16,
    pub swell: f32,
}

impl Default for DivisionParams {
    fn default() -> Self {
        Self {
            stops: 0,
            links: 0,
            tremulant: false,
            midi_channels: ALL_MIDI_CHANNELS,
            swell: 1.0,
        }
    }
}

impl DivisionParams {
    pub fn is_stop_enabled(&self, index: usize) -> bool {
        index < MAX_STOPS && self.stops & (1 << index) != 0
    }

    pub fn enable_stop(&mut self, index: usize, enable: bool) {
        if index < MAX_STOPS {
            set_bit(&mut self.stops, index, enable);
        }
    }

    pub fn is_link_enabled(&self, index: usize) -> bool {
        index < 64 && self.links & (1 << index) != 0
    }

    pub fn enable_link(&mut self, index: usize, enable: bool) {
        if index < 64 {
            set_bit(&mut self.links, index, enable);
        }
    }
}

fn set_bit(bits: &mut u64, index: usize, on: bool) {
    if on {
        *bits |= 1 << index;
    } else {
        *bits &= !(1 << index);
    }
}

/// One field of one division's [`DivisionParams`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlUpdate {
    EnableStop { division: usize, stop: usize, enable: bool },
    Tremulant { division: usize, enable: bool },
    Link { division: usize, link: usize, enable: bool },
    MidiChannels { division: usize, mask: u16 },
    Swell { division: usize, gain: f32 },
}

impl ControlUpdate {
    pub fn division(&self) -> usize {
        match *self {
            ControlUpdate::EnableStop { division, .. }
            | ControlUpdate::Tremulant { division, .. }
            | ControlUpdate::Link { division, .. }
            | ControlUpdate::MidiChannels { division, .. }
            | ControlUpdate::Swell { division, .. } => division,
        }
    }

    /// Apply the change to a parameter copy.
    pub fn apply_to(&self, params: &mut DivisionParams) {
        match *self {
            ControlUpdate::EnableStop { stop, enable, .. } => params.enable_stop(stop, enable),
            ControlUpdate::Tremulant { enable, .. } => params.tremulant = enable,
            ControlUpdate::Link { link, enable, .. } => params.enable_link(link, enable),
            ControlUpdate::MidiChannels { mask, .. } => params.midi_channels = mask,
            ControlUpdate::Swell { gain, .. } => params.swell = gain.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub on: bool,
    pub note: u8,
    pub channel: u8,
}

/// Audio-thread side of the control queues.
pub struct ControlReceiver {
    updates: Consumer<ControlUpdate>,
    notes: Consumer<NoteEvent>,
}

impl ControlReceiver {
    pub fn pop_update(&mut self) -> Option<ControlUpdate> {
        self.updates.pop().ok()
    }

    pub fn pop_note(&mut self) -> Option<NoteEvent> {
        self.notes.pop().ok()
    }
}

/// Control-thread handle to an engine.
///
/// The controller mirrors the parameters it has sent, seeded from the engine
/// when it was created. The mirror does not see changes made on the audio
/// thread. Setters return `false` when the index is out of range or the
/// queue is full; a dropped update leaves the mirror unchanged.
pub struct OrganController {
    updates: Producer<ControlUpdate>,
    notes: Producer<NoteEvent>,
    params: Vec<DivisionParams>,
    stop_counts: Vec<usize>,
}

impl OrganController {
    /// Create a controller seeded with the current division parameters and
    /// the matching receiver for the engine.
    pub fn new(params: Vec<DivisionParams>, stop_counts: Vec<usize>) -> (Self, ControlReceiver) {
        let (updates_tx, updates_rx) = RingBuffer::new(QUEUE_CAPACITY);
        let (notes_tx, notes_rx) = RingBuffer::new(QUEUE_CAPACITY);
        (
            Self {
                updates: updates_tx,
                notes: notes_tx,
                params,
                stop_counts,
            },
            ControlReceiver {
                updates: updates_rx,
                notes: notes_rx,
            },
        )
    }

    pub fn division_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self, division: usize) -> Option<&DivisionParams> {
        self.params.get(division)
    }

    fn send(&mut self, update: ControlUpdate) -> bool {
        let Some(p) = self.params.get_mut(update.division()) else {
            return false;
        };
        if self.updates.push(update).is_err() {
            return false;
        }
        update.apply_to(p);
        true
    }

    pub fn enable_stop(&mut self, division: usize, stop: usize, enable: bool) -> bool {
        if self.stop_counts.get(division).is_none_or(|&n| stop >= n) {
            return false;
        }
        self.send(ControlUpdate::EnableStop { division, stop, enable })
    }

    pub fn is_stop_enabled(&self, division: usize, stop: usize) -> bool {
        self.params.get(division).is_some_and(|p| p.is_stop_enabled(stop))
    }

    pub fn set_tremulant_enabled(&mut self, division: usize, enable: bool) -> bool {
        self.send(ControlUpdate::Tremulant { division, enable })
    }

    pub fn is_tremulant_enabled(&self, division: usize) -> bool {
        self.params.get(division).is_some_and(|p| p.tremulant)
    }

    pub fn enable_link(&mut self, division: usize, link: usize, enable: bool) -> bool {
        self.send(ControlUpdate::Link { division, link, enable })
    }

    pub fn set_midi_channels_mask(&mut self, division: usize, mask: u16) -> bool {
        self.send(ControlUpdate::MidiChannels { division, mask })
    }

    pub fn set_swell(&mut self, division: usize, gain: f32) -> bool {
        self.send(ControlUpdate::Swell { division, gain })
    }

    pub fn note_on(&mut self, note: u8, channel: u8) -> bool {
        self.notes.push(NoteEvent { on: true, note, channel }).is_ok()
    }

    pub fn note_off(&mut self, note: u8, channel: u8) -> bool {
        self.notes.push(NoteEvent { on: false, note, channel }).is_ok()
    }
}
