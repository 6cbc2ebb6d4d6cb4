//! Offline renderer: plays a list of timed notes through an [`Engine`] and
//! returns the audio as sample buffers or a WAV byte buffer.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::OrganError;

/// Frames rendered per engine call between events.
const RENDER_BLOCK: usize = 512;

/// A note given either as a MIDI number or a name such as `"C4"` or `"F#3"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotePitch {
    Midi(u8),
    Name(String),
}

impl NotePitch {
    pub fn to_midi(&self) -> Option<u8> {
        match self {
            NotePitch::Midi(n) if *n < 128 => Some(*n),
            NotePitch::Midi(_) => None,
            NotePitch::Name(name) => note_to_midi(name),
        }
    }
}

fn default_channel() -> u8 {
    1
}

fn default_tail() -> f64 {
    2.0
}

/// One note to play, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedNote {
    pub time: f64,
    pub duration: f64,
    pub note: NotePitch,
    #[serde(default = "default_channel")]
    pub channel: u8,
}

/// A stop to draw, by division and stop name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSelection {
    pub division: String,
    pub stop: String,
}

/// Everything needed for an offline render of the built-in organ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub notes: Vec<TimedNote>,
    /// Stops to draw. When empty the organ's own registration is kept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registration: Vec<StopSelection>,
    /// Seconds rendered after the last note ends.
    #[serde(default = "default_tail")]
    pub tail: f64,
}

/// Parse a note name (e.g. "C4", "F#3", "Bb5") into a MIDI note number.
/// C4 is 60.
pub fn note_to_midi(note: &str) -> Option<u8> {
    let mut chars = note.chars();
    let mut semitone: i32 = match chars.next()? {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    let octave = match rest.chars().next() {
        Some('#') => {
            semitone += 1;
            &rest[1..]
        }
        Some('b') => {
            semitone -= 1;
            &rest[1..]
        }
        _ => rest,
    };
    let octave: i32 = octave.parse().ok()?;
    u8::try_from((octave + 1) * 12 + semitone).ok().filter(|&n| n < 128)
}

/// Replace the registration with `selection`. Returns how many of the
/// selected stops exist.
pub fn apply_registration(engine: &mut Engine, selection: &[StopSelection]) -> usize {
    for d in 0..engine.divisions().len() {
        let count = engine.divisions()[d].stop_count();
        for s in 0..count {
            engine.enable_stop(d, s, false);
        }
    }

    let mut found = 0;
    for sel in selection {
        let Some(d) = engine.division_index(&sel.division) else {
            log::warn!("unknown division '{}'", sel.division);
            continue;
        };
        let stop = engine.divisions()[d].stops().iter().position(|s| s.name == sel.stop);
        match stop {
            Some(s) => {
                engine.enable_stop(d, s, true);
                found += 1;
            }
            None => log::warn!("unknown stop '{}' in '{}'", sel.stop, sel.division),
        }
    }
    found
}

struct ScheduledEvent {
    frame: usize,
    on: bool,
    note: u8,
    channel: u8,
}

/// Render `notes` through `engine` at `sample_rate`, followed by `tail`
/// seconds. Returns the left and right channels.
pub fn render_stereo(engine: &mut Engine, notes: &[TimedNote], sample_rate: u32, tail: f64) -> (Vec<f32>, Vec<f32>) {
    let sr = sample_rate.max(1) as f64;
    let to_frame = |t: f64| (t.max(0.0) * sr).round() as usize;

    let mut events = Vec::with_capacity(notes.len() * 2);
    for n in notes {
        let Some(note) = n.note.to_midi() else {
            log::warn!("skipping unknown note {:?}", n.note);
            continue;
        };
        let start = to_frame(n.time);
        let end = to_frame(n.time + n.duration.max(0.0)).max(start + 1);
        events.push(ScheduledEvent {
            frame: start,
            on: true,
            note,
            channel: n.channel,
        });
        events.push(ScheduledEvent {
            frame: end,
            on: false,
            note,
            channel: n.channel,
        });
    }
    // Releases go first so a repeated note restarts.
    events.sort_by_key(|e| (e.frame, e.on));

    let end = events.last().map_or(0, |e| e.frame);
    let total = end + to_frame(tail);

    engine.set_non_realtime(true);
    engine.prepare_to_play(sample_rate as f32);

    let mut left = vec![0.0; total];
    let mut right = vec![0.0; total];
    let mut next = 0;
    let mut pos = 0;
    while pos < total {
        while next < events.len() && events[next].frame <= pos {
            let e = &events[next];
            if e.on {
                engine.note_on(e.note, e.channel);
            } else {
                engine.note_off(e.note, e.channel);
            }
            next += 1;
        }
        let until = events.get(next).map_or(total, |e| e.frame.min(total));
        let n = (until - pos).clamp(1, RENDER_BLOCK);
        engine.process(&mut left[pos..pos + n], &mut right[pos..pos + n]);
        pos += n;
    }
    (left, right)
}

/// Interleave two channels into one buffer.
pub fn interleave(left: &[f32], right: &[f32]) -> Vec<f32> {
    left.iter().zip(right).flat_map(|(&l, &r)| [l, r]).collect()
}

/// Encode stereo audio as a 16-bit PCM WAV file.
pub fn encode_wav(left: &[f32], right: &[f32], sample_rate: u32) -> Result<Vec<u8>, OrganError> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for (&l, &r) in left.iter().zip(right) {
            writer.write_sample(to_i16(l))?;
            writer.write_sample(to_i16(r))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn to_i16(x: f32) -> i16 {
    (x.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Render and encode in one step.
pub fn render_wav(engine: &mut Engine, notes: &[TimedNote], sample_rate: u32, tail: f64) -> Result<Vec<u8>, OrganError> {
    let (left, right) = render_stereo(engine, notes, sample_rate, tail);
    encode_wav(&left, &right, sample_rate)
}
