//! Additive pipe models.
//!
//! A [`PipeModel`] describes one rank of pipes: per-note volume, tuning,
//! attack and release behaviour, plus the level and attack shape of each of
//! the [`N_HARM`] harmonics. Every parameter is stored at [`N_NOTES`] control
//! points spaced [`NOTES_GAP`] semitones apart and linearly interpolated in
//! between.

pub mod ae0;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::consts::{deprecated, N_HARM, N_NOTES, NOTES_GAP, NOTE_MAX, NOTE_MIN};
use crate::error::{ModelError, OrganError};

// ── Per-note function ───────────────────────────────────────

/// A value defined at [`N_NOTES`] control points. Points that were never
/// set explicitly follow their set neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "NoteFuncRepr", into = "NoteFuncRepr")]
pub struct NoteFunc {
    mask: u32,
    values: [f32; N_NOTES],
}

#[derive(Serialize, Deserialize)]
struct NoteFuncRepr {
    mask: u32,
    values: Vec<f32>,
}

impl From<NoteFuncRepr> for NoteFunc {
    fn from(r: NoteFuncRepr) -> Self {
        let mut f = NoteFunc::new(0.0);
        f.mask = r.mask;
        if r.values.len() >= N_NOTES {
            f.values.copy_from_slice(&r.values[..N_NOTES]);
        }
        f
    }
}

impl From<NoteFunc> for NoteFuncRepr {
    fn from(f: NoteFunc) -> Self {
        NoteFuncRepr {
            mask: f.mask,
            values: f.values.to_vec(),
        }
    }
}

impl Default for NoteFunc {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl NoteFunc {
    /// After a reset only the middle point counts as set.
    const RESET_MASK: u32 = 1 << 4;

    pub fn new(v: f32) -> Self {
        Self {
            mask: Self::RESET_MASK,
            values: [v; N_NOTES],
        }
    }

    pub(crate) fn from_raw(mask: u32, values: [f32; N_NOTES]) -> Self {
        Self { mask, values }
    }

    pub fn reset(&mut self, v: f32) {
        self.mask = Self::RESET_MASK;
        self.values = [v; N_NOTES];
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn values(&self) -> &[f32; N_NOTES] {
        &self.values
    }

    /// Set control point `idx` and re-interpolate up to the nearest set
    /// points on either side. Beyond the outermost set point the value is
    /// held flat.
    pub fn set_value(&mut self, idx: usize, v: f32) {
        if idx >= N_NOTES {
            return;
        }
        self.values[idx] = v;
        self.mask |= 1 << idx;

        match (0..idx).rev().find(|&j| self.is_set(j)) {
            Some(j) => {
                let d = (self.values[j] - v) / (j as f32 - idx as f32);
                for k in j + 1..idx {
                    self.values[k] = v + (k as f32 - idx as f32) * d;
                }
            }
            None => self.values[..idx].fill(v),
        }

        match (idx + 1..N_NOTES).find(|&j| self.is_set(j)) {
            Some(j) => {
                let d = (self.values[j] - v) / (j as f32 - idx as f32);
                for k in idx + 1..j {
                    self.values[k] = v + (k as f32 - idx as f32) * d;
                }
            }
            None => self.values[idx + 1..].fill(v),
        }
    }

    /// Unset control point `idx`. The last set point cannot be cleared.
    pub fn clear_value(&mut self, idx: usize) {
        if idx >= N_NOTES {
            return;
        }
        let m = 1 << idx;
        if self.mask & m == 0 || self.mask == m {
            return;
        }
        self.mask ^= m;

        let below = (0..idx).rev().find(|&j| self.is_set(j));
        let above = (idx + 1..N_NOTES).find(|&k| self.is_set(k));

        match (below, above) {
            (Some(j), Some(k)) => {
                let d = (self.values[k] - self.values[j]) / (k - j) as f32;
                for i in j + 1..k {
                    self.values[i] = self.values[j] + (i - j) as f32 * d;
                }
            }
            (Some(j), None) => {
                let v = self.values[j];
                self.values[j + 1..].fill(v);
            }
            (None, Some(k)) => {
                let v = self.values[k];
                self.values[..k].fill(v);
            }
            (None, None) => {}
        }
    }

    pub fn value(&self, idx: usize) -> f32 {
        self.values[idx.min(N_NOTES - 1)]
    }

    pub fn is_set(&self, idx: usize) -> bool {
        idx < N_NOTES && self.mask & (1 << idx) != 0
    }

    /// Interpolated value for a note counted from the model's lowest note.
    pub fn at(&self, note: usize) -> f32 {
        let i = note / NOTES_GAP;
        if i >= N_NOTES - 1 {
            return self.values[N_NOTES - 1];
        }
        let k = note - NOTES_GAP * i;
        let v = self.values[i];
        if k == 0 {
            v
        } else {
            v + k as f32 * (self.values[i + 1] - v) / NOTES_GAP as f32
        }
    }
}

// ── Per-harmonic function ───────────────────────────────────

/// One [`NoteFunc`] per harmonic.
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicFunc {
    funcs: [NoteFunc; N_HARM],
}

impl HarmonicFunc {
    pub fn new(v: f32) -> Self {
        Self {
            funcs: [NoteFunc::new(v); N_HARM],
        }
    }

    pub fn reset(&mut self, v: f32) {
        for f in self.funcs.iter_mut() {
            f.reset(v);
        }
    }

    /// Set control point `idx` on every harmonic.
    pub fn set_value_all(&mut self, idx: usize, v: f32) {
        for f in self.funcs.iter_mut() {
            f.set_value(idx, v);
        }
    }

    pub fn set_value(&mut self, harm: usize, idx: usize, v: f32) {
        if let Some(f) = self.funcs.get_mut(harm) {
            f.set_value(idx, v);
        }
    }

    pub fn clear_value_all(&mut self, idx: usize) {
        for f in self.funcs.iter_mut() {
            f.clear_value(idx);
        }
    }

    pub fn clear_value(&mut self, harm: usize, idx: usize) {
        if let Some(f) = self.funcs.get_mut(harm) {
            f.clear_value(idx);
        }
    }

    pub fn value(&self, harm: usize, idx: usize) -> f32 {
        self.funcs.get(harm).map_or(0.0, |f| f.value(idx))
    }

    pub fn is_set(&self, harm: usize, idx: usize) -> bool {
        self.funcs.get(harm).is_some_and(|f| f.is_set(idx))
    }

    pub fn at(&self, harm: usize, note: usize) -> f32 {
        self.funcs.get(harm).map_or(0.0, |f| f.at(note))
    }

    pub fn harmonic(&self, harm: usize) -> Option<&NoteFunc> {
        self.funcs.get(harm)
    }

    pub fn harmonic_mut(&mut self, harm: usize) -> Option<&mut NoteFunc> {
        self.funcs.get_mut(harm)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NoteFunc> {
        self.funcs.iter()
    }

    /// Overwrite the first harmonics from `funcs`; the rest keep their values.
    fn apply(&mut self, funcs: &[NoteFunc], limit: usize) {
        for (dst, src) in self.funcs.iter_mut().zip(funcs.iter().take(limit)) {
            *dst = *src;
        }
    }
}

// ── Pipe model ──────────────────────────────────────────────

/// Additive synthesis description of one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeModel {
    pub name: String,
    pub copyright: String,
    pub mnemonic: String,
    pub comments: String,

    note_min: u8,
    note_max: u8,
    fn_: u8,
    fd: u8,

    /// Volume, dB.
    pub n_vol: NoteFunc,
    /// Frequency offset, Hz.
    pub n_off: NoteFunc,
    /// Frequency randomisation, Hz.
    pub n_ran: NoteFunc,
    /// Wind instability.
    pub n_ins: NoteFunc,
    /// Attack time, seconds.
    pub n_att: NoteFunc,
    /// Attack detune, cents.
    pub n_atd: NoteFunc,
    /// Release time, seconds.
    pub n_dct: NoteFunc,
    /// Release detune, cents.
    pub n_dcd: NoteFunc,

    /// Harmonic level, dB.
    pub h_lev: HarmonicFunc,
    /// Harmonic level randomisation, dB.
    pub h_ran: HarmonicFunc,
    /// Harmonic attack time, seconds.
    pub h_att: HarmonicFunc,
    /// Harmonic attack profile.
    pub h_atp: HarmonicFunc,
}

impl Default for PipeModel {
    fn default() -> Self {
        Self {
            name: String::new(),
            copyright: String::new(),
            mnemonic: String::new(),
            comments: String::new(),
            note_min: NOTE_MIN,
            note_max: NOTE_MAX,
            fn_: 1,
            fd: 1,
            n_vol: NoteFunc::new(-20.0),
            n_off: NoteFunc::new(0.0),
            n_ran: NoteFunc::new(0.0),
            n_ins: NoteFunc::new(0.0),
            n_att: NoteFunc::new(0.01),
            n_atd: NoteFunc::new(0.0),
            n_dct: NoteFunc::new(0.01),
            n_dcd: NoteFunc::new(0.0),
            h_lev: HarmonicFunc::new(-100.0),
            h_ran: HarmonicFunc::new(0.0),
            h_att: HarmonicFunc::new(0.05),
            h_atp: HarmonicFunc::new(0.0),
        }
    }
}

impl PipeModel {
    /// Current file format version. Version 1 files lack the instability,
    /// attack and release functions.
    pub const VERSION: u8 = 2;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn note_min(&self) -> u8 {
        self.note_min
    }

    pub fn note_max(&self) -> u8 {
        self.note_max
    }

    /// Number of notes the model covers.
    pub fn note_count(&self) -> usize {
        (self.note_max - self.note_min) as usize + 1
    }

    pub fn set_note_range(&mut self, min: u8, max: u8) -> Result<(), ModelError> {
        if min > max || max > 127 {
            return Err(ModelError::InvalidNoteRange { min, max });
        }
        self.note_min = min;
        self.note_max = max;
        Ok(())
    }

    /// Frequency ratio numerator.
    pub fn fn_(&self) -> u8 {
        self.fn_
    }

    /// Frequency ratio denominator.
    pub fn fd(&self) -> u8 {
        self.fd
    }

    pub fn ratio(&self) -> f32 {
        self.fn_ as f32 / self.fd as f32
    }

    pub fn set_ratio(&mut self, fn_: u8, fd: u8) -> Result<(), ModelError> {
        if fn_ == 0 || fd == 0 {
            return Err(ModelError::InvalidRatio { fn_, fd });
        }
        self.fn_ = fn_;
        self.fd = fd;
        Ok(())
    }

    pub fn note_volume(&self, n: usize) -> f32 {
        self.n_vol.at(n)
    }

    pub fn note_offset(&self, n: usize) -> f32 {
        self.n_off.at(n)
    }

    pub fn note_randomisation(&self, n: usize) -> f32 {
        self.n_ran.at(n)
    }

    pub fn note_instability(&self, n: usize) -> f32 {
        self.n_ins.at(n)
    }

    pub fn note_attack(&self, n: usize) -> f32 {
        self.n_att.at(n)
    }

    pub fn note_attack_detune(&self, n: usize) -> f32 {
        self.n_atd.at(n)
    }

    pub fn note_release(&self, n: usize) -> f32 {
        self.n_dct.at(n)
    }

    pub fn note_release_detune(&self, n: usize) -> f32 {
        self.n_dcd.at(n)
    }

    pub fn harmonic_level(&self, h: usize, n: usize) -> f32 {
        self.h_lev.at(h, n)
    }

    pub fn harmonic_randomisation(&self, h: usize, n: usize) -> f32 {
        self.h_ran.at(h, n)
    }

    pub fn harmonic_attack(&self, h: usize, n: usize) -> f32 {
        self.h_att.at(h, n)
    }

    pub fn harmonic_attack_profile(&self, h: usize, n: usize) -> f32 {
        self.h_atp.at(h, n)
    }

    pub fn from_json(s: &str) -> Result<Self, OrganError> {
        let file: PipeModelFile = serde_json::from_str(s)?;
        Ok(file.into_model()?)
    }

    pub fn to_json(&self) -> Result<String, OrganError> {
        Ok(serde_json::to_string_pretty(&PipeModelFile::from_model(self))?)
    }

    /// Load a `.json` or `.ae0` file. The model is named after the file.
    pub fn load_file(path: &Path) -> Result<Self, OrganError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut model = match ext.as_str() {
            "json" => Self::from_json(&std::fs::read_to_string(path)?)?,
            "ae0" => ae0::read(std::io::BufReader::new(std::fs::File::open(path)?))?,
            _ => return Err(ModelError::UnknownFormat(ext).into()),
        };

        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            model.name = stem.to_string();
        }
        Ok(model)
    }
}

// ── JSON representation ─────────────────────────────────────

fn default_note_min() -> u8 {
    NOTE_MIN
}

fn default_note_max() -> u8 {
    NOTE_MAX
}

fn default_ratio() -> u8 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct PipeModelFile {
    #[serde(default)]
    version: u8,
    #[serde(default)]
    n_harm: usize,
    #[serde(default = "default_note_min")]
    note_min: u8,
    #[serde(default = "default_note_max")]
    note_max: u8,
    #[serde(rename = "fn", default = "default_ratio")]
    fn_: u8,
    #[serde(default = "default_ratio")]
    fd: u8,

    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    copyright: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    mnemonic: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    comments: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_vol: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_off: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_ran: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_ins: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_att: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_atd: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_dct: Option<NoteFunc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n_dcd: Option<NoteFunc>,

    #[serde(default)]
    h_lev: Vec<NoteFunc>,
    #[serde(default)]
    h_ran: Vec<NoteFunc>,
    #[serde(default)]
    h_att: Vec<NoteFunc>,
    #[serde(default)]
    h_atp: Vec<NoteFunc>,
}

impl PipeModelFile {
    fn from_model(m: &PipeModel) -> Self {
        Self {
            version: PipeModel::VERSION,
            n_harm: N_HARM,
            note_min: m.note_min,
            note_max: m.note_max,
            fn_: m.fn_,
            fd: m.fd,
            name: m.name.clone(),
            copyright: m.copyright.clone(),
            mnemonic: m.mnemonic.clone(),
            comments: m.comments.clone(),
            n_vol: Some(m.n_vol),
            n_off: Some(m.n_off),
            n_ran: Some(m.n_ran),
            n_ins: Some(m.n_ins),
            n_att: Some(m.n_att),
            n_atd: Some(m.n_atd),
            n_dct: Some(m.n_dct),
            n_dcd: Some(m.n_dcd),
            h_lev: m.h_lev.iter().copied().collect(),
            h_ran: m.h_ran.iter().copied().collect(),
            h_att: m.h_att.iter().copied().collect(),
            h_atp: m.h_atp.iter().copied().collect(),
        }
    }

    fn into_model(self) -> Result<PipeModel, ModelError> {
        let mut m = PipeModel::new(self.name);
        m.copyright = self.copyright;
        m.mnemonic = self.mnemonic;
        m.comments = self.comments;

        let note_max = if self.note_max == deprecated::NOTE_MAX {
            NOTE_MAX
        } else {
            self.note_max
        };
        m.set_note_range(self.note_min, note_max)?;
        m.set_ratio(self.fn_, self.fd)?;

        let n_harm = if self.n_harm == 0 {
            deprecated::N_HARM
        } else {
            self.n_harm.min(N_HARM)
        };

        let apply = |dst: &mut NoteFunc, src: Option<NoteFunc>| {
            if let Some(f) = src {
                *dst = f;
            }
        };
        apply(&mut m.n_vol, self.n_vol);
        apply(&mut m.n_off, self.n_off);
        apply(&mut m.n_ran, self.n_ran);
        if self.version >= PipeModel::VERSION {
            apply(&mut m.n_ins, self.n_ins);
            apply(&mut m.n_att, self.n_att);
            apply(&mut m.n_atd, self.n_atd);
            apply(&mut m.n_dct, self.n_dct);
            apply(&mut m.n_dcd, self.n_dcd);
        }

        m.h_lev.apply(&self.h_lev, n_harm);
        m.h_ran.apply(&self.h_ran, n_harm);
        m.h_att.apply(&self.h_att, n_harm);
        m.h_atp.apply(&self.h_atp, n_harm);

        Ok(m)
    }
}

// ── Registry ────────────────────────────────────────────────

/// Pipe models by name, shared with the ranks built from them.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<PipeModel>>,
    by_name: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` and keeps the existing model if the name is taken.
    pub fn insert(&mut self, model: PipeModel) -> bool {
        if self.by_name.contains_key(&model.name) {
            log::warn!("duplicate pipe model '{}' ignored", model.name);
            return false;
        }
        self.by_name.insert(model.name.clone(), self.models.len());
        self.models.push(Arc::new(model));
        true
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PipeModel>> {
        self.by_name.get(name).map(|&i| &self.models[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Model names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Load every `.json` and `.ae0` file in `dir`, skipping `skip` (the
    /// organ configuration usually lives next to the models). Unreadable
    /// files are logged and skipped. Returns the number of models added.
    pub fn load_dir(&mut self, dir: &Path, skip: Option<&Path>) -> Result<usize, OrganError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && Some(p.as_path()) != skip)
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("json") || e.eq_ignore_ascii_case("ae0"))
            })
            .collect();
        paths.sort();

        let mut added = 0;
        for path in paths {
            match PipeModel::load_file(&path) {
                Ok(model) => {
                    if self.insert(model) {
                        added += 1;
                    }
                }
                Err(e) => log::warn!("skipping {}: {e}", path.display()),
            }
        }
        log::info!("loaded {added} pipe models from {}", dir.display());
        Ok(added)
    }

    /// Models synthesized in code so an organ can be built without assets.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        for model in builtin::models() {
            reg.insert(model);
        }
        reg
    }
}

mod builtin {
    use super::PipeModel;

    struct Recipe {
        name: &'static str,
        mnemonic: &'static str,
        fn_: u8,
        fd: u8,
        volume: f32,
        /// Level of each harmonic, dB.
        levels: &'static [f32],
        /// Attack time at the bottom and the top of the compass.
        attack: (f32, f32),
        release: f32,
        instability: f32,
        /// Attack profile of the upper harmonics.
        profile: f32,
    }

    const PRINCIPAL: &[f32] = &[0.0, -8.0, -13.0, -18.0, -22.0, -26.0, -30.0, -34.0, -38.0, -42.0, -46.0, -50.0];
    const OCTAVE: &[f32] = &[0.0, -10.0, -16.0, -22.0, -28.0, -34.0, -40.0, -46.0];
    const FLUTE: &[f32] = &[0.0, -30.0, -14.0, -44.0, -28.0, -60.0, -40.0];
    const OPEN_FLUTE: &[f32] = &[0.0, -14.0, -24.0, -34.0, -44.0, -54.0];
    const STRING: &[f32] = &[
        -6.0, -4.0, -6.0, -8.0, -10.0, -12.0, -14.0, -16.0, -18.0, -20.0, -22.0, -24.0, -26.0, -28.0, -30.0, -32.0,
        -34.0, -36.0, -38.0, -40.0,
    ];
    const REED: &[f32] = &[
        -4.0, 0.0, -2.0, -3.0, -4.0, -5.0, -7.0, -8.0, -9.0, -10.0, -11.0, -12.0, -14.0, -15.0, -16.0, -18.0, -19.0,
        -20.0, -22.0, -23.0, -24.0, -26.0, -27.0, -28.0, -30.0, -31.0, -32.0, -34.0, -35.0, -36.0, -38.0, -40.0,
    ];
    const MIXTURE: &[f32] = &[0.0, -12.0, -20.0, -30.0];

    #[rustfmt::skip]
    const RECIPES: &[Recipe] = &[
        Recipe { name: "Principal 8", mnemonic: "P8", fn_: 1, fd: 1, volume: -20.0, levels: PRINCIPAL, attack: (0.06, 0.02), release: 0.05, instability: 0.2, profile: 0.3 },
        Recipe { name: "Octave 4", mnemonic: "O4", fn_: 2, fd: 1, volume: -22.0, levels: OCTAVE, attack: (0.04, 0.015), release: 0.04, instability: 0.2, profile: 0.3 },
        Recipe { name: "Fifteenth 2", mnemonic: "F2", fn_: 4, fd: 1, volume: -24.0, levels: OCTAVE, attack: (0.03, 0.012), release: 0.03, instability: 0.2, profile: 0.2 },
        Recipe { name: "Twelfth 2 2/3", mnemonic: "T3", fn_: 3, fd: 1, volume: -26.0, levels: OCTAVE, attack: (0.03, 0.012), release: 0.03, instability: 0.2, profile: 0.2 },
        Recipe { name: "Gedackt 8", mnemonic: "G8", fn_: 1, fd: 1, volume: -18.0, levels: FLUTE, attack: (0.08, 0.03), release: 0.05, instability: 0.1, profile: 0.6 },
        Recipe { name: "Rohrflute 4", mnemonic: "R4", fn_: 2, fd: 1, volume: -20.0, levels: OPEN_FLUTE, attack: (0.05, 0.02), release: 0.04, instability: 0.1, profile: 0.5 },
        Recipe { name: "Subbass 16", mnemonic: "S16", fn_: 1, fd: 2, volume: -16.0, levels: FLUTE, attack: (0.12, 0.05), release: 0.08, instability: 0.1, profile: 0.6 },
        Recipe { name: "Gamba 8", mnemonic: "V8", fn_: 1, fd: 1, volume: -24.0, levels: STRING, attack: (0.12, 0.05), release: 0.06, instability: 0.3, profile: 0.8 },
        Recipe { name: "Trumpet 8", mnemonic: "Tr8", fn_: 1, fd: 1, volume: -24.0, levels: REED, attack: (0.03, 0.01), release: 0.03, instability: 0.1, profile: 0.0 },
        Recipe { name: "Mixture 1 1/3", mnemonic: "M1", fn_: 6, fd: 1, volume: -28.0, levels: MIXTURE, attack: (0.02, 0.01), release: 0.03, instability: 0.2, profile: 0.2 },
        Recipe { name: "Mixture 1", mnemonic: "M2", fn_: 8, fd: 1, volume: -30.0, levels: MIXTURE, attack: (0.02, 0.01), release: 0.03, instability: 0.2, profile: 0.2 },
    ];

    pub(super) fn models() -> Vec<PipeModel> {
        RECIPES.iter().map(build).collect()
    }

    fn build(r: &Recipe) -> PipeModel {
        let mut m = PipeModel::new(r.name);
        m.mnemonic = r.mnemonic.to_string();
        m.comments = "built-in".to_string();
        // Ratios in the table are always non-zero.
        let _ = m.set_ratio(r.fn_, r.fd);

        m.n_vol.reset(r.volume);
        m.n_vol.set_value(10, r.volume - 3.0);
        m.n_ins.reset(r.instability);
        m.n_off.reset(0.0);
        m.n_ran.reset(0.1);

        m.n_att.reset(r.attack.0);
        m.n_att.set_value(0, r.attack.0);
        m.n_att.set_value(10, r.attack.1);
        m.n_atd.reset(-10.0);
        m.n_dct.reset(r.release);
        m.n_dcd.reset(-5.0);

        for (h, &level) in r.levels.iter().enumerate() {
            m.h_lev.set_value(h, 4, level);
            // Upper harmonics fade slightly towards the treble.
            m.h_lev.set_value(h, 10, level - 0.5 * h as f32);
            m.h_ran.set_value(h, 4, 0.5);
            m.h_att.set_value(h, 0, r.attack.0 * (1.0 + 0.1 * h as f32));
            m.h_att.set_value(h, 10, r.attack.1 * (1.0 + 0.1 * h as f32));
            if h > 0 {
                m.h_atp.set_value(h, 4, r.profile);
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_func_interpolates_between_set_points() {
        let mut f = NoteFunc::new(0.0);
        f.set_value(0, 10.0);
        f.set_value(4, 2.0);
        // 1..3 interpolate between 10 and 2; above 4 holds flat.
        assert_eq!(f.value(2), 6.0);
        assert_eq!(f.value(10), 2.0);
        f.set_value(10, 12.0);
        assert!((f.value(7) - 7.0).abs() < 1e-5, "got {}", f.value(7));
    }

    #[test]
    fn note_func_lookup_between_points() {
        let mut f = NoteFunc::new(0.0);
        f.set_value(0, 0.0);
        f.set_value(1, 6.0);
        assert_eq!(f.at(0), 0.0);
        assert!((f.at(3) - 3.0).abs() < 1e-6, "got {}", f.at(3));
        assert_eq!(f.at(6), 6.0);
        // Past the last point the value is held.
        assert_eq!(f.at(1000), f.value(N_NOTES - 1));
    }

    #[test]
    fn clearing_a_point_reinterpolates() {
        let mut f = NoteFunc::new(0.0);
        f.set_value(0, 0.0);
        f.set_value(2, 10.0);
        f.set_value(4, 4.0);
        f.clear_value(2);
        assert!(!f.is_set(2));
        assert!((f.value(2) - 2.0).abs() < 1e-6, "got {}", f.value(2));

        // The last remaining set point stays.
        let mut g = NoteFunc::new(1.0);
        g.clear_value(4);
        assert!(g.is_set(4));
    }

    #[test]
    fn defaults_match_model_conventions() {
        let m = PipeModel::default();
        assert_eq!(m.note_min(), 36);
        assert_eq!(m.note_max(), 96);
        assert_eq!(m.note_volume(0), -20.0);
        assert_eq!(m.note_attack(30), 0.01);
        assert_eq!(m.harmonic_level(63, 10), -100.0);
        assert_eq!(m.harmonic_attack(0, 0), 0.05);
        assert_eq!(m.ratio(), 1.0);
    }

    #[test]
    fn json_round_trip() {
        let reg = ModelRegistry::builtin();
        let model = reg.get("Trumpet 8").expect("builtin trumpet");
        let json = model.to_json().expect("to_json");
        let back = PipeModel::from_json(&json).expect("from_json");
        assert_eq!(&back, model.as_ref());
    }

    #[test]
    fn legacy_json_is_upgraded() {
        let json = r#"{
            "version": 1,
            "note_min": 36,
            "note_max": 46,
            "fn": 2,
            "fd": 1,
            "name": "Old",
            "n_att": { "mask": 16, "values": [9,9,9,9,9,9,9,9,9,9,9] },
            "h_lev": [{ "mask": 16, "values": [-3,-3,-3,-3,-3,-3,-3,-3,-3,-3,-3] }]
        }"#;
        let m = PipeModel::from_json(json).expect("parse");
        assert_eq!(m.note_max(), NOTE_MAX);
        assert_eq!(m.fn_(), 2);
        // Version 1 carries no attack function.
        assert_eq!(m.note_attack(0), 0.01);
        assert_eq!(m.harmonic_level(0, 0), -3.0);
        assert_eq!(m.harmonic_level(1, 0), -100.0);
    }

    #[test]
    fn invalid_ratio_is_rejected() {
        let json = r#"{ "version": 2, "fn": 0, "fd": 1 }"#;
        let err = PipeModel::from_json(json).expect_err("zero ratio");
        assert!(matches!(err, OrganError::Model(ModelError::InvalidRatio { fn_: 0, fd: 1 })), "got {err}");
    }

    #[test]
    fn registry_ignores_duplicates() {
        let mut reg = ModelRegistry::new();
        assert!(reg.insert(PipeModel::new("A")));
        let mut other = PipeModel::new("A");
        other.mnemonic = "x".into();
        assert!(!reg.insert(other));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("A").map(|m| m.mnemonic.as_str()), Some(""));
        assert!(reg.get("B").is_none());
    }

    #[test]
    fn builtin_models_are_audible() {
        let reg = ModelRegistry::builtin();
        assert!(reg.len() >= 10, "got {}", reg.len());
        for name in reg.names() {
            let m = reg.get(name).expect("listed model");
            assert!(m.harmonic_level(0, 4) > -80.0 || m.harmonic_level(1, 4) > -80.0, "{name} is silent");
        }
    }
}
