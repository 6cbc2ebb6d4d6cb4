//! Organ topology and engine settings.
//!
//! These types map directly to the organ configuration JSON: divisions with
//! their stops, links and expression devices, plus the sequencer's key
//! switches. Everything is checked against the pipe model registry before an
//! engine is built from it.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_VOICE_POOL_SIZE, MAX_DIVISIONS, MAX_STOPS, SEQUENCER_N_STEPS, TREMULANT_MAX_DEPTH,
    TUNING_FREQUENCY_DEFAULT, TUNING_FREQUENCY_MAX, TUNING_FREQUENCY_MIN,
};
use crate::controls::ALL_MIDI_CHANNELS;
use crate::error::{ConfigError, OrganError};
use crate::model::ModelRegistry;
use crate::scale::Temperament;
use crate::stop::StopType;

fn one() -> f32 {
    1.0
}

fn all_channels() -> u16 {
    ALL_MIDI_CHANNELS
}

// ── Organ ───────────────────────────────────────────────────

/// Top-level organ description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganConfig {
    pub divisions: Vec<DivisionConfig>,
    #[serde(default)]
    pub sequencer: SequencerConfig,
}

/// One keyboard (manual or pedal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivisionConfig {
    pub name: String,
    #[serde(default)]
    pub stops: Vec<StopConfig>,
    /// Names of the divisions this one couples into.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tremulant: Option<TremulantConfig>,
    /// Whether the division stands in a swell box.
    #[serde(default)]
    pub swell: bool,
    #[serde(default = "one")]
    pub gain: f32,
    /// MIDI channels the division listens to, bit 0 is channel 1.
    #[serde(default = "all_channels")]
    pub midi_channels: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TremulantConfig {
    /// Modulation depth from 0 to 1, 1.0 is the nominal tremulant.
    #[serde(default = "one")]
    pub depth: f32,
}

impl Default for TremulantConfig {
    fn default() -> Self {
        Self { depth: 1.0 }
    }
}

/// A stop either names its pipes directly, spanning their whole compass, or
/// lists explicit zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopConfig {
    pub name: String,
    /// `principal`, `flute`, `reed` or `string`, any case.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default = "one")]
    pub gain: f32,
    /// Level of the attack noise, 0 disables it.
    #[serde(default)]
    pub chiff: f32,
    /// Drawn when the organ starts.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe: Option<PipeNames>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<ZoneConfig>,
}

impl StopConfig {
    /// Stop sounding `pipes` over their full compass.
    pub fn new(name: &str, kind: &str, pipes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            gain: 1.0,
            chiff: 0.0,
            enabled: false,
            pipe: Some(PipeNames::from_slice(pipes)),
            zones: Vec::new(),
        }
    }

    pub fn stop_type(&self) -> StopType {
        StopType::from_name(&self.kind)
    }

    /// Every pipe model the stop refers to.
    pub fn pipe_names(&self) -> impl Iterator<Item = &str> {
        self.pipe
            .iter()
            .flat_map(PipeNames::names)
            .chain(self.zones.iter().flat_map(|z| z.pipe.names()))
    }
}

/// Key range `[low, high]`, inclusive, sounding the given pipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub range: [u8; 2],
    pub pipe: PipeNames,
}

/// One pipe model name, or several forming a mixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipeNames {
    One(String),
    Many(Vec<String>),
}

impl PipeNames {
    pub fn from_slice(names: &[&str]) -> Self {
        match names {
            [one] => PipeNames::One(one.to_string()),
            _ => PipeNames::Many(names.iter().map(|n| n.to_string()).collect()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        let names: &[String] = match self {
            PipeNames::One(name) => std::slice::from_ref(name),
            PipeNames::Many(names) => names,
        };
        names.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.names().next().is_none()
    }
}

// ── Sequencer ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backward_key: Option<KeySwitch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_key: Option<KeySwitch>,
}

/// A note, or several notes, acting as a switch on the control channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySwitch {
    One(u8),
    Many(Vec<u8>),
}

impl KeySwitch {
    pub fn notes(&self) -> Vec<u8> {
        match self {
            KeySwitch::One(n) => vec![*n],
            KeySwitch::Many(v) => v.clone(),
        }
    }
}

// ── Engine settings ─────────────────────────────────────────

/// Runtime settings that are not part of the organ itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Frequency of A4 in Hz, 350 to 550.
    pub tuning_frequency: f32,
    pub temperament: Temperament,
    pub max_voices: usize,
    pub volume: f32,
    pub reverb_wet: f32,
    /// Channels carrying key switches, program changes and stop control.
    pub midi_ctrl_channels: u16,
    /// Channels whose volume controller moves the swell shutters.
    pub midi_swell_channels: u16,
    pub sequencer_steps: usize,
    /// Seed for pipe randomisation. Equal seeds give identical wavetables.
    pub seed: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tuning_frequency: TUNING_FREQUENCY_DEFAULT,
            temperament: Temperament::default(),
            max_voices: DEFAULT_VOICE_POOL_SIZE,
            volume: 0.5,
            reverb_wet: 0.25,
            midi_ctrl_channels: ALL_MIDI_CHANNELS,
            midi_swell_channels: ALL_MIDI_CHANNELS,
            sequencer_steps: SEQUENCER_N_STEPS,
            seed: 0x5EED,
        }
    }
}

impl EngineSettings {
    pub fn clamped_tuning(&self) -> f32 {
        clamp_tuning(self.tuning_frequency)
    }
}

pub fn clamp_tuning(frequency: f32) -> f32 {
    frequency.clamp(TUNING_FREQUENCY_MIN, TUNING_FREQUENCY_MAX)
}

// ── Loading and validation ──────────────────────────────────

impl OrganConfig {
    pub fn from_json(s: &str) -> Result<Self, OrganError> {
        let config: OrganConfig = serde_json::from_str(s)?;
        log::info!(
            "organ configuration: {} divisions, {} stops",
            config.divisions.len(),
            config.stop_count()
        );
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, OrganError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, OrganError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn stop_count(&self) -> usize {
        self.divisions.iter().map(|d| d.stops.len()).sum()
    }

    pub fn division_index(&self, name: &str) -> Option<usize> {
        self.divisions.iter().position(|d| d.name == name)
    }

    /// Check the topology against the available pipe models. Stop types
    /// that are not recognised only produce a warning.
    pub fn validate(&self, registry: &ModelRegistry) -> Result<(), ConfigError> {
        if self.divisions.is_empty() {
            return Err(ConfigError::NoDivisions);
        }
        if self.divisions.len() > MAX_DIVISIONS {
            return Err(ConfigError::TooManyDivisions(self.divisions.len()));
        }

        let mut seen = HashSet::new();
        for division in &self.divisions {
            if !seen.insert(division.name.as_str()) {
                return Err(ConfigError::DuplicateDivision(division.name.clone()));
            }
        }

        for division in &self.divisions {
            if division.stops.len() > MAX_STOPS {
                return Err(ConfigError::TooManyStops {
                    division: division.name.clone(),
                    count: division.stops.len(),
                });
            }
            if let Some(t) = division.tremulant.filter(|t| !(0.0..=TREMULANT_MAX_DEPTH).contains(&t.depth)) {
                return Err(ConfigError::InvalidTremulantDepth {
                    division: division.name.clone(),
                    depth: t.depth,
                });
            }
            for target in &division.links {
                if self.division_index(target).is_none() {
                    return Err(ConfigError::UnknownLinkTarget {
                        division: division.name.clone(),
                        target: target.clone(),
                    });
                }
            }
            for stop in &division.stops {
                validate_stop(&division.name, stop, registry)?;
            }
        }
        Ok(())
    }

    /// Two manuals and a pedal built from [`ModelRegistry::builtin`] models.
    pub fn default_organ() -> Self {
        let stop = |name: &str, kind: &str, pipes: &[&str], enabled: bool| StopConfig {
            enabled,
            ..StopConfig::new(name, kind, pipes)
        };

        let great = DivisionConfig {
            name: "Great".into(),
            stops: vec![
                stop("Principal 8", "principal", &["Principal 8"], true),
                stop("Octave 4", "principal", &["Octave 4"], false),
                stop("Fifteenth 2", "principal", &["Fifteenth 2"], false),
                stop("Mixture III", "principal", &["Twelfth 2 2/3", "Mixture 1 1/3", "Mixture 1"], false),
                stop("Trumpet 8", "reed", &["Trumpet 8"], false),
            ],
            links: vec!["Swell".into()],
            tremulant: None,
            swell: false,
            gain: 1.0,
            midi_channels: 0b001,
        };
        let swell = DivisionConfig {
            name: "Swell".into(),
            stops: vec![
                StopConfig {
                    chiff: 0.3,
                    ..stop("Gedackt 8", "flute", &["Gedackt 8"], true)
                },
                StopConfig {
                    chiff: 0.2,
                    ..stop("Rohrflute 4", "flute", &["Rohrflute 4"], false)
                },
                stop("Gamba 8", "string", &["Gamba 8"], false),
            ],
            links: Vec::new(),
            tremulant: Some(TremulantConfig::default()),
            swell: true,
            gain: 1.0,
            midi_channels: 0b010,
        };
        let pedal = DivisionConfig {
            name: "Pedal".into(),
            stops: vec![
                StopConfig {
                    zones: vec![ZoneConfig {
                        range: [36, 67],
                        pipe: PipeNames::One("Subbass 16".into()),
                    }],
                    pipe: None,
                    ..stop("Subbass 16", "flute", &[], true)
                },
                StopConfig {
                    zones: vec![ZoneConfig {
                        range: [36, 67],
                        pipe: PipeNames::One("Principal 8".into()),
                    }],
                    pipe: None,
                    ..stop("Octave Bass 8", "principal", &[], false)
                },
            ],
            links: vec!["Great".into()],
            tremulant: None,
            swell: false,
            gain: 1.0,
            midi_channels: 0b100,
        };

        Self {
            divisions: vec![great, swell, pedal],
            sequencer: SequencerConfig::default(),
        }
    }
}

fn validate_stop(division: &str, stop: &StopConfig, registry: &ModelRegistry) -> Result<(), ConfigError> {
    let empty = || ConfigError::EmptyStop {
        division: division.to_string(),
        stop: stop.name.clone(),
    };
    let no_pipe = stop.pipe.as_ref().is_none_or(PipeNames::is_empty);
    if no_pipe && stop.zones.is_empty() {
        return Err(empty());
    }
    for zone in &stop.zones {
        let [low, high] = zone.range;
        if low > high || high > 127 {
            return Err(ConfigError::InvalidRange {
                stop: stop.name.clone(),
                low,
                high,
            });
        }
        if zone.pipe.is_empty() {
            return Err(empty());
        }
    }
    for pipe in stop.pipe_names() {
        if !registry.contains(pipe) {
            return Err(ConfigError::UnknownPipe {
                stop: stop.name.clone(),
                pipe: pipe.to_string(),
            });
        }
    }
    if !stop.kind.is_empty() && stop.stop_type() == StopType::Unknown {
        log::warn!("stop '{}' in '{division}' has unknown type '{}'", stop.name, stop.kind);
    }
    Ok(())
}
