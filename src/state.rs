//! Serializable snapshot of everything a performer can change.
//!
//! The engine produces and consumes these values; storing them is left to
//! the host.

use serde::{Deserialize, Serialize};

use crate::consts::TUNING_FREQUENCY_DEFAULT;
use crate::controls::ALL_MIDI_CHANNELS;
use crate::error::OrganError;
use crate::scale::Temperament;
use crate::sequencer::SequencerState;

fn all_channels() -> u16 {
    ALL_MIDI_CHANNELS
}

/// Registration and routing of one division.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DivisionState {
    #[serde(default)]
    pub stops: Vec<bool>,
    #[serde(default)]
    pub tremulant: bool,
    #[serde(default)]
    pub links: Vec<bool>,
    #[serde(default = "all_channels")]
    pub midi_channels_mask: u16,
}

impl Default for DivisionState {
    fn default() -> Self {
        Self {
            stops: Vec::new(),
            tremulant: false,
            links: Vec::new(),
            midi_channels_mask: ALL_MIDI_CHANNELS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningState {
    pub frequency: f32,
    #[serde(default)]
    pub temperament: Temperament,
}

impl Default for TuningState {
    fn default() -> Self {
        Self {
            frequency: TUNING_FREQUENCY_DEFAULT,
            temperament: Temperament::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    #[serde(default = "all_channels")]
    pub midi_ctrl_channels_mask: u16,
    #[serde(default = "all_channels")]
    pub midi_swell_channels_mask: u16,
    /// Path or name of the impulse response in use, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ir: Option<String>,
    #[serde(default)]
    pub tuning: TuningState,
    #[serde(default)]
    pub divisions: Vec<DivisionState>,
    #[serde(default)]
    pub sequencer: SequencerState,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            midi_ctrl_channels_mask: ALL_MIDI_CHANNELS,
            midi_swell_channels_mask: ALL_MIDI_CHANNELS,
            ir: None,
            tuning: TuningState::default(),
            divisions: Vec::new(),
            sequencer: SequencerState::default(),
        }
    }
}

impl EngineState {
    pub fn from_json(s: &str) -> Result<Self, OrganError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String, OrganError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{Step, StepDivision};

    #[test]
    fn json_round_trip() {
        let state = EngineState {
            midi_ctrl_channels_mask: 0b1000_0000_0000_0000,
            ir: Some("hall.wav".into()),
            tuning: TuningState {
                frequency: 415.0,
                temperament: Temperament::Werckm3,
            },
            divisions: vec![DivisionState {
                stops: vec![true, false, true],
                tremulant: true,
                links: vec![false],
                midi_channels_mask: 0b1,
            }],
            sequencer: SequencerState {
                steps: vec![Step {
                    divisions: vec![StepDivision {
                        stops: vec![false, true, false],
                        tremulant: false,
                    }],
                }],
                current_step: 0,
            },
            ..EngineState::default()
        };
        let json = state.to_json().expect("serialize");
        assert!(json.contains("midiCtrlChannelsMask"), "got {json}");
        assert_eq!(EngineState::from_json(&json).expect("parse"), state);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let state = EngineState::from_json(r#"{ "divisions": [ { "stops": [true] } ] }"#).expect("parse");
        assert_eq!(state.midi_swell_channels_mask, ALL_MIDI_CHANNELS);
        assert_eq!(state.tuning.frequency, 440.0);
        assert_eq!(state.divisions[0].midi_channels_mask, ALL_MIDI_CHANNELS);
        assert!(!state.divisions[0].tremulant);
        assert!(state.ir.is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(EngineState::from_json("[1, 2"), Err(OrganError::Json(_))));
    }
}
