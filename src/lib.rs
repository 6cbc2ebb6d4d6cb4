pub mod config;
pub mod consts;
pub mod controls;
pub mod division;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod model;
pub mod param;
#[cfg(feature = "user-dirs")]
pub mod paths;
pub mod pipewave;
pub mod rankwave;
pub mod scale;
pub mod sequencer;
pub mod state;
pub mod stop;
pub mod voice;

use serde::Serialize;
use wasm_bindgen::prelude::*;

use crate::config::{EngineSettings, OrganConfig};
use crate::dsp::renderer::{self, RenderRequest};
use crate::engine::Engine;
use crate::error::OrganError;
use crate::model::ModelRegistry;

pub use crate::engine::MidiMessage;
#[cfg(feature = "user-dirs")]
pub use crate::paths::OrganPaths;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the organ_core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// Build the built-in organ, or the one described by `config_json`, on the
/// built-in pipe models.
pub fn build_engine(config_json: Option<&str>, settings: &EngineSettings) -> Result<Engine, OrganError> {
    let config = match config_json {
        Some(json) => OrganConfig::from_json(json)?,
        None => OrganConfig::default_organ(),
    };
    Engine::new(&config, &ModelRegistry::builtin(), settings)
}

fn render_request(request_json: &str, sample_rate: u32) -> Result<(Vec<f32>, Vec<f32>), OrganError> {
    let request: RenderRequest = serde_json::from_str(request_json)?;
    let mut engine = build_engine(None, &EngineSettings::default())?;
    if !request.registration.is_empty() {
        renderer::apply_registration(&mut engine, &request.registration);
    }
    Ok(renderer::render_stereo(&mut engine, &request.notes, sample_rate, request.tail))
}

/// WASM-exposed: render a JSON render request on the built-in organ to a
/// 16-bit stereo WAV byte array.
#[wasm_bindgen]
pub fn render_organ_wav(request_json: &str, sample_rate: u32) -> Result<Vec<u8>, JsValue> {
    let (left, right) = render_request(request_json, sample_rate).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    renderer::encode_wav(&left, &right, sample_rate).map_err(|e| JsValue::from_str(&format!("{e}")))
}

/// WASM-exposed: render a JSON render request to interleaved stereo f32
/// samples for AudioWorklet playback.
#[wasm_bindgen]
pub fn render_organ_samples(request_json: &str, sample_rate: u32) -> Result<Vec<f32>, JsValue> {
    let (left, right) = render_request(request_json, sample_rate).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    Ok(renderer::interleave(&left, &right))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DivisionStops {
    pub division: String,
    pub stops: Vec<String>,
}

/// Stop names per division of an organ configuration.
pub fn stop_names(config: &OrganConfig) -> Vec<DivisionStops> {
    config
        .divisions
        .iter()
        .map(|d| DivisionStops {
            division: d.name.clone(),
            stops: d.stops.iter().map(|s| s.name.clone()).collect(),
        })
        .collect()
}

/// WASM-exposed: list the stops of `config_json`, or of the built-in organ.
#[wasm_bindgen]
pub fn organ_stop_names(config_json: Option<String>) -> Result<JsValue, JsValue> {
    let config = match config_json {
        Some(json) => OrganConfig::from_json(&json).map_err(|e| JsValue::from_str(&format!("{e}")))?,
        None => OrganConfig::default_organ(),
    };
    serde_wasm_bindgen::to_value(&stop_names(&config)).map_err(|e| JsValue::from_str(&format!("{e}")))
}
