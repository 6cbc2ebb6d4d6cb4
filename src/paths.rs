//! Per-user locations of organ configurations, pipe models and impulse
//! responses, and the loaders that read them.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::config::{EngineSettings, OrganConfig};
use crate::engine::Engine;
use crate::error::OrganError;
use crate::model::ModelRegistry;
use crate::state::EngineState;

#[derive(Debug, Clone)]
pub struct OrganPaths {
    config: PathBuf,
    data: PathBuf,
}

impl OrganPaths {
    /// `None` when the platform has no home directory.
    pub fn new() -> Option<Self> {
        let dirs = ProjectDirs::from("org", "organ", "organ_core")?;
        Some(Self {
            config: dirs.config_dir().to_path_buf(),
            data: dirs.data_dir().to_path_buf(),
        })
    }

    /// Keep everything under one directory, for portable installs.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config: root.join("config"),
            data: root.join("data"),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config
    }

    /// The organ configuration loaded when none is given.
    pub fn organ_file(&self) -> PathBuf {
        self.config.join("organ.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.config.join("state.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data.join("pipes")
    }

    pub fn impulse_responses_dir(&self) -> PathBuf {
        self.data.join("ir")
    }

    /// Where an impulse response named `name` lives. An absolute `name` is
    /// returned unchanged.
    pub fn impulse_response(&self, name: &str) -> PathBuf {
        self.impulse_responses_dir().join(name)
    }

    /// The built-in models plus any found in [`models_dir`](Self::models_dir).
    /// A user model whose name is already taken is skipped.
    pub fn model_registry(&self) -> Result<ModelRegistry, OrganError> {
        let mut registry = ModelRegistry::builtin();
        let dir = self.models_dir();
        if dir.is_dir() {
            registry.load_dir(&dir, None)?;
        }
        Ok(registry)
    }

    /// The user's organ, or the built-in one when there is no organ file.
    pub fn load_organ(&self) -> Result<OrganConfig, OrganError> {
        let file = self.organ_file();
        if file.is_file() {
            OrganConfig::load_file(&file)
        } else {
            Ok(OrganConfig::default_organ())
        }
    }

    pub fn load_state(&self) -> Result<Option<EngineState>, OrganError> {
        let file = self.state_file();
        if !file.is_file() {
            return Ok(None);
        }
        let json = fs::read_to_string(&file)?;
        EngineState::from_json(&json).map(Some)
    }

    pub fn save_state(&self, state: &EngineState) -> Result<(), OrganError> {
        fs::create_dir_all(&self.config)?;
        fs::write(self.state_file(), state.to_json()?)?;
        log::info!("saved organ state to {}", self.state_file().display());
        Ok(())
    }

    /// Build the user's organ on the user's models and bring back the last
    /// saved state. A state that no longer fits the organ is logged and
    /// left out.
    pub fn build_engine(&self, settings: &EngineSettings) -> Result<Engine, OrganError> {
        let registry = self.model_registry()?;
        let mut engine = Engine::new(&self.load_organ()?, &registry, settings)?;
        if let Some(mut state) = self.load_state()? {
            if let Some(ir) = state.ir.take() {
                state.ir = Some(self.impulse_response(&ir).display().to_string());
            }
            if let Err(e) = engine.restore_state(&state) {
                log::warn!("saved state not restored: {e}");
            }
        }
        Ok(engine)
    }
}
