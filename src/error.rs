use std::fmt;

#[derive(Debug)]
pub enum OrganError {
    Config(ConfigError),
    Model(ModelError),
    State(StateError),
    Json(serde_json::Error),
    Io(std::io::Error),
    Wav(hound::Error),
}

/// Organ topology problems, reported before audio starts.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    NoDivisions,
    UnknownPipe { stop: String, pipe: String },
    EmptyStop { division: String, stop: String },
    InvalidRange { stop: String, low: u8, high: u8 },
    UnknownLinkTarget { division: String, target: String },
    TooManyStops { division: String, count: usize },
    TooManyDivisions(usize),
    DuplicateDivision(String),
    InvalidTremulantDepth { division: String, depth: f32 },
}

/// Malformed pipe model data.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    BadSignature,
    Truncated { what: &'static str },
    InvalidNoteRange { min: u8, max: u8 },
    InvalidRatio { fn_: u8, fd: u8 },
    UnknownFormat(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateError {
    DivisionCountMismatch { expected: usize, found: usize },
}

impl fmt::Display for OrganError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrganError::Config(e) => write!(f, "Configuration error: {e}"),
            OrganError::Model(e) => write!(f, "Pipe model error: {e}"),
            OrganError::State(e) => write!(f, "State error: {e}"),
            OrganError::Json(e) => write!(f, "JSON error: {e}"),
            OrganError::Io(e) => write!(f, "I/O error: {e}"),
            OrganError::Wav(e) => write!(f, "WAV error: {e}"),
        }
    }
}

impl std::error::Error for OrganError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrganError::Config(e) => Some(e),
            OrganError::Model(e) => Some(e),
            OrganError::State(e) => Some(e),
            OrganError::Json(e) => Some(e),
            OrganError::Io(e) => Some(e),
            OrganError::Wav(e) => Some(e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoDivisions => write!(f, "Organ has no divisions"),
            ConfigError::UnknownPipe { stop, pipe } => {
                write!(f, "Stop '{stop}' references unknown pipe '{pipe}'")
            }
            ConfigError::EmptyStop { division, stop } => {
                write!(f, "Stop '{stop}' in division '{division}' has no pipes")
            }
            ConfigError::InvalidRange { stop, low, high } => {
                write!(f, "Stop '{stop}' has invalid key range {low}..={high}")
            }
            ConfigError::UnknownLinkTarget { division, target } => {
                write!(f, "Division '{division}' links to unknown division '{target}'")
            }
            ConfigError::TooManyStops { division, count } => {
                write!(f, "Division '{division}' has {count} stops, at most 64 are supported")
            }
            ConfigError::TooManyDivisions(count) => {
                write!(f, "Organ has {count} divisions, at most 64 are supported")
            }
            ConfigError::DuplicateDivision(name) => write!(f, "Division '{name}' is defined twice"),
            ConfigError::InvalidTremulantDepth { division, depth } => {
                write!(f, "Division '{division}' has tremulant depth {depth}, expected 0 to 1")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::BadSignature => write!(f, "Invalid header signature"),
            ModelError::Truncated { what } => write!(f, "Unexpected end of data reading {what}"),
            ModelError::InvalidNoteRange { min, max } => write!(f, "Invalid note range {min}..={max}"),
            ModelError::InvalidRatio { fn_, fd } => write!(f, "Invalid frequency ratio {fn_}/{fd}"),
            ModelError::UnknownFormat(ext) => write!(f, "Unknown pipe model format '{ext}'"),
        }
    }
}

impl std::error::Error for ModelError {}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::DivisionCountMismatch { expected, found } => {
                write!(f, "State has {found} divisions, organ has {expected}")
            }
        }
    }
}

impl std::error::Error for StateError {}

impl From<ConfigError> for OrganError {
    fn from(e: ConfigError) -> Self {
        OrganError::Config(e)
    }
}

impl From<ModelError> for OrganError {
    fn from(e: ModelError) -> Self {
        OrganError::Model(e)
    }
}

impl From<StateError> for OrganError {
    fn from(e: StateError) -> Self {
        OrganError::State(e)
    }
}

impl From<serde_json::Error> for OrganError {
    fn from(e: serde_json::Error) -> Self {
        OrganError::Json(e)
    }
}

impl From<std::io::Error> for OrganError {
    fn from(e: std::io::Error) -> Self {
        OrganError::Io(e)
    }
}

impl From<hound::Error> for OrganError {
    fn from(e: hound::Error) -> Self {
        OrganError::Wav(e)
    }
}
