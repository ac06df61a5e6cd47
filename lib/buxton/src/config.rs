use crate::layer::Layer;
use crate::{BUXTON_CONF_FILE, BUXTON_CONF_FILE_ENV, BUXTON_SOCKET};
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Daemon configuration: where databases live, where the socket goes,
/// and the layer definitions. Parsed once at startup; layers are
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    #[serde(default)]
    pub socket: Option<PathBuf>,
    pub layers: Vec<Layer>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    /// A configuration that parsed but cannot run (no layers, duplicate
    /// layer names).
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "error reading config file: {}", e),
            ConfigError::Parse(e) => write!(f, "error parsing config file: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> ConfigError {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> ConfigError {
        ConfigError::Parse(e)
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration file path: explicit override, then the
    /// `BUXTON_CONF_FILE` environment variable, then the default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_owned();
        }
        if let Ok(path) = env::var(BUXTON_CONF_FILE_ENV) {
            return PathBuf::from(path);
        }
        PathBuf::from(BUXTON_CONF_FILE)
    }

    /// The socket path, falling back to the compiled-in default.
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(BUXTON_SOCKET))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.is_empty() {
            return Err(ConfigError::Invalid("no layers configured".into()));
        }

        let mut names: Vec<&str> = self.layers.iter().map(|l| l.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.layers.len() {
            return Err(ConfigError::Invalid("duplicate layer names".into()));
        }

        Ok(())
    }
}
