use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::track::DEFAULT_OVERLAP_TOLERANCE;

/// Engine tunables, read from `<config dir>/daw/engine.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Preferred device sample rate. The device may pick another.
    pub sample_rate_hint: Option<u32>,
    /// Samples per analysis frame handed out on every poll.
    pub analyser_frame_size: usize,
    pub max_volume: f64,
    pub initial_volume: f64,
    /// Seconds two sequences may overlap before the track rejects them.
    pub overlap_tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hint: None,
            analyser_frame_size: 1024,
            max_volume: 3.0,
            initial_volume: 1.0,
            overlap_tolerance: DEFAULT_OVERLAP_TOLERANCE,
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("daw").join("engine.toml"))
    }

    /// Load the user config, falling back to defaults when it is missing or
    /// unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!("{err}, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(|(field, reason)| ConfigError::Invalid {
            path: path.to_path_buf(),
            field,
            reason,
        })?;
        Ok(config)
    }

    /// First field that is out of range, with the reason.
    pub fn validate(&self) -> Result<(), (&'static str, &'static str)> {
        if !(self.max_volume.is_finite() && self.max_volume >= 0.0) {
            return Err(("max_volume", "must be finite and >= 0"));
        }
        if !(self.initial_volume.is_finite() && self.initial_volume >= 0.0) {
            return Err(("initial_volume", "must be finite and >= 0"));
        }
        if !(self.overlap_tolerance.is_finite() && self.overlap_tolerance >= 0.0) {
            return Err(("overlap_tolerance", "must be finite and >= 0"));
        }
        if self.analyser_frame_size == 0 {
            return Err(("analyser_frame_size", "must be > 0"));
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|err| io_error(std::io::Error::other(err)))?;
        fs::write(path, contents).map_err(io_error)
    }
}
