// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Engine configuration: audio/video format parameters and persistence.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Audio format parameters for the mixer and encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count per mix bus.
    pub channels: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// Video format parameters for the renderer feed and encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Frame rate numerator.
    pub fps_num: u32,
    /// Frame rate denominator.
    pub fps_den: u32,
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps_num: 30,
            fps_den: 1,
            width: 1920,
            height: 1080,
        }
    }
}

impl VideoConfig {
    /// Interval between frames in nanoseconds.
    pub fn frame_interval_ns(&self) -> u64 {
        crate::util::time::mul_div64(1_000_000_000, self.fps_den as u64, self.fps_num as u64)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl EngineConfig {
    /// Validate format parameters. Zero rates or sizes are rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("audio sample rate is zero".into()));
        }
        if self.audio.channels == 0 || self.audio.channels > crate::MAX_AUDIO_CHANNELS {
            return Err(ConfigError::Invalid(format!(
                "audio channel count {} out of range",
                self.audio.channels
            )));
        }
        if self.video.fps_num == 0 || self.video.fps_den == 0 {
            return Err(ConfigError::Invalid("video frame rate is zero".into()));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid("video canvas size is zero".into()));
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Manages configuration file persistence.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a config manager rooted at the platform config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let project_dirs =
            ProjectDirs::from("", "", "cindercast").ok_or(ConfigError::NoConfigDir)?;
        let config_dir = project_dirs.config_dir().to_path_buf();
        fs::create_dir_all(&config_dir)?;
        Ok(Self { config_dir })
    }

    /// Create a config manager rooted at an explicit directory.
    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        fs::create_dir_all(&config_dir)?;
        Ok(Self { config_dir })
    }

    /// Path of the main engine config file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("engine.toml")
    }

    /// Load the engine config, falling back to defaults if absent.
    pub fn load(&self) -> Result<EngineConfig, ConfigError> {
        let path = self.config_path();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let config = EngineConfig::from_toml(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            info!("No engine config at {:?}, using defaults", path);
            Ok(EngineConfig::default())
        }
    }

    /// Save the engine config.
    pub fn save(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        fs::write(self.config_path(), config.to_toml()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_rate_rejected() {
        let mut config = EngineConfig::default();
        config.audio.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn frame_interval() {
        let video = VideoConfig {
            fps_num: 30,
            fps_den: 1,
            ..VideoConfig::default()
        };
        assert_eq!(video.frame_interval_ns(), 33_333_333);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path()).unwrap();

        let mut config = EngineConfig::default();
        config.audio.sample_rate = 44_100;
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, config);
    }
}
