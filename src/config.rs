use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "YOLO_PLAYER_CONFIG";

/// Largest accepted `input_size`.
pub const MAX_INPUT_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for the detector and the playback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path to the YOLOv8 ONNX export.
    pub model_path: PathBuf,
    /// Minimum class score for a candidate box to be kept.
    pub conf_threshold: f32,
    /// IoU above which overlapping boxes of the same class are suppressed.
    pub iou_threshold: f32,
    /// Side of the square every frame is resized to before detection.
    pub input_size: u32,
    /// Sleep between frames so playback does not outrun the source frame rate.
    pub throttle_to_source_fps: bool,
    pub always_on_top: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("yolov8s.onnx"),
            conf_threshold: 0.6,
            iou_threshold: 0.5,
            input_size: 640,
            throttle_to_source_fps: false,
            always_on_top: true,
        }
    }
}

impl AppConfig {
    /// Loads the config from the default location. See [`AppConfig::load_at`].
    pub fn load() -> Self {
        Self::load_at(&Self::config_path())
    }

    /// Loads the config at `config_path`, writing the defaults there when no
    /// file exists yet. Any problem falls back to the defaults.
    pub fn load_at(config_path: &Path) -> Self {
        if !config_path.exists() {
            log::info!("No config file found, creating default config");
            let config = Self::default();
            match config.save_to(config_path) {
                Ok(()) => log::info!("Created new config file at {}", config_path.display()),
                Err(e) => log::warn!("Could not write default config: {}", e),
            }
            return config;
        }

        match Self::load_from(config_path) {
            Ok(config) => {
                log::info!("Loaded config from {}", config_path.display());
                config
            }
            Err(e) => {
                log::warn!("Config file has issues ({}), using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("conf_threshold", self.conf_threshold),
            ("iou_threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.input_size == 0 || self.input_size % 32 != 0 || self.input_size > MAX_INPUT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "input_size must be a positive multiple of 32 up to {}, got {}",
                MAX_INPUT_SIZE, self.input_size
            )));
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("yolo-video-player")
            .join("config.json")
    }
}
