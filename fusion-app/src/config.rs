//! JSON system configuration.

use fusion_data::Intrinsics;
use fusion_map::{MapConfig, MapError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything needed to construct a [`crate::System`]. Fields missing from a
/// JSON file take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Calibration of the finest pyramid level.
    pub intrinsics: Intrinsics,
    pub pyramid_levels: usize,
    pub map: MapConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            intrinsics: Intrinsics::default(),
            pyramid_levels: 5,
            map: MapConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = Self::from_json(&fs::read_to_string(path)?)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let k = &self.intrinsics;
        if k.width == 0 || k.height == 0 {
            return Err(ConfigError::Invalid("image size must be non-zero".into()));
        }
        if !(k.fx > 0.0 && k.fy > 0.0) {
            return Err(ConfigError::Invalid("focal lengths must be positive".into()));
        }
        if self.pyramid_levels == 0 {
            return Err(ConfigError::Invalid("at least one pyramid level is required".into()));
        }
        self.map.validate().map_err(|e| match e {
            MapError::InvalidConfig(msg) => ConfigError::Invalid(msg),
            other => ConfigError::Invalid(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_json_is_default() {
        let config = SystemConfig::from_json("{}").unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn test_nested_overrides() {
        let json = r#"{
            "pyramid_levels": 3,
            "intrinsics": { "width": 320, "height": 240, "fx": 262.5, "fy": 262.5, "cx": 159.5, "cy": 119.5 },
            "map": { "voxel_size": 0.01, "truncation_distance": 0.04 }
        }"#;
        let config = SystemConfig::from_json(json).unwrap();
        assert_eq!(config.pyramid_levels, 3);
        assert_eq!(config.intrinsics.width, 320);
        assert_relative_eq!(config.map.voxel_size, 0.01);
        assert_relative_eq!(config.intrinsics.fx, 262.5);
        assert_eq!(config.map.bucket_count, MapConfig::default().bucket_count);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            SystemConfig::from_json(r#"{ "pyramid_levels": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SystemConfig::from_json(r#"{ "map": { "voxel_size": -1.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(SystemConfig::from_json("not json"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("fusion_config_{}.json", std::process::id()));
        let mut config = SystemConfig::default();
        config.pyramid_levels = 2;
        config.save(&path).unwrap();
        assert_eq!(SystemConfig::load(&path).unwrap(), config);
        std::fs::remove_file(&path).ok();
    }
}
