//! Configuration management for keystone-cam

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::blur::BlurConfig;
use crate::decode::DecoderConfig;
use crate::rectify::RectifierConfig;

/// Preview server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 8091,
        }
    }
}

/// Frame worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds between throughput log lines
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Delay between frames fed from files, emulating a camera frame rate
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
}

fn default_stats_interval() -> u64 { 10 }
fn default_frame_interval() -> u64 { 33 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval(),
            frame_interval_ms: default_frame_interval(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub rectifier: RectifierConfig,

    #[serde(default)]
    pub decoder: DecoderConfig,

    #[serde(default)]
    pub blur: BlurConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rectify::{AspectRatio, OutputFormat};

    #[test]
    fn test_default_policy_values() {
        let config = Config::default();
        assert_eq!(config.rectifier.calibration_width, 1200.0);
        assert_eq!(config.rectifier.calibration_height, 1600.0);
        assert_eq!(config.rectifier.target_aspect, AspectRatio::new(4, 3));
        assert_eq!(config.rectifier.output_format, OutputFormat::Rgb565);
        assert!(config.decoder.jpeg_round_trip);
        assert_eq!(config.decoder.jpeg_quality, 100);
        assert!(!config.server.enabled);
    }

    #[test]
    fn test_create_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.rectifier.anchors, created.rectifier.anchors);
        assert_eq!(reloaded.server.port, created.server.port);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[blur]\nenabled = false\n\n[decoder]\ncolor_space = \"bt709\"\n",
        )
        .unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert!(!config.blur.enabled);
        assert_eq!(config.blur.radius, 25.0);
        assert_eq!(config.decoder.color_space, crate::decode::ColorSpace::Bt709);
        assert_eq!(config.rectifier.target_aspect, AspectRatio::new(4, 3));
    }

    #[test]
    fn test_partial_rectifier_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[rectifier]\noutput_format = \"rgb888\"\n\n[rectifier.target_aspect]\nwidth = 16\nheight = 9\n",
        )
        .unwrap();

        let config = Config::load_or_create(&path).unwrap();
        assert_eq!(config.rectifier.output_format, OutputFormat::Rgb888);
        assert_eq!(config.rectifier.target_aspect, AspectRatio::new(16, 9));
        assert_eq!(config.rectifier.calibration_width, 1200.0);
    }

    #[test]
    fn test_invalid_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[rectifier\n").unwrap();
        assert!(Config::load_or_create(&path).is_err());
    }
}
