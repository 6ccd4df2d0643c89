// Configuration - Load settings from config.toml
//
// Provides sensible defaults if the config file is missing or has errors.
// The graphics section sizes the per-frame heaps; exceeding those sizes at
// runtime is treated as a bug, not a condition to recover from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Kiln".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    pub clear_color: [f32; 4],
    /// Frame-in-flight slot count; also the requested backbuffer count.
    pub frames_in_flight: u32,
    /// Per-slot upload heap size. Constants plus staged static data for one
    /// frame must fit.
    pub upload_heap_mib: u64,
    /// Slots per bindless descriptor table.
    pub descriptor_capacity: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            clear_color: [0.42, 0.14, 0.3, 1.0],
            frames_in_flight: 3,
            upload_heap_mib: 20,
            descriptor_capacity: 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            show_fps: true,
        }
    }
}

/// Compiled shader artifact paths. The renderer never compiles shaders;
/// these are opaque SPIR-V blobs produced by the build script.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: String,
    pub fragment: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: "shaders/mesh.vert.spv".to_string(),
            fragment: "shaders/mesh.frag.spv".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn upload_heap_bytes(&self) -> u64 {
        self.graphics.upload_heap_mib * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_renderer_assumptions() {
        let config = Config::default();
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.upload_heap_bytes(), 20 * 1024 * 1024);
        assert!(config.graphics.descriptor_capacity > 0);
    }

    #[test]
    fn partial_config_fills_missing_sections() {
        let config: Config = toml::from_str(
            r#"
            [window]
            width = 800
            height = 600

            [graphics]
            vsync = false
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 800);
        assert!(!config.graphics.vsync);
        // Unspecified fields keep their defaults.
        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(config.shaders.vertex, "shaders/mesh.vert.spv");
    }
}
