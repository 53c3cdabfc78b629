//! Configuration management for the view backend
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. Every section falls back to its defaults, so an empty
//! file yields the same behavior as no file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration struct for a view backend
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendConfig {
    /// Top-level window settings
    #[serde(default)]
    pub window: WindowConfig,

    /// Pointer cursor settings
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Shared-memory buffer allocation
    #[serde(default)]
    pub shm: ShmConfig,

    /// Platform (ivi) shell settings
    #[serde(default)]
    pub ivi: IviConfig,

    /// DRM global proxy settings
    #[serde(default)]
    pub drm: DrmConfig,
}

/// Top-level window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Title set on every top-level shell role
    pub title: String,
}

/// Cursor theme configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CursorConfig {
    /// Load a theme and select a cursor at all
    pub enabled: bool,

    /// Theme name; the system default theme when unset
    pub theme: Option<String>,

    /// Cursor size in pixels
    pub size: u32,

    /// Cursor selected from the theme
    pub name: String,
}

/// Shared-memory allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShmConfig {
    /// Environment variable naming the directory backing files are created in
    pub runtime_dir_var: String,

    /// File name prefix of the backing files; six random characters follow
    pub file_prefix: String,
}

/// Platform shell configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IviConfig {
    /// Added to the process id to form the ivi surface id
    pub surface_id_base: u32,
}

/// DRM proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrmConfig {
    /// Re-publish the upstream wl_drm global to nested clients
    pub enabled: bool,

    /// Highest wl_drm version offered to nested clients
    pub max_version: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "WPE".to_string(),
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            theme: None,
            size: 32,
            name: "left_ptr".to_string(),
        }
    }
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            runtime_dir_var: "XDG_RUNTIME_DIR".to_string(),
            file_prefix: "WPE-shared-".to_string(),
        }
    }
}

impl Default for IviConfig {
    fn default() -> Self {
        Self {
            surface_id_base: 4200,
        }
    }
}

impl IviConfig {
    /// The ivi surface id used by this process.
    pub fn surface_id(&self) -> u32 {
        self.surface_id_base.wrapping_add(std::process::id())
    }
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_version: 2,
        }
    }
}

impl BackendConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: BackendConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.window.title.is_empty() {
            anyhow::bail!("Invalid window title: must not be empty");
        }

        if self.cursor.name.is_empty() {
            anyhow::bail!("Invalid cursor name: must not be empty");
        }

        if self.cursor.size == 0 || self.cursor.size > 256 {
            anyhow::bail!("Invalid cursor size: must be between 1 and 256");
        }

        if self.shm.runtime_dir_var.is_empty() {
            anyhow::bail!("Invalid runtime_dir_var: must not be empty");
        }

        if self.shm.file_prefix.contains('/') {
            anyhow::bail!("Invalid file_prefix: must not contain '/'");
        }

        if !(1..=2).contains(&self.drm.max_version) {
            anyhow::bail!("Invalid drm max_version: must be 1 or 2");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
