//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization and the
//! defaults the backend relies on when no file is given.

use super::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() -> Result<()> {
    let config = BackendConfig::default();

    assert_eq!(config.window.title, "WPE");
    assert!(config.cursor.enabled);
    assert_eq!(config.cursor.theme, None);
    assert_eq!(config.cursor.size, 32);
    assert_eq!(config.cursor.name, "left_ptr");
    assert_eq!(config.shm.runtime_dir_var, "XDG_RUNTIME_DIR");
    assert_eq!(config.shm.file_prefix, "WPE-shared-");
    assert_eq!(config.ivi.surface_id_base, 4200);
    assert!(config.drm.enabled);
    assert_eq!(config.drm.max_version, 2);

    config.validate()
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let mut original = BackendConfig::default();
    original.cursor.theme = Some("Adwaita".to_string());
    original.window.title = "Nested".to_string();

    let toml_string = toml::to_string(&original)?;
    let deserialized: BackendConfig = toml::from_str(&toml_string)?;

    assert_eq!(original, deserialized);
    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("backend.toml");

    let test_config = r#"
[window]
title = "Browser"

[cursor]
enabled = true
theme = "Adwaita"
size = 48
name = "default"

[shm]
runtime_dir_var = "NESTED_RUNTIME_DIR"
file_prefix = "nested-"

[ivi]
surface_id_base = 9000

[drm]
enabled = false
max_version = 1
"#;

    fs::write(&file_path, test_config)?;

    let config = BackendConfig::load(&file_path)?;

    assert_eq!(config.window.title, "Browser");
    assert_eq!(config.cursor.theme.as_deref(), Some("Adwaita"));
    assert_eq!(config.cursor.size, 48);
    assert_eq!(config.cursor.name, "default");
    assert_eq!(config.shm.runtime_dir_var, "NESTED_RUNTIME_DIR");
    assert_eq!(config.shm.file_prefix, "nested-");
    assert_eq!(config.ivi.surface_id_base, 9000);
    assert!(!config.drm.enabled);
    assert_eq!(config.drm.max_version, 1);

    Ok(())
}

#[test]
fn test_partial_configuration_uses_defaults() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("partial.toml");

    fs::write(&file_path, "[cursor]\nsize = 24\n")?;

    let config = BackendConfig::load(&file_path)?;

    assert_eq!(config.cursor.size, 24);
    assert_eq!(config.cursor.name, "left_ptr");
    assert_eq!(config.window, WindowConfig::default());
    assert_eq!(config.drm, DrmConfig::default());

    Ok(())
}

#[test]
fn test_empty_file_is_default() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("empty.toml");
    fs::write(&file_path, "")?;

    assert_eq!(BackendConfig::load(&file_path)?, BackendConfig::default());
    Ok(())
}

#[test]
fn test_invalid_configurations_are_rejected() {
    let mut config = BackendConfig::default();
    config.window.title.clear();
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.cursor.name.clear();
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.cursor.size = 0;
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.cursor.size = 257;
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.shm.runtime_dir_var.clear();
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.shm.file_prefix = "sub/dir-".to_string();
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.drm.max_version = 3;
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.drm.max_version = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_load_rejects_invalid_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad.toml");
    fs::write(&file_path, "[cursor]\nsize = 0\n")?;

    assert!(BackendConfig::load(&file_path).is_err());
    Ok(())
}

#[test]
fn test_load_reports_parse_errors() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("broken.toml");
    fs::write(&file_path, "[window\ntitle = ")?;

    let err = BackendConfig::load(&file_path).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
    Ok(())
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = BackendConfig::default();
    config.ivi.surface_id_base = 100;
    config.cursor.enabled = false;
    config.save(&file_path)?;

    let reloaded = BackendConfig::load(&file_path)?;
    assert_eq!(reloaded, config);
    Ok(())
}

#[test]
fn test_ivi_surface_id_is_offset_by_pid() {
    let ivi = IviConfig {
        surface_id_base: 4200,
    };
    assert_eq!(ivi.surface_id(), 4200u32.wrapping_add(std::process::id()));
}
