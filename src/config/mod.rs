use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process-wide defaults, read once at startup. Everything per-environment
/// lives in the registry instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Registry file holding one record per environment.
    pub registry_path: PathBuf,
    /// Image used when a create request does not name one.
    pub default_image: String,
    /// Preferred host port for the first environment's primary port.
    pub default_port: u16,
    /// Scan range for further host port allocations.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Container-side port the application listens on.
    pub container_port: u16,
    /// Fixed host directories bound read-write into `default` environments.
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Application data root inside the container. Duplication copies this
    /// subtree; default mounts bind under it.
    pub container_data_dir: String,
    /// When non-empty, custom mount host paths must live under one of these
    /// roots.
    pub allowed_mount_roots: Vec<PathBuf>,
    /// Upper bound on any single container-runtime call.
    pub runtime_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let base = base_directory();
        Self {
            registry_path: base.join("environments.json"),
            default_image: "akatzai/comfyui-env:latest".to_string(),
            default_port: 8188,
            port_range_start: 8189,
            port_range_end: 8288,
            container_port: 8188,
            input_dir: base.join("input"),
            output_dir: base.join("output"),
            container_data_dir: "/app/ComfyUI".to_string(),
            allowed_mount_roots: Vec::new(),
            runtime_timeout_secs: 360,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or returns defaults when the file does not
    /// exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_settings_path() -> PathBuf {
        base_directory().join("settings.toml")
    }
}

fn base_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".envdock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("settings.toml")).unwrap();
        assert_eq!(settings.default_port, 8188);
        assert_eq!(settings.container_data_dir, "/app/ComfyUI");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = Settings::default();
        settings.default_port = 9000;
        settings.allowed_mount_roots = vec![dir.path().to_path_buf()];
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.default_port, 9000);
        assert_eq!(loaded.allowed_mount_roots, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "registry_path = [not toml").unwrap();
        assert!(Settings::load(&path).is_err());
    }
}
