use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::core::{EnvError, EnvResult, EnvironmentKind, MountMode, MountSpec};

/// Computes the host-directory bindings for an environment. Default
/// environments get the fixed input/output directories; custom environments
/// bring their own paths, validated against the configured mount-root policy.
pub struct MountResolver {
    input_dir: PathBuf,
    output_dir: PathBuf,
    container_data_dir: String,
    allowed_roots: Vec<PathBuf>,
}

impl MountResolver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            input_dir: settings.input_dir.clone(),
            output_dir: settings.output_dir.clone(),
            container_data_dir: settings.container_data_dir.clone(),
            allowed_roots: settings.allowed_mount_roots.clone(),
        }
    }

    /// Resolves the ordered mount list for a new environment. Caller ordering
    /// of custom mounts is preserved; ordering affects overlay precedence in
    /// the container.
    pub fn resolve(
        &self,
        kind: EnvironmentKind,
        requested: &[MountSpec],
    ) -> EnvResult<Vec<MountSpec>> {
        match kind {
            EnvironmentKind::Default => self.default_mounts(),
            EnvironmentKind::Custom => self.custom_mounts(requested),
        }
    }

    fn default_mounts(&self) -> EnvResult<Vec<MountSpec>> {
        let mut mounts = Vec::with_capacity(2);
        for (host, subdir) in [(&self.input_dir, "input"), (&self.output_dir, "output")] {
            if !host.exists() {
                std::fs::create_dir_all(host).map_err(|e| {
                    EnvError::Validation(format!(
                        "cannot create default mount directory {}: {e}",
                        host.display()
                    ))
                })?;
            }
            mounts.push(MountSpec {
                host_path: host.clone(),
                container_path: format!("{}/{subdir}", self.container_data_dir),
                mode: MountMode::ReadWrite,
            });
        }
        Ok(mounts)
    }

    fn custom_mounts(&self, requested: &[MountSpec]) -> EnvResult<Vec<MountSpec>> {
        let mut mounts = Vec::with_capacity(requested.len());
        for spec in requested {
            if !spec.host_path.exists() {
                return Err(EnvError::Validation(format!(
                    "mount host path {} does not exist",
                    spec.host_path.display()
                )));
            }
            if !spec.host_path.is_dir() {
                return Err(EnvError::Validation(format!(
                    "mount host path {} is not a directory",
                    spec.host_path.display()
                )));
            }
            self.check_allowed(&spec.host_path)?;
            mounts.push(spec.clone());
        }
        Ok(mounts)
    }

    /// Rejects host paths escaping every configured root. Canonicalizes both
    /// sides so `..` segments and symlinks cannot slip past the prefix check.
    fn check_allowed(&self, host_path: &Path) -> EnvResult<()> {
        if self.allowed_roots.is_empty() {
            return Ok(());
        }
        let canonical = host_path.canonicalize().map_err(|e| {
            EnvError::Validation(format!(
                "cannot resolve mount host path {}: {e}",
                host_path.display()
            ))
        })?;
        for root in &self.allowed_roots {
            if let Ok(root) = root.canonicalize() {
                if canonical.starts_with(&root) {
                    return Ok(());
                }
            }
        }
        Err(EnvError::Validation(format!(
            "mount host path {} escapes the allowed mount roots",
            host_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings_with(dir: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.input_dir = dir.join("input");
        settings.output_dir = dir.join("output");
        settings.allowed_mount_roots = Vec::new();
        settings
    }

    #[test]
    fn default_kind_binds_input_and_output_read_write() {
        let dir = tempdir().unwrap();
        let resolver = MountResolver::new(&settings_with(dir.path()));
        let mounts = resolver.resolve(EnvironmentKind::Default, &[]).unwrap();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].container_path, "/app/ComfyUI/input");
        assert_eq!(mounts[1].container_path, "/app/ComfyUI/output");
        assert!(mounts.iter().all(|m| m.mode == MountMode::ReadWrite));
        assert!(dir.path().join("input").is_dir());
        assert!(dir.path().join("output").is_dir());
    }

    #[test]
    fn custom_kind_preserves_caller_ordering() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        let resolver = MountResolver::new(&settings_with(dir.path()));
        let requested = vec![
            MountSpec {
                host_path: b.clone(),
                container_path: "/data/b".to_string(),
                mode: MountMode::ReadOnly,
            },
            MountSpec {
                host_path: a.clone(),
                container_path: "/data/a".to_string(),
                mode: MountMode::ReadWrite,
            },
        ];
        let mounts = resolver.resolve(EnvironmentKind::Custom, &requested).unwrap();
        assert_eq!(mounts, requested);
    }

    #[test]
    fn custom_kind_rejects_missing_and_non_directory_paths() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let resolver = MountResolver::new(&settings_with(dir.path()));

        let missing = MountSpec {
            host_path: dir.path().join("nope"),
            container_path: "/data".to_string(),
            mode: MountMode::ReadWrite,
        };
        assert!(matches!(
            resolver.resolve(EnvironmentKind::Custom, &[missing]),
            Err(EnvError::Validation(_))
        ));

        let not_dir = MountSpec {
            host_path: file,
            container_path: "/data".to_string(),
            mode: MountMode::ReadWrite,
        };
        assert!(matches!(
            resolver.resolve(EnvironmentKind::Custom, &[not_dir]),
            Err(EnvError::Validation(_))
        ));
    }

    #[test]
    fn mount_root_policy_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let inside = dir.path().join("allowed").join("data");
        std::fs::create_dir_all(&inside).unwrap();
        let outside = tempdir().unwrap();

        let mut settings = settings_with(dir.path());
        settings.allowed_mount_roots = vec![dir.path().join("allowed")];
        let resolver = MountResolver::new(&settings);

        let ok = MountSpec {
            host_path: inside,
            container_path: "/data".to_string(),
            mode: MountMode::ReadWrite,
        };
        assert!(resolver.resolve(EnvironmentKind::Custom, &[ok]).is_ok());

        let escaping = MountSpec {
            host_path: outside.path().to_path_buf(),
            container_path: "/data".to_string(),
            mode: MountMode::ReadWrite,
        };
        assert!(matches!(
            resolver.resolve(EnvironmentKind::Custom, &[escaping]),
            Err(EnvError::Validation(_))
        ));
    }
}
