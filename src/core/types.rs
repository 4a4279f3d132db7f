use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::core::error::{EnvError, EnvResult};

/// A named, isolated instance of the managed application, backed by one
/// container. This is the registry record; the live container is reached
/// through `container_runtime_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub image_reference: String,
    pub kind: EnvironmentKind,
    pub status: EnvironmentStatus,
    pub port_mappings: Vec<PortMapping>,
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub runtime_options: RuntimeOptions,
    /// Engine identifier of the backing container. Set once a container has
    /// been created, survives stop/start, cleared only on deletion.
    #[serde(default)]
    pub container_runtime_id: Option<String>,
    /// Source environment id if this record was produced by duplication.
    /// Historical back-reference only, never an ownership edge.
    #[serde(default)]
    pub lineage: Option<String>,
    /// Failure reason retained while status is `Error`.
    #[serde(default)]
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Host ports this record reserves. Reserved ports stay out of the free
    /// pool for every status except `Deleting`.
    pub fn host_ports(&self) -> Vec<u16> {
        self.port_mappings.iter().map(|m| m.host_port).collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Created,
    Running,
    Stopped,
    Error,
    Deleting,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentStatus::Created => write!(f, "created"),
            EnvironmentStatus::Running => write!(f, "running"),
            EnvironmentStatus::Stopped => write!(f, "stopped"),
            EnvironmentStatus::Error => write!(f, "error"),
            EnvironmentStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// Default environments bind the fixed input/output host directories; custom
/// environments bring their own host paths.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Default,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

/// One host directory bound into the container. Order matters: later entries
/// take overlay precedence inside the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

/// Recognized runtime options with documented effects, plus `engine_flags` as
/// a narrowly-scoped passthrough applied as engine labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeOptions {
    /// Request all host GPUs for the container.
    #[serde(default)]
    pub gpu: bool,
    /// Extra `KEY=VALUE` container environment variables.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Override of the container command.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub memory_limit_bytes: Option<i64>,
    #[serde(default)]
    pub nano_cpus: Option<i64>,
    #[serde(default)]
    pub engine_flags: BTreeMap<String, String>,
}

const NAME_MAX_LEN: usize = 63;

/// Validates a user-facing environment name: alphanumeric first character,
/// then alphanumeric plus hyphen/underscore, 2 to 63 characters.
pub fn validate_name(name: &str) -> EnvResult<()> {
    if name.len() < 2 || name.len() > NAME_MAX_LEN {
        return Err(EnvError::Validation(format!(
            "environment name must be 2 to {} characters, got {}",
            NAME_MAX_LEN,
            name.len()
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or(' ');
    if !first.is_ascii_alphanumeric() {
        return Err(EnvError::Validation(
            "environment name must start with an alphanumeric character".to_string(),
        ));
    }
    if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_') {
        return Err(EnvError::Validation(format!(
            "environment name contains invalid character {:?}; only alphanumerics, hyphen and underscore are allowed",
            bad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["comfy-env-01", "env_2", "A1"] {
            assert!(validate_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "x", "-lead", "has space", "dot.ted", "sl/ash"] {
            assert!(validate_name(name).is_err(), "{name} should be rejected");
        }
        let long = "a".repeat(64);
        assert!(validate_name(&long).is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&EnvironmentStatus::Running).unwrap();
        assert_eq!(s, "\"running\"");
    }
}
