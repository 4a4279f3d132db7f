use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::models::{
    ContainerStateStatusEnum, DeviceRequest, HostConfig, Mount, MountTypeEnum, PortBinding,
};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::core::{EnvError, EnvResult, MountMode};
use crate::runtime::{ContainerRuntime, ContainerSpec, LogStream, ObservedState};

/// Seconds the engine waits before killing a container on stop. The managed
/// application shuts down quickly; a short grace period keeps deactivate snappy.
const STOP_GRACE_SECS: i64 = 2;

/// Bollard-backed adapter talking to the local Docker control socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> EnvResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EnvError::RuntimeUnavailable(format!("cannot reach Docker: {e}")))?;
        Ok(Self { docker })
    }
}

/// Engine-reported failures (the daemon answered with an error status) map to
/// `RuntimeOperationFailed`; everything else means we could not talk to the
/// daemon at all.
fn map_err(e: bollard::errors::Error) -> EnvError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => EnvError::RuntimeOperationFailed(format!("engine returned {status_code}: {message}")),
        other => EnvError::RuntimeUnavailable(other.to_string()),
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for mapping in &spec.port_mappings {
        let key = format!("{}/tcp", mapping.container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(mapping.host_port.to_string()),
            }]),
        );
    }

    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.container_path.clone()),
            source: Some(m.host_path.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.mode == MountMode::ReadOnly),
            ..Default::default()
        })
        .collect();

    let device_requests = if spec.options.gpu {
        Some(vec![DeviceRequest {
            count: Some(-1),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }])
    } else {
        None
    };

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        mounts: Some(mounts),
        memory: spec.options.memory_limit_bytes,
        nano_cpus: spec.options.nano_cpus,
        device_requests,
        ..Default::default()
    };

    let labels = if spec.options.engine_flags.is_empty() {
        None
    } else {
        Some(
            spec.options
                .engine_flags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec
            .options
            .command
            .as_ref()
            .map(|c| c.split_whitespace().map(str::to_string).collect()),
        env: if spec.options.environment.is_empty() {
            None
        } else {
            Some(spec.options.environment.clone())
        },
        exposed_ports: Some(exposed_ports),
        labels,
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> EnvResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| EnvError::RuntimeUnavailable(format!("Docker ping failed: {e}")))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> EnvResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> EnvResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), build_config(spec))
            .await
            .map_err(map_err)?;
        info!(container = %response.id, name = %spec.name, "created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> EnvResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)?;
        info!(container = %id, "started container");
        Ok(())
    }

    async fn stop(&self, id: &str) -> EnvResult<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(map_err)?;
        info!(container = %id, "stopped container");
        Ok(())
    }

    async fn pause(&self, id: &str) -> EnvResult<()> {
        self.docker.pause_container(id).await.map_err(map_err)
    }

    async fn unpause(&self, id: &str) -> EnvResult<()> {
        self.docker.unpause_container(id).await.map_err(map_err)
    }

    async fn remove(&self, id: &str) -> EnvResult<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(container = %id, "removed container");
                Ok(())
            }
            // A container that is already gone is the state we wanted.
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn rename(&self, id: &str, new_name: &str) -> EnvResult<()> {
        self.docker
            .rename_container(
                id,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await
            .map_err(map_err)
    }

    async fn inspect(&self, id: &str) -> EnvResult<ObservedState> {
        let response = match self.docker.inspect_container(id, None).await {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Ok(ObservedState::Missing),
            Err(e) => return Err(map_err(e)),
        };
        let status = response
            .state
            .and_then(|s| s.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);
        Ok(match status {
            ContainerStateStatusEnum::CREATED => ObservedState::Created,
            // A paused container is still live; duplication pauses sources
            // briefly and they must not read as stopped meanwhile.
            ContainerStateStatusEnum::RUNNING
            | ContainerStateStatusEnum::PAUSED
            | ContainerStateStatusEnum::RESTARTING => ObservedState::Running,
            ContainerStateStatusEnum::REMOVING => ObservedState::Missing,
            _ => ObservedState::Stopped,
        })
    }

    async fn find_by_name(&self, name: &str) -> EnvResult<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;

        // The name filter matches substrings; require an exact match.
        let wanted = format!("/{name}");
        for summary in summaries {
            let matches = summary
                .names
                .as_deref()
                .is_some_and(|names| names.iter().any(|n| n == &wanted));
            if matches {
                return Ok(summary.id);
            }
        }
        Ok(None)
    }

    async fn copy_data(&self, source_id: &str, dest_id: &str, path: &str) -> EnvResult<()> {
        debug!(source = %source_id, dest = %dest_id, path, "copying container data");
        let archive: Vec<u8> = self
            .docker
            .download_from_container(
                source_id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .map_err(map_err)
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;

        // The archive root is the last path component, so unpack into the
        // parent directory.
        let parent = match path.trim_end_matches('/').rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        };
        self.docker
            .upload_to_container(
                dest_id,
                Some(UploadToContainerOptions {
                    path: parent,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(map_err)?;
        info!(source = %source_id, dest = %dest_id, path, "copied container data");
        Ok(())
    }

    async fn logs(&self, id: &str, follow: bool) -> EnvResult<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(id, Some(options))
            .map(|line| match line {
                Ok(output) => Ok(String::from_utf8_lossy(&output.into_bytes())
                    .trim_end()
                    .to_string()),
                Err(e) => Err(map_err(e)),
            });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MountSpec, PortMapping, RuntimeOptions};
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "envdock-test".to_string(),
            image: "app:latest".to_string(),
            port_mappings: vec![PortMapping {
                host_port: 8188,
                container_port: 8188,
            }],
            mounts: vec![MountSpec {
                host_path: PathBuf::from("/data/input"),
                container_path: "/app/ComfyUI/input".to_string(),
                mode: MountMode::ReadWrite,
            }],
            options: RuntimeOptions {
                gpu: true,
                environment: vec!["CLI_ARGS=--listen".to_string()],
                command: Some("python main.py".to_string()),
                memory_limit_bytes: Some(1 << 30),
                nano_cpus: Some(2_000_000_000),
                engine_flags: [("envdock.tier".to_string(), "dev".to_string())]
                    .into_iter()
                    .collect(),
            },
        }
    }

    #[test]
    fn config_maps_ports_mounts_and_options() {
        let config = build_config(&spec());
        assert_eq!(config.image.as_deref(), Some("app:latest"));
        assert_eq!(
            config.cmd,
            Some(vec!["python".to_string(), "main.py".to_string()])
        );
        assert_eq!(config.env, Some(vec!["CLI_ARGS=--listen".to_string()]));

        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["8188/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8188"));

        let mounts = host.mounts.unwrap();
        assert_eq!(mounts[0].target.as_deref(), Some("/app/ComfyUI/input"));
        assert_eq!(mounts[0].read_only, Some(false));

        assert_eq!(host.memory, Some(1 << 30));
        assert_eq!(host.nano_cpus, Some(2_000_000_000));
        let gpus = host.device_requests.unwrap();
        assert_eq!(gpus[0].count, Some(-1));

        let labels = config.labels.unwrap();
        assert_eq!(labels["envdock.tier"], "dev");
    }

    #[test]
    fn config_omits_optional_sections_when_unset() {
        let mut bare = spec();
        bare.options = RuntimeOptions::default();
        bare.mounts.clear();
        let config = build_config(&bare);
        assert!(config.cmd.is_none());
        assert!(config.env.is_none());
        assert!(config.labels.is_none());
        let host = config.host_config.unwrap();
        assert!(host.device_requests.is_none());
        assert_eq!(host.mounts, Some(Vec::new()));
    }
}
