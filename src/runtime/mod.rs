use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::core::{EnvResult, MountSpec, PortMapping, RuntimeOptions};

pub mod docker;
pub mod mock;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

/// Desired container configuration, computed by the manager from a registry
/// record plus the allocators.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub port_mappings: Vec<PortMapping>,
    pub mounts: Vec<MountSpec>,
    pub options: RuntimeOptions,
}

/// Container state as the engine reports it. `Missing` is a normal answer,
/// not an error; the manager uses it to reconcile stale records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Created,
    Running,
    Stopped,
    Missing,
}

pub type LogStream = Pin<Box<dyn Stream<Item = EnvResult<String>> + Send>>;

/// Thin abstraction over the container engine. All calls are potentially slow
/// and are driven under a caller-side timeout by the manager; implementations
/// distinguish an unreachable engine (`RuntimeUnavailable`) from a reachable
/// engine rejecting the specific call (`RuntimeOperationFailed`).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> EnvResult<()>;

    /// Whether the image is present locally. Images are opaque, addressable
    /// artifacts; pulling them is outside this boundary.
    async fn image_exists(&self, image: &str) -> EnvResult<bool>;

    /// Creates (without starting) a container and returns the engine id.
    async fn create(&self, spec: &ContainerSpec) -> EnvResult<String>;

    async fn start(&self, id: &str) -> EnvResult<()>;
    async fn stop(&self, id: &str) -> EnvResult<()>;
    async fn pause(&self, id: &str) -> EnvResult<()>;
    async fn unpause(&self, id: &str) -> EnvResult<()>;
    async fn remove(&self, id: &str) -> EnvResult<()>;

    /// Renames a container. Settings updates stage a replacement container
    /// under a scratch name and rename it into place once the old one is gone.
    async fn rename(&self, id: &str, new_name: &str) -> EnvResult<()>;

    async fn inspect(&self, id: &str) -> EnvResult<ObservedState>;

    /// Looks up a container by exact name. Supports create reconciliation: a
    /// timed-out create that succeeded out-of-band is adopted by name instead
    /// of being recreated.
    async fn find_by_name(&self, name: &str) -> EnvResult<Option<String>>;

    /// Copies the subtree at `path` from one container into another, through
    /// the engine rather than the host filesystem.
    async fn copy_data(&self, source_id: &str, dest_id: &str, path: &str) -> EnvResult<()>;

    /// Log lines of the backing container: finite when stopped, a live
    /// unbounded stream when following.
    async fn logs(&self, id: &str, follow: bool) -> EnvResult<LogStream>;
}
