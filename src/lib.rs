//! Lifecycle manager for isolated, containerized instances ("environments")
//! of a GPU-accelerated application: create, duplicate, activate, inspect and
//! delete them against a local Docker engine, with a durable JSON registry as
//! the source of truth.

pub mod config;
pub mod core;
pub mod manager;
pub mod mounts;
pub mod ports;
pub mod runtime;
pub mod store;

pub use crate::config::Settings;
pub use crate::core::{
    EnvError, EnvResult, Environment, EnvironmentKind, EnvironmentStatus, MountMode, MountSpec,
    PortMapping, RuntimeOptions,
};
pub use crate::manager::{CreateRequest, EnvironmentManager, SettingsUpdate};
