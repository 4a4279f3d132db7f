pub mod error;
pub mod types;

pub use error::{EnvError, EnvResult};
pub use types::{
    validate_name, Environment, EnvironmentKind, EnvironmentStatus, MountMode, MountSpec,
    PortMapping, RuntimeOptions,
};
