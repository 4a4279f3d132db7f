use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use envdock::config::Settings;
use envdock::core::{EnvironmentKind, MountMode, MountSpec, RuntimeOptions};
use envdock::manager::{CreateRequest, EnvironmentManager, SettingsUpdate};
use envdock::runtime::{ContainerRuntime, DockerRuntime};
use envdock::store::FileStore;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Default,
    Custom,
}

impl From<KindArg> for EnvironmentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Default => EnvironmentKind::Default,
            KindArg::Custom => EnvironmentKind::Custom,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new environment
    Create {
        /// Name of the environment
        name: String,
        /// Container image reference; falls back to the configured default
        #[arg(short, long)]
        image: Option<String>,
        /// Mount layout: fixed input/output directories or custom paths
        #[arg(short, long, value_enum, default_value = "default")]
        kind: KindArg,
        /// Custom mount as host:container[:ro|rw]; repeatable
        #[arg(short, long = "mount")]
        mounts: Vec<String>,
        /// Request all host GPUs
        #[arg(long)]
        gpu: bool,
        /// Extra KEY=VALUE container environment variable; repeatable
        #[arg(short, long = "env")]
        env_vars: Vec<String>,
        /// Override the container command
        #[arg(long)]
        command: Option<String>,
    },
    /// List all environments
    List,
    /// Show one environment
    Show {
        /// Environment id
        id: String,
    },
    /// Activate (start) an environment
    Activate {
        /// Environment id
        id: String,
    },
    /// Deactivate (stop) an environment
    Deactivate {
        /// Environment id
        id: String,
    },
    /// Duplicate an environment, copying its container-internal data
    Duplicate {
        /// Source environment id
        id: String,
        /// Name for the duplicate
        new_name: String,
    },
    /// Update mounts or runtime options of a stopped environment
    Update {
        /// Environment id
        id: String,
        /// Replacement mount as host:container[:ro|rw]; repeatable
        #[arg(short, long = "mount")]
        mounts: Vec<String>,
        /// Enable or disable the GPU request
        #[arg(long)]
        gpu: Option<bool>,
        /// Replacement KEY=VALUE container environment variable; repeatable
        #[arg(short, long = "env")]
        env_vars: Vec<String>,
        /// Override the container command
        #[arg(long)]
        command: Option<String>,
    },
    /// Delete an environment; host-mounted directories are preserved
    Delete {
        /// Environment id
        id: String,
    },
    /// Recover an environment from error state
    Reset {
        /// Environment id
        id: String,
    },
    /// Stream logs of the backing container
    Logs {
        /// Environment id
        id: String,
    },
}

fn parse_mount(raw: &str) -> Result<MountSpec> {
    let parts: Vec<&str> = raw.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host, container] => (*host, *container, MountMode::ReadWrite),
        [host, container, mode] => {
            let mode = match *mode {
                "ro" => MountMode::ReadOnly,
                "rw" => MountMode::ReadWrite,
                other => anyhow::bail!("invalid mount mode {other:?}; expected ro or rw"),
            };
            (*host, *container, mode)
        }
        _ => anyhow::bail!("invalid mount {raw:?}; expected host:container[:ro|rw]"),
    };
    Ok(MountSpec {
        host_path: PathBuf::from(host),
        container_path: container.to_string(),
        mode,
    })
}

fn parse_mounts(raw: &[String]) -> Result<Vec<MountSpec>> {
    raw.iter().map(|m| parse_mount(m)).collect()
}

fn print_environment(env: &envdock::Environment) {
    let ports: Vec<String> = env
        .port_mappings
        .iter()
        .map(|m| format!("{}->{}", m.host_port, m.container_port))
        .collect();
    println!(
        "{}  {:10}  {:8}  {}  [{}]",
        env.id,
        env.name,
        env.status.to_string(),
        env.image_reference,
        ports.join(", ")
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(Settings::default_settings_path);
    let settings = Settings::load(&settings_path)?;

    let store = Arc::new(FileStore::new(settings.registry_path.clone()));
    let runtime = Arc::new(DockerRuntime::connect()?);
    runtime
        .ping()
        .await
        .context("Docker engine is not reachable")?;
    let manager = EnvironmentManager::new(store, runtime, settings);

    match cli.command {
        Commands::Create {
            name,
            image,
            kind,
            mounts,
            gpu,
            env_vars,
            command,
        } => {
            let request = CreateRequest {
                name,
                image,
                kind: kind.into(),
                mounts: parse_mounts(&mounts)?,
                runtime_options: RuntimeOptions {
                    gpu,
                    environment: env_vars,
                    command,
                    ..Default::default()
                },
            };
            let env = manager.create(request).await?;
            print_environment(&env);
        }
        Commands::List => {
            for env in manager.list().await? {
                print_environment(&env);
            }
        }
        Commands::Show { id } => {
            let env = manager.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&env)?);
        }
        Commands::Activate { id } => {
            let env = manager.activate(&id).await?;
            print_environment(&env);
        }
        Commands::Deactivate { id } => {
            let env = manager.deactivate(&id).await?;
            print_environment(&env);
        }
        Commands::Duplicate { id, new_name } => {
            let env = manager.duplicate(&id, &new_name).await?;
            print_environment(&env);
        }
        Commands::Update {
            id,
            mounts,
            gpu,
            env_vars,
            command,
        } => {
            let current = manager.get(&id).await?;
            let runtime_options = if gpu.is_some() || !env_vars.is_empty() || command.is_some() {
                let mut options = current.runtime_options.clone();
                if let Some(gpu) = gpu {
                    options.gpu = gpu;
                }
                if !env_vars.is_empty() {
                    options.environment = env_vars;
                }
                if command.is_some() {
                    options.command = command;
                }
                Some(options)
            } else {
                None
            };
            let update = SettingsUpdate {
                mounts: if mounts.is_empty() {
                    None
                } else {
                    Some(parse_mounts(&mounts)?)
                },
                runtime_options,
            };
            let env = manager.update_settings(&id, update).await?;
            print_environment(&env);
        }
        Commands::Delete { id } => {
            manager.delete(&id).await?;
            println!("deleted {id}");
        }
        Commands::Reset { id } => {
            let env = manager.reset(&id).await?;
            print_environment(&env);
        }
        Commands::Logs { id } => {
            let mut stream = manager.logs(&id).await?;
            while let Some(line) = stream.next().await {
                println!("{}", line?);
            }
        }
    }
    Ok(())
}
