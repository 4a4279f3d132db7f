use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::core::{
    validate_name, EnvError, EnvResult, Environment, EnvironmentKind, EnvironmentStatus, MountSpec,
    PortMapping, RuntimeOptions,
};
use crate::mounts::MountResolver;
use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, ContainerSpec, LogStream, ObservedState};
use crate::store::EnvironmentStore;

const CONTAINER_NAME_PREFIX: &str = "envdock";

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    /// Falls back to the configured default image when absent.
    pub image: Option<String>,
    pub kind: EnvironmentKind,
    /// Only consulted for `custom` environments.
    pub mounts: Vec<MountSpec>,
    pub runtime_options: RuntimeOptions,
}

/// Declared-configuration changes. Only legal while the environment is not
/// running; applying them replaces the backing container, carrying its
/// internal data forward through the engine.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub mounts: Option<Vec<MountSpec>>,
    pub runtime_options: Option<RuntimeOptions>,
}

/// The orchestrator: validates requests, sequences the store, the allocators
/// and the container runtime, and keeps the registry converged with observed
/// engine state.
///
/// Operations on one environment id serialize through a per-id lock. The
/// commit lock covers only registry read-validate-write sections (name and
/// port uniqueness are checked against the latest committed state); slow
/// engine calls run outside it.
pub struct EnvironmentManager {
    store: Arc<dyn EnvironmentStore>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    mounts: MountResolver,
    settings: Settings,
    timeout: Duration,
    commit_lock: Mutex<()>,
    id_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EnvironmentManager {
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
    ) -> Self {
        let ports = PortAllocator::new(
            settings.default_port,
            settings.port_range_start,
            settings.port_range_end,
        );
        let mounts = MountResolver::new(&settings);
        let timeout = Duration::from_secs(settings.runtime_timeout_secs);
        Self {
            store,
            runtime,
            ports,
            mounts,
            settings,
            timeout,
            commit_lock: Mutex::new(()),
            id_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn container_name(id: &str) -> String {
        format!("{CONTAINER_NAME_PREFIX}-{id}")
    }

    fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.id_locks.lock().unwrap();
        // An entry with an outstanding handle must stay put: removing it
        // would let a later caller mint a second mutex for the same id and
        // run alongside the holder. Entries nobody holds are safe to evict.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Bounds a runtime call; the call itself may complete out-of-band after
    /// the timeout fires, which the next reconciliation pass absorbs.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = EnvResult<T>> + Send,
    ) -> EnvResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EnvError::RuntimeOperationFailed(format!(
                "{op} did not complete within {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    fn container_spec(&self, env: &Environment) -> ContainerSpec {
        ContainerSpec {
            name: Self::container_name(&env.id),
            image: env.image_reference.clone(),
            port_mappings: env.port_mappings.clone(),
            mounts: env.mounts.clone(),
            options: env.runtime_options.clone(),
        }
    }

    /// Host ports reserved by non-deleted records. A stopped environment's
    /// ports are reserved, not free: resuming must succeed without
    /// renegotiation.
    fn reserved_ports(records: &[Environment]) -> BTreeSet<u16> {
        records
            .iter()
            .filter(|r| r.status != EnvironmentStatus::Deleting)
            .flat_map(|r| r.host_ports())
            .collect()
    }

    fn name_taken(records: &[Environment], name: &str) -> bool {
        records
            .iter()
            .any(|r| r.status != EnvironmentStatus::Deleting && r.name == name)
    }

    /// Re-queries observed engine state before trusting the recorded status.
    /// Returns true when the record changed and needs persisting.
    async fn reconcile(&self, env: &mut Environment) -> EnvResult<bool> {
        if env.status == EnvironmentStatus::Deleting {
            return Ok(false);
        }
        let Some(container_id) = env.container_runtime_id.clone() else {
            return Ok(false);
        };
        let observed = self.runtime.inspect(&container_id).await?;
        let next = match observed {
            ObservedState::Running => Some(EnvironmentStatus::Running),
            ObservedState::Stopped if env.status == EnvironmentStatus::Running => {
                Some(EnvironmentStatus::Stopped)
            }
            ObservedState::Missing => {
                env.error_reason = Some("backing container no longer exists".to_string());
                Some(EnvironmentStatus::Error)
            }
            _ => None,
        };
        match next {
            Some(status) if status != env.status => {
                info!(
                    environment = %env.id,
                    recorded = %env.status,
                    observed = %status,
                    "reconciled environment status against engine"
                );
                env.status = status;
                if status != EnvironmentStatus::Error {
                    env.error_reason = None;
                }
                env.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn persist(&self, env: &Environment) -> EnvResult<()> {
        let _commit = self.commit_lock.lock().await;
        self.store.upsert(env.clone()).await
    }

    async fn fetch_reconciled(&self, id: &str) -> EnvResult<Environment> {
        let mut env = self.store.get(id).await?;
        if self.reconcile(&mut env).await? {
            self.persist(&env).await?;
        }
        Ok(env)
    }

    /// Guarantees the record has a live backing container, adopting one that
    /// exists under the canonical name before creating anything — a create
    /// that timed out but succeeded at the engine converges here instead of
    /// duplicating resources.
    async fn ensure_container(&self, env: &mut Environment) -> EnvResult<String> {
        if let Some(id) = &env.container_runtime_id {
            if self.runtime.inspect(id).await? != ObservedState::Missing {
                return Ok(id.clone());
            }
        }
        let name = Self::container_name(&env.id);
        let container_id = match self.runtime.find_by_name(&name).await? {
            Some(existing) => {
                info!(environment = %env.id, container = %existing, "adopted existing container");
                existing
            }
            None => {
                let spec = self.container_spec(env);
                self.bounded("container create", self.runtime.create(&spec))
                    .await?
            }
        };
        env.container_runtime_id = Some(container_id.clone());
        env.touch();
        self.persist(env).await?;
        Ok(container_id)
    }

    // ---- lifecycle operations ----

    pub async fn create(&self, request: CreateRequest) -> EnvResult<Environment> {
        validate_name(&request.name)?;
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.settings.default_image.clone());
        if !self.runtime.image_exists(&image).await? {
            return Err(EnvError::Validation(format!(
                "image {image} is not available locally"
            )));
        }
        let mounts = self.mounts.resolve(request.kind, &request.mounts)?;

        // The id lock is taken before the record becomes visible and held
        // until the container id is persisted, so a concurrent operation on
        // the fresh id (a delete, say) cannot interleave with the slow
        // engine-create phase.
        let id = Uuid::new_v4().to_string();
        let lock = self.id_lock(&id);
        let _guard = lock.lock().await;

        // Admission: uniqueness and allocation against latest committed state,
        // atomically with the write that records them.
        let mut env = {
            let _commit = self.commit_lock.lock().await;
            let records = self.store.list().await?;
            if Self::name_taken(&records, &request.name) {
                return Err(EnvError::Conflict(format!(
                    "environment name {} already exists",
                    request.name
                )));
            }
            let reserved = Self::reserved_ports(&records);
            let host_ports = self.ports.allocate(1, &reserved)?;
            let now = Utc::now();
            let env = Environment {
                id: id.clone(),
                name: request.name.clone(),
                image_reference: image,
                kind: request.kind,
                status: EnvironmentStatus::Created,
                port_mappings: host_ports
                    .into_iter()
                    .map(|host_port| PortMapping {
                        host_port,
                        container_port: self.settings.container_port,
                    })
                    .collect(),
                mounts,
                runtime_options: request.runtime_options.clone(),
                container_runtime_id: None,
                lineage: None,
                error_reason: None,
                created_at: now,
                updated_at: now,
            };
            self.store.upsert(env.clone()).await?;
            env
        };

        let spec = self.container_spec(&env);
        match self.bounded("container create", self.runtime.create(&spec)).await {
            Ok(container_id) => {
                env.container_runtime_id = Some(container_id);
                env.touch();
                self.persist(&env).await?;
                info!(environment = %env.id, name = %env.name, "created environment");
                Ok(env)
            }
            Err(err) => {
                // The call may have succeeded at the engine after we gave up
                // waiting; adopt the container by name before rolling back.
                if !matches!(err, EnvError::RuntimeUnavailable(_)) {
                    if let Ok(Some(container_id)) = self.runtime.find_by_name(&spec.name).await {
                        warn!(
                            environment = %env.id,
                            container = %container_id,
                            "create reported failure but the container exists; adopting it"
                        );
                        env.container_runtime_id = Some(container_id);
                        env.touch();
                        self.persist(&env).await?;
                        return Ok(env);
                    }
                }
                // No partial environments survive a failed create.
                let _commit = self.commit_lock.lock().await;
                if let Err(rollback) = self.store.delete(&env.id).await {
                    warn!(environment = %env.id, error = %rollback, "rollback of failed create left a record behind");
                }
                Err(err)
            }
        }
    }

    pub async fn activate(&self, id: &str) -> EnvResult<Environment> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut env = self.fetch_reconciled(id).await?;
        match env.status {
            // Already converged, e.g. a previous activate finished out-of-band.
            EnvironmentStatus::Running => return Ok(env),
            EnvironmentStatus::Created | EnvironmentStatus::Stopped => {}
            EnvironmentStatus::Error => {
                return Err(EnvError::Validation(format!(
                    "environment {id} is in error state; reset it first"
                )))
            }
            EnvironmentStatus::Deleting => {
                return Err(EnvError::Conflict(format!(
                    "environment {id} is being deleted"
                )))
            }
        }

        let container_id = self.ensure_container(&mut env).await?;
        match self
            .bounded("container start", self.runtime.start(&container_id))
            .await
        {
            Ok(()) => {
                env.status = EnvironmentStatus::Running;
                env.error_reason = None;
                env.touch();
                self.persist(&env).await?;
                info!(environment = %env.id, name = %env.name, "activated environment");
                Ok(env)
            }
            Err(EnvError::RuntimeUnavailable(reason)) => {
                Err(EnvError::RuntimeUnavailable(reason))
            }
            Err(err) => {
                // Ports stay reserved: the record survives in error state for
                // the caller to inspect and reset.
                env.status = EnvironmentStatus::Error;
                env.error_reason = Some(err.to_string());
                env.touch();
                self.persist(&env).await?;
                Err(err)
            }
        }
    }

    pub async fn deactivate(&self, id: &str) -> EnvResult<Environment> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut env = self.fetch_reconciled(id).await?;
        match env.status {
            // Idempotent: deactivating a non-running environment is a no-op.
            EnvironmentStatus::Created | EnvironmentStatus::Stopped => return Ok(env),
            EnvironmentStatus::Running => {}
            EnvironmentStatus::Error => {
                return Err(EnvError::Validation(format!(
                    "environment {id} is in error state; reset it first"
                )))
            }
            EnvironmentStatus::Deleting => {
                return Err(EnvError::Conflict(format!(
                    "environment {id} is being deleted"
                )))
            }
        }

        let container_id = env
            .container_runtime_id
            .clone()
            .ok_or_else(|| EnvError::Store(format!("running environment {id} has no container")))?;
        match self
            .bounded("container stop", self.runtime.stop(&container_id))
            .await
        {
            Ok(()) => {
                env.status = EnvironmentStatus::Stopped;
                env.error_reason = None;
                env.touch();
                self.persist(&env).await?;
                info!(environment = %env.id, name = %env.name, "deactivated environment");
                Ok(env)
            }
            Err(EnvError::RuntimeUnavailable(reason)) => {
                Err(EnvError::RuntimeUnavailable(reason))
            }
            Err(err) => {
                env.status = EnvironmentStatus::Error;
                env.error_reason = Some(err.to_string());
                env.touch();
                self.persist(&env).await?;
                Err(err)
            }
        }
    }

    pub async fn duplicate(&self, id: &str, new_name: &str) -> EnvResult<Environment> {
        validate_name(new_name)?;
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut source = self.fetch_reconciled(id).await?;
        if !matches!(
            source.status,
            EnvironmentStatus::Created | EnvironmentStatus::Stopped | EnvironmentStatus::Running
        ) {
            return Err(EnvError::Validation(format!(
                "environment {id} cannot be duplicated while {}",
                source.status
            )));
        }

        // The clone's own id lock is held from before its record is visible
        // until the operation settles, for the same reason create holds one.
        let clone_id = Uuid::new_v4().to_string();
        let clone_lock = self.id_lock(&clone_id);
        let _clone_guard = clone_lock.lock().await;

        // The clone carries the source's container-internal data but none of
        // its host-mount bindings; mounts are host-machine-specific.
        let mut clone = {
            let _commit = self.commit_lock.lock().await;
            let records = self.store.list().await?;
            if Self::name_taken(&records, new_name) {
                return Err(EnvError::Conflict(format!(
                    "environment name {new_name} already exists"
                )));
            }
            let reserved = Self::reserved_ports(&records);
            let host_ports = self.ports.allocate(1, &reserved)?;
            let now = Utc::now();
            let clone = Environment {
                id: clone_id.clone(),
                name: new_name.to_string(),
                image_reference: source.image_reference.clone(),
                kind: source.kind,
                status: EnvironmentStatus::Created,
                port_mappings: host_ports
                    .into_iter()
                    .map(|host_port| PortMapping {
                        host_port,
                        container_port: self.settings.container_port,
                    })
                    .collect(),
                mounts: Vec::new(),
                runtime_options: source.runtime_options.clone(),
                container_runtime_id: None,
                lineage: Some(source.id.clone()),
                error_reason: None,
                created_at: now,
                updated_at: now,
            };
            self.store.upsert(clone.clone()).await?;
            clone
        };

        let result = self.duplicate_inner(&mut source, &mut clone).await;
        match result {
            Ok(()) => {
                self.persist(&clone).await?;
                info!(
                    environment = %clone.id,
                    name = %clone.name,
                    lineage = %source.id,
                    "duplicated environment"
                );
                Ok(clone)
            }
            Err(err) => {
                // Roll back everything the clone was given; the source has
                // already been restored by duplicate_inner.
                if let Some(container_id) = &clone.container_runtime_id {
                    if let Err(cleanup) = self.runtime.remove(container_id).await {
                        warn!(container = %container_id, error = %cleanup, "failed to remove clone container during rollback");
                    }
                }
                let _commit = self.commit_lock.lock().await;
                if let Err(rollback) = self.store.delete(&clone.id).await {
                    warn!(environment = %clone.id, error = %rollback, "rollback of failed duplicate left a record behind");
                }
                Err(err)
            }
        }
    }

    /// The engine-facing half of duplication. Leaves the source in its prior
    /// state on every path; the caller owns clone rollback.
    async fn duplicate_inner(
        &self,
        source: &mut Environment,
        clone: &mut Environment,
    ) -> EnvResult<()> {
        let source_container = self.ensure_container(source).await?;

        // A live source is paused for the copy so the snapshot is consistent.
        let paused = if source.status == EnvironmentStatus::Running {
            self.bounded("container pause", self.runtime.pause(&source_container))
                .await?;
            true
        } else {
            false
        };

        let copy_result = async {
            let spec = self.container_spec(clone);
            let clone_container = self
                .bounded("container create", self.runtime.create(&spec))
                .await?;
            clone.container_runtime_id = Some(clone_container.clone());
            clone.touch();
            self.bounded(
                "container data copy",
                self.runtime.copy_data(
                    &source_container,
                    &clone_container,
                    &self.settings.container_data_dir,
                ),
            )
            .await
        }
        .await;

        if paused {
            if let Err(err) = self.runtime.unpause(&source_container).await {
                // The source reads as running while paused, so this is not a
                // state divergence; surface it loudly and keep going.
                warn!(environment = %source.id, error = %err, "failed to unpause source after data copy");
            }
        }
        copy_result
    }

    pub async fn update_settings(
        &self,
        id: &str,
        update: SettingsUpdate,
    ) -> EnvResult<Environment> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut env = self.fetch_reconciled(id).await?;
        match env.status {
            EnvironmentStatus::Created | EnvironmentStatus::Stopped => {}
            EnvironmentStatus::Running => {
                return Err(EnvError::Validation(format!(
                    "environment {id} is running; deactivate it before changing settings"
                )))
            }
            EnvironmentStatus::Error => {
                return Err(EnvError::Validation(format!(
                    "environment {id} is in error state; reset it first"
                )))
            }
            EnvironmentStatus::Deleting => {
                return Err(EnvError::Conflict(format!(
                    "environment {id} is being deleted"
                )))
            }
        }

        let new_mounts = match update.mounts {
            Some(requested) => Some(self.mounts.resolve(env.kind, &requested)?),
            None => None,
        };
        let changed = new_mounts.as_ref().is_some_and(|m| *m != env.mounts)
            || update
                .runtime_options
                .as_ref()
                .is_some_and(|o| *o != env.runtime_options);
        if let Some(mounts) = new_mounts {
            env.mounts = mounts;
        }
        if let Some(options) = update.runtime_options {
            env.runtime_options = options;
        }
        if !changed {
            return Ok(env);
        }

        // Realize the new configuration by replacing the backing container,
        // carrying internal data forward. The old container goes away only
        // after its replacement holds the data and the registry names the
        // replacement; the record never points at a removed container.
        if let Some(old_container) = env.container_runtime_id.clone() {
            let canonical = Self::container_name(&env.id);
            let staging_name = format!("{canonical}-next");
            let mut spec = self.container_spec(&env);
            spec.name = staging_name.clone();

            // A container parked under the staging name is either the
            // record's own backing container, left there when an earlier
            // replacement died before its rename (finish that rename now),
            // or a redundant leftover copy, safe to discard.
            if let Some(parked) = self.runtime.find_by_name(&staging_name).await? {
                if parked == old_container {
                    if let Some(leftover) = self.runtime.find_by_name(&canonical).await? {
                        self.runtime.remove(&leftover).await?;
                    }
                    self.bounded(
                        "container rename",
                        self.runtime.rename(&old_container, &canonical),
                    )
                    .await?;
                } else {
                    self.runtime.remove(&parked).await?;
                }
            }

            let staged = async {
                let staging = self
                    .bounded("container create", self.runtime.create(&spec))
                    .await?;
                match self
                    .bounded(
                        "container data copy",
                        self.runtime.copy_data(
                            &old_container,
                            &staging,
                            &self.settings.container_data_dir,
                        ),
                    )
                    .await
                {
                    Ok(()) => Ok(staging),
                    Err(err) => {
                        if let Err(cleanup) = self.runtime.remove(&staging).await {
                            warn!(container = %staging, error = %cleanup, "failed to remove staging container");
                        }
                        Err(err)
                    }
                }
            }
            .await?;

            env.container_runtime_id = Some(staged.clone());
            // The replacement has never been started.
            env.status = EnvironmentStatus::Created;
            env.touch();
            self.persist(&env).await?;

            self.bounded("container remove", self.runtime.remove(&old_container))
                .await?;
            self.bounded("container rename", self.runtime.rename(&staged, &canonical))
                .await?;
        }

        env.touch();
        self.persist(&env).await?;
        info!(environment = %env.id, name = %env.name, "updated environment settings");
        Ok(env)
    }

    pub async fn delete(&self, id: &str) -> EnvResult<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut env = self.fetch_reconciled(id).await?;
        if env.status == EnvironmentStatus::Running {
            return Err(EnvError::Validation(format!(
                "environment {id} is running; deactivate it before deleting"
            )));
        }
        let prior_status = env.status;
        env.status = EnvironmentStatus::Deleting;
        env.touch();
        self.persist(&env).await?;

        if let Some(container_id) = env.container_runtime_id.clone() {
            match self
                .bounded("container remove", self.runtime.remove(&container_id))
                .await
            {
                Ok(()) => {}
                Err(EnvError::RuntimeUnavailable(reason)) => {
                    // Nothing was torn down; put the record back as it was.
                    env.status = prior_status;
                    env.touch();
                    self.persist(&env).await?;
                    return Err(EnvError::RuntimeUnavailable(reason));
                }
                Err(err) => {
                    env.status = EnvironmentStatus::Error;
                    env.error_reason = Some(err.to_string());
                    env.touch();
                    self.persist(&env).await?;
                    return Err(err);
                }
            }
        }

        // Host-mounted directories are intentionally untouched; only the
        // container state and the registry record go away. Ports return to
        // the pool with the record.
        {
            let _commit = self.commit_lock.lock().await;
            self.store.delete(id).await?;
        }
        info!(environment = %id, name = %env.name, "deleted environment");
        Ok(())
    }

    /// Explicit recovery from `error` status. Lands in a non-running state:
    /// a backing container found running is stopped (running is only entered
    /// through activate and its admission checks), a missing one is recreated
    /// from the record.
    pub async fn reset(&self, id: &str) -> EnvResult<Environment> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let mut env = self.store.get(id).await?;
        if env.status != EnvironmentStatus::Error {
            return Err(EnvError::Validation(format!(
                "environment {id} is {}, not in error state",
                env.status
            )));
        }

        let backing = env.container_runtime_id.clone();
        let observed = match &backing {
            Some(container_id) => self.runtime.inspect(container_id).await?,
            None => ObservedState::Missing,
        };
        env.status = match observed {
            ObservedState::Running => {
                if let Some(container_id) = &backing {
                    self.bounded("container stop", self.runtime.stop(container_id))
                        .await?;
                }
                EnvironmentStatus::Stopped
            }
            ObservedState::Created => EnvironmentStatus::Created,
            ObservedState::Stopped => EnvironmentStatus::Stopped,
            ObservedState::Missing => {
                env.container_runtime_id = None;
                self.ensure_container(&mut env).await?;
                EnvironmentStatus::Created
            }
        };
        env.error_reason = None;
        env.touch();
        self.persist(&env).await?;
        info!(environment = %env.id, status = %env.status, "reset environment");
        Ok(env)
    }

    // ---- read side ----

    pub async fn list(&self) -> EnvResult<Vec<Environment>> {
        let mut records = self.store.list().await?;
        for env in &mut records {
            if self.reconcile(env).await? {
                self.persist(env).await?;
            }
        }
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> EnvResult<Environment> {
        self.fetch_reconciled(id).await
    }

    /// Log lines of the backing container: a finite sequence once the
    /// container has stopped, a live stream while it runs.
    pub async fn logs(&self, id: &str) -> EnvResult<LogStream> {
        let env = self.fetch_reconciled(id).await?;
        let container_id = env.container_runtime_id.clone().ok_or_else(|| {
            EnvError::Validation(format!("environment {id} has no backing container yet"))
        })?;
        let follow = env.status == EnvironmentStatus::Running;
        self.runtime.logs(&container_id, follow).await
    }
}
