//! In-process engine stand-in for tests: tracks containers, supports the full
//! runtime contract, and can inject failures per operation.

use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::core::{EnvError, EnvResult};
use crate::runtime::{ContainerRuntime, ContainerSpec, LogStream, ObservedState};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub spec: ContainerSpec,
    pub state: ObservedState,
    pub paused: bool,
    /// Source container id of the last data copy into this container.
    pub copied_from: Option<String>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    next_id: u64,
    missing_images: HashSet<String>,
    fail_ops: HashSet<&'static str>,
    delays: HashMap<&'static str, Duration>,
    unavailable: bool,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the engine were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Makes the named operation (`create`, `start`, `stop`, `remove`,
    /// `pause`, `copy_data`) fail with an engine error until cleared.
    pub fn fail_op(&self, op: &'static str) {
        self.state.lock().unwrap().fail_ops.insert(op);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_ops.clear();
        state.unavailable = false;
    }

    /// Makes the named operation sleep before completing, so a test can
    /// interleave another operation with the still-in-flight one.
    pub fn delay_op(&self, op: &'static str, delay: Duration) {
        self.state.lock().unwrap().delays.insert(op, delay);
    }

    pub fn mark_image_missing(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .missing_images
            .insert(image.to_string());
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn container_named(&self, name: &str) -> Option<MockContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Plants a container without going through `create`, simulating an
    /// out-of-band completion the manager must reconcile against.
    pub fn plant_container(&self, name: &str, spec: ContainerSpec, state: ObservedState) -> String {
        let mut guard = self.state.lock().unwrap();
        guard.next_id += 1;
        let id = format!("mock-{}", guard.next_id);
        guard.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                spec,
                state,
                paused: false,
                copied_from: None,
            },
        );
        id
    }

    fn check(&self, op: &'static str) -> EnvResult<()> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(EnvError::RuntimeUnavailable(
                "mock engine unreachable".to_string(),
            ));
        }
        if state.fail_ops.contains(op) {
            return Err(EnvError::RuntimeOperationFailed(format!(
                "mock engine refused {op}"
            )));
        }
        Ok(())
    }

    async fn gate(&self, op: &'static str) -> EnvResult<()> {
        let delay = self.state.lock().unwrap().delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(op)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> EnvResult<()> {
        self.check("ping")
    }

    async fn image_exists(&self, image: &str) -> EnvResult<bool> {
        self.check("image_exists")?;
        Ok(!self.state.lock().unwrap().missing_images.contains(image))
    }

    async fn create(&self, spec: &ContainerSpec) -> EnvResult<String> {
        self.gate("create").await?;
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EnvError::RuntimeOperationFailed(format!(
                "engine returned 409: container name {} already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                spec: spec.clone(),
                state: ObservedState::Created,
                paused: false,
                copied_from: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> EnvResult<()> {
        self.check("start")?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EnvError::RuntimeOperationFailed(format!("engine returned 404: {id}")))?;
        container.state = ObservedState::Running;
        Ok(())
    }

    async fn stop(&self, id: &str) -> EnvResult<()> {
        self.check("stop")?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EnvError::RuntimeOperationFailed(format!("engine returned 404: {id}")))?;
        container.state = ObservedState::Stopped;
        container.paused = false;
        Ok(())
    }

    async fn pause(&self, id: &str) -> EnvResult<()> {
        self.check("pause")?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EnvError::RuntimeOperationFailed(format!("engine returned 404: {id}")))?;
        container.paused = true;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> EnvResult<()> {
        self.check("unpause")?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EnvError::RuntimeOperationFailed(format!("engine returned 404: {id}")))?;
        container.paused = false;
        Ok(())
    }

    async fn rename(&self, id: &str, new_name: &str) -> EnvResult<()> {
        self.check("rename")?;
        let mut state = self.state.lock().unwrap();
        if state
            .containers
            .values()
            .any(|c| c.name == new_name && c.id != id)
        {
            return Err(EnvError::RuntimeOperationFailed(format!(
                "engine returned 409: container name {new_name} already in use"
            )));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EnvError::RuntimeOperationFailed(format!("engine returned 404: {id}")))?;
        container.name = new_name.to_string();
        Ok(())
    }

    async fn remove(&self, id: &str) -> EnvResult<()> {
        self.check("remove")?;
        self.state.lock().unwrap().containers.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> EnvResult<ObservedState> {
        self.check("inspect")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.state)
            .unwrap_or(ObservedState::Missing))
    }

    async fn find_by_name(&self, name: &str) -> EnvResult<Option<String>> {
        self.check("find_by_name")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.id.clone()))
    }

    async fn copy_data(&self, source_id: &str, dest_id: &str, _path: &str) -> EnvResult<()> {
        self.gate("copy_data").await?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(source_id) {
            return Err(EnvError::RuntimeOperationFailed(format!(
                "engine returned 404: {source_id}"
            )));
        }
        let container = state.containers.get_mut(dest_id).ok_or_else(|| {
            EnvError::RuntimeOperationFailed(format!("engine returned 404: {dest_id}"))
        })?;
        container.copied_from = Some(source_id.to_string());
        Ok(())
    }

    async fn logs(&self, id: &str, _follow: bool) -> EnvResult<LogStream> {
        self.check("logs")?;
        let lines: Vec<EnvResult<String>> = vec![
            Ok(format!("{id}: application starting")),
            Ok(format!("{id}: listening")),
        ];
        Ok(Box::pin(stream::iter(lines)))
    }
}
