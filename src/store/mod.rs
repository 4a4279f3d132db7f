use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{EnvError, EnvResult, Environment};

/// Durable registry of environment records, keyed by id. The single source of
/// truth for what environments exist and their declared configuration.
///
/// `upsert` and `delete` must be atomic with respect to process crashes: a
/// crash mid-write never leaves the registry half-written or unparseable.
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn get(&self, id: &str) -> EnvResult<Environment>;
    async fn list(&self) -> EnvResult<Vec<Environment>>;
    async fn upsert(&self, record: Environment) -> EnvResult<()>;
    async fn delete(&self, id: &str) -> EnvResult<()>;
}

/// File-backed store: the whole registry is one JSON document, rewritten on
/// every mutation by staging to a tempfile in the same directory and renaming
/// it over the registry. Writers serialize through the registry-wide lock;
/// reads run concurrently with no in-flight write.
pub struct FileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    fn read_all(&self) -> EnvResult<BTreeMap<String, Environment>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            EnvError::Store(format!(
                "registry file {} is unreadable: {e}",
                self.path.display()
            ))
        })?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            EnvError::Store(format!(
                "registry file {} is corrupt: {e}",
                self.path.display()
            ))
        })
    }

    fn write_all(&self, records: &BTreeMap<String, Environment>) -> EnvResult<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| EnvError::Store("registry path has no parent directory".to_string()))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| EnvError::Store(format!("cannot create registry directory: {e}")))?;

        let content = serde_json::to_vec_pretty(records)
            .map_err(|e| EnvError::Store(format!("cannot serialize registry: {e}")))?;

        // Stage in the same directory so the final rename stays on one
        // filesystem and is atomic.
        let tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| EnvError::Store(format!("cannot stage registry write: {e}")))?;
        std::fs::write(tmp.path(), &content)
            .map_err(|e| EnvError::Store(format!("cannot stage registry write: {e}")))?;
        tmp.persist(&self.path)
            .map_err(|e| EnvError::Store(format!("cannot commit registry write: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl EnvironmentStore for FileStore {
    async fn get(&self, id: &str) -> EnvResult<Environment> {
        let _guard = self.lock.read().await;
        self.read_all()?
            .remove(id)
            .ok_or_else(|| EnvError::NotFound(id.to_string()))
    }

    async fn list(&self) -> EnvResult<Vec<Environment>> {
        let _guard = self.lock.read().await;
        let mut records: Vec<Environment> = self.read_all()?.into_values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn upsert(&self, record: Environment) -> EnvResult<()> {
        let _guard = self.lock.write().await;
        let mut records = self.read_all()?;
        records.insert(record.id.clone(), record);
        self.write_all(&records)
    }

    async fn delete(&self, id: &str) -> EnvResult<()> {
        let _guard = self.lock.write().await;
        let mut records = self.read_all()?;
        if records.remove(id).is_none() {
            return Err(EnvError::NotFound(id.to_string()));
        }
        self.write_all(&records)
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Environment>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnvironmentStore for MemoryStore {
    async fn get(&self, id: &str) -> EnvResult<Environment> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EnvError::NotFound(id.to_string()))
    }

    async fn list(&self) -> EnvResult<Vec<Environment>> {
        let mut records: Vec<Environment> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn upsert(&self, record: Environment) -> EnvResult<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> EnvResult<()> {
        match self.records.write().await.remove(id) {
            Some(_) => Ok(()),
            None => Err(EnvError::NotFound(id.to_string())),
        }
    }
}

pub type SharedStore = Arc<dyn EnvironmentStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EnvironmentKind, EnvironmentStatus, RuntimeOptions};
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(id: &str, name: &str) -> Environment {
        Environment {
            id: id.to_string(),
            name: name.to_string(),
            image_reference: "app:latest".to_string(),
            kind: EnvironmentKind::Default,
            status: EnvironmentStatus::Created,
            port_mappings: Vec::new(),
            mounts: Vec::new(),
            runtime_options: RuntimeOptions::default(),
            container_runtime_id: None,
            lineage: None,
            error_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_records() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("environments.json"));

        store.upsert(record("a", "one")).await.unwrap();
        store.upsert(record("b", "two")).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.get("a").await.unwrap().name, "one");

        store.delete("a").await.unwrap();
        assert!(matches!(
            store.get("a").await,
            Err(EnvError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_store_missing_record_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("environments.json"));
        assert!(matches!(
            store.get("nope").await,
            Err(EnvError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("nope").await,
            Err(EnvError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_store_corrupt_file_is_store_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("environments.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileStore::new(path);
        assert!(matches!(store.list().await, Err(EnvError::Store(_))));
        assert!(matches!(store.get("a").await, Err(EnvError::Store(_))));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("environments.json");
        {
            let store = FileStore::new(path.clone());
            store.upsert(record("a", "one")).await.unwrap();
        }
        let reopened = FileStore::new(path);
        assert_eq!(reopened.get("a").await.unwrap().name, "one");
    }

    #[tokio::test]
    async fn memory_store_basic_operations() {
        let store = MemoryStore::new();
        store.upsert(record("a", "one")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        store.delete("a").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}
