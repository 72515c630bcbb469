//! In-process resource store.
//!
//! Keeps the same optimistic-concurrency contract as the REST datastore:
//! every document carries a version counter and writes against a stale
//! version are rejected with [`StoreError::Conflict`].

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ResourceStore, StoreError};
use crate::resources::{Record, Resource};

#[derive(Debug)]
struct Entry<R> {
    version: u64,
    resource: R,
}

impl<R: Resource> Entry<R> {
    fn record(&self) -> Record<R> {
        Record {
            id: self.resource.key().to_string(),
            etag: self.version.to_string(),
            resource: self.resource.clone(),
        }
    }
}

/// A store holding its documents in memory, keyed by identity.
#[derive(Debug)]
pub struct MemoryStore<R> {
    entries: Mutex<BTreeMap<String, Entry<R>>>,
}

impl<R: Resource> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<R: Resource> MemoryStore<R> {
    /// Create a store seeded with `resources`.
    #[must_use]
    pub fn new(resources: impl IntoIterator<Item = R>) -> Self {
        let entries = resources
            .into_iter()
            .map(|resource| {
                (
                    resource.key().to_string(),
                    Entry {
                        version: 1,
                        resource,
                    },
                )
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Load a JSON array of resources from a file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub async fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StoreError::Config(format!("Failed to read {}: {e}", path.display())))?;
        let resources: Vec<R> = serde_json::from_str(&contents)?;
        Ok(Self::new(resources))
    }

    /// Copy of every resource, in key order.
    pub async fn snapshot(&self) -> Vec<R> {
        self.entries
            .lock()
            .await
            .values()
            .map(|entry| entry.resource.clone())
            .collect()
    }

    /// Write every resource back to a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub async fn save_json_file(&self, path: &Path) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(&self.snapshot().await)?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| StoreError::Config(format!("Failed to write {}: {e}", path.display())))
    }
}

/// Field lookup on the serialized document; missing fields read as empty.
fn field_equals<R: Resource>(resource: &R, field: &str, value: &str) -> bool {
    let Ok(document) = serde_json::to_value(resource) else {
        return false;
    };
    match document.get(field) {
        Some(serde_json::Value::String(s)) => s == value,
        Some(serde_json::Value::Null) | None => value.is_empty(),
        Some(other) => other.to_string() == value,
    }
}

#[async_trait]
impl<R: Resource> ResourceStore<R> for MemoryStore<R> {
    async fn find(&self, field: &str, value: &str) -> Result<Vec<Record<R>>, StoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .values()
            .filter(|entry| field_equals(&entry.resource, field, value))
            .map(Entry::record)
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Record<R>, StoreError> {
        self.entries
            .lock()
            .await
            .get(key)
            .map(Entry::record)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<Record<R>>, StoreError> {
        Ok(self.entries.lock().await.values().map(Entry::record).collect())
    }

    async fn create(&self, resource: &R) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let key = resource.key().to_string();
        if entries.contains_key(&key) {
            return Err(StoreError::Api {
                status: 422,
                message: format!("value '{key}' is not unique"),
            });
        }
        entries.insert(
            key,
            Entry {
                version: 1,
                resource: resource.clone(),
            },
        );
        Ok(())
    }

    async fn update(&self, record: &Record<R>) -> Result<Record<R>, StoreError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;

        if entry.version.to_string() != record.etag {
            debug!(key = %record.id, have = entry.version, sent = %record.etag, "Stale write rejected");
            return Err(StoreError::Conflict(record.id.clone()));
        }

        entry.version += 1;
        entry.resource = record.resource.clone();
        Ok(entry.record())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
