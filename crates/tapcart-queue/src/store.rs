//! Persistence port and the bundled implementations.
//!
//! The engine only ever talks to [`QueueStore`]: insert, fetch by status,
//! update status, delete, observe. [`MemoryStore`] is the in-memory
//! implementation used by tests and memory-only queues; [`JsonFileStore`]
//! layers a whole-file JSON snapshot on top of it for terminals without a
//! database.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::item::{ItemStatus, WorkItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue store backend failure: {0}")]
    Backend(String),
}

/// Persistence collaborator, keyed by opaque item id and status.
#[async_trait]
pub trait QueueStore<T: WorkItem>: Send + Sync {
    /// Insert or replace an item row.
    async fn insert(&self, item: &T, status: ItemStatus) -> Result<(), StoreError>;

    /// Oldest pending item, if any.
    async fn get_next_pending(&self) -> Result<Option<T>, StoreError>;

    async fn update_status(&self, id: &str, status: ItemStatus) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// All items with a status, in insertion order.
    async fn get_all_by_status(&self, status: ItemStatus) -> Result<Vec<T>, StoreError>;

    /// Watch the set of items holding a status.
    fn observe_by_status(&self, status: ItemStatus) -> watch::Receiver<Vec<T>>;
}

struct Row<T> {
    item: T,
    status: ItemStatus,
}

struct MemoryInner<T> {
    rows: Vec<Row<T>>,
    watchers: HashMap<ItemStatus, watch::Sender<Vec<T>>>,
}

/// In-memory store.
pub struct MemoryStore<T> {
    inner: Mutex<MemoryInner<T>>,
}

impl<T: WorkItem> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: WorkItem> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                rows: Vec::new(),
                watchers: HashMap::new(),
            }),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Row<T>>) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let result = f(&mut inner.rows);
        // Refresh every observed status; cheap at queue sizes.
        let snapshots: Vec<(ItemStatus, Vec<T>)> = inner
            .watchers
            .keys()
            .map(|status| {
                (
                    *status,
                    inner
                        .rows
                        .iter()
                        .filter(|row| row.status == *status)
                        .map(|row| row.item.clone())
                        .collect(),
                )
            })
            .collect();
        for (status, snapshot) in snapshots {
            if let Some(sender) = inner.watchers.get(&status) {
                let _ = sender.send(snapshot);
            }
        }
        result
    }

    fn by_status(&self, status: ItemStatus) -> Vec<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .rows
            .iter()
            .filter(|row| row.status == status)
            .map(|row| row.item.clone())
            .collect()
    }

    /// Full contents, for snapshot-style persistence layers.
    fn snapshot(&self) -> Vec<(T, ItemStatus)> {
        let inner = self.inner.lock().unwrap();
        inner
            .rows
            .iter()
            .map(|row| (row.item.clone(), row.status))
            .collect()
    }

    fn load(&self, rows: Vec<(T, ItemStatus)>) {
        self.mutate(|store| {
            store.clear();
            store.extend(rows.into_iter().map(|(item, status)| Row { item, status }));
        });
    }
}

#[async_trait]
impl<T: WorkItem> QueueStore<T> for MemoryStore<T> {
    async fn insert(&self, item: &T, status: ItemStatus) -> Result<(), StoreError> {
        let item = item.clone();
        self.mutate(|rows| {
            if let Some(row) = rows.iter_mut().find(|row| row.item.id() == item.id()) {
                row.item = item;
                row.status = status;
            } else {
                rows.push(Row { item, status });
            }
        });
        Ok(())
    }

    async fn get_next_pending(&self) -> Result<Option<T>, StoreError> {
        Ok(self.by_status(ItemStatus::Pending).into_iter().next())
    }

    async fn update_status(&self, id: &str, status: ItemStatus) -> Result<(), StoreError> {
        self.mutate(|rows| {
            if let Some(row) = rows.iter_mut().find(|row| row.item.id() == id) {
                row.status = status;
            }
        });
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|rows| rows.retain(|row| row.item.id() != id));
        Ok(())
    }

    async fn get_all_by_status(&self, status: ItemStatus) -> Result<Vec<T>, StoreError> {
        Ok(self.by_status(status))
    }

    fn observe_by_status(&self, status: ItemStatus) -> watch::Receiver<Vec<T>> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot: Vec<T> = inner
            .rows
            .iter()
            .filter(|row| row.status == status)
            .map(|row| row.item.clone())
            .collect();
        inner
            .watchers
            .entry(status)
            .or_insert_with(|| watch::channel(snapshot).0)
            .subscribe()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedRow<T> {
    item: T,
    status: ItemStatus,
}

/// Whole-file JSON snapshot store for terminals without a database.
///
/// Every mutation rewrites the file; queue sizes are tens of items, not
/// thousands, so the simplicity wins.
pub struct JsonFileStore<T: WorkItem> {
    memory: MemoryStore<T>,
    path: PathBuf,
}

impl<T> JsonFileStore<T>
where
    T: WorkItem + Serialize + DeserializeOwned,
{
    /// Open (or create) the snapshot at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let memory = MemoryStore::new();

        match std::fs::read(&path) {
            Ok(bytes) => {
                let rows: Vec<PersistedRow<T>> = serde_json::from_slice(&bytes)
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                debug!(path = %path.display(), rows = rows.len(), "loaded queue snapshot");
                memory.load(rows.into_iter().map(|row| (row.item, row.status)).collect());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::Backend(err.to_string())),
        }

        Ok(Self { memory, path })
    }

    fn persist(&self) -> Result<(), StoreError> {
        let rows: Vec<PersistedRow<T>> = self
            .memory
            .snapshot()
            .into_iter()
            .map(|(item, status)| PersistedRow { item, status })
            .collect();
        let bytes =
            serde_json::to_vec_pretty(&rows).map_err(|err| StoreError::Backend(err.to_string()))?;
        std::fs::write(&self.path, bytes).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl<T> QueueStore<T> for JsonFileStore<T>
where
    T: WorkItem + Serialize + DeserializeOwned,
{
    async fn insert(&self, item: &T, status: ItemStatus) -> Result<(), StoreError> {
        self.memory.insert(item, status).await?;
        self.persist()
    }

    async fn get_next_pending(&self) -> Result<Option<T>, StoreError> {
        self.memory.get_next_pending().await
    }

    async fn update_status(&self, id: &str, status: ItemStatus) -> Result<(), StoreError> {
        self.memory.update_status(id, status).await?;
        self.persist()
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.memory.delete(id).await?;
        self.persist()
    }

    async fn get_all_by_status(&self, status: ItemStatus) -> Result<Vec<T>, StoreError> {
        self.memory.get_all_by_status(status).await
    }

    fn observe_by_status(&self, status: ItemStatus) -> watch::Receiver<Vec<T>> {
        self.memory.observe_by_status(status)
    }
}
