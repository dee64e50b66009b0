//! Result persistence
//!
//! Only confirmed-valid results reach a [`PersistenceStore`]. Both operations
//! are idempotent: a key always maps to the same entity id, and re-recording an
//! unchanged payload is a no-op.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

/// One valid result ready to persist
#[derive(Debug, Clone)]
pub struct StoreItem {
    pub key: String,
    pub api: String,
    pub data: Value,
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn get_or_create_entity(&self, key: &str) -> Result<Uuid>;

    /// Returns how many items were written
    async fn record_batch(&self, items: Vec<StoreItem>) -> Result<usize>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    entity_id: Uuid,
    key: String,
    api: String,
    data: Value,
    recorded_at: DateTime<Utc>,
}

/// Append-only JSON-lines store; the newest line for an entity wins on read
pub struct JsonlStore {
    path: PathBuf,
    entities: DashMap<String, Uuid>,
    latest: DashMap<(Uuid, String), Value>,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    /// Open `path`, replaying existing records so upserts stay idempotent
    /// across runs
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            entities: DashMap::new(),
            latest: DashMap::new(),
            write_lock: Mutex::new(()),
        };

        let content = match fs::read_to_string(&store.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut skipped = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(record) => {
                    store.entities.insert(record.key.clone(), record.entity_id);
                    store.latest.insert((record.entity_id, record.api), record.data);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, path = %store.path.display(), "Skipped malformed store lines");
        }
        if !store.entities.is_empty() {
            info!(entities = store.entities.len(), "Loaded existing results");
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

#[async_trait]
impl PersistenceStore for JsonlStore {
    async fn get_or_create_entity(&self, key: &str) -> Result<Uuid> {
        Ok(*self
            .entities
            .entry(key.to_string())
            .or_insert_with(Uuid::new_v4))
    }

    async fn record_batch(&self, items: Vec<StoreItem>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut buffer = String::new();
        let mut pending = Vec::new();
        for item in items {
            let entity_id = self.get_or_create_entity(&item.key).await?;
            let slot = (entity_id, item.api.clone());
            if self.latest.get(&slot).is_some_and(|v| *v == item.data) {
                debug!(key = %item.key, "Unchanged result, not re-recorded");
                continue;
            }
            let record = StoredRecord {
                entity_id,
                key: item.key,
                api: item.api,
                data: item.data,
                recorded_at: Utc::now(),
            };
            buffer.push_str(&serde_json::to_string(&record)?);
            buffer.push('\n');
            pending.push((slot, record.data));
        }

        if pending.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        let written = pending.len();
        for (slot, data) in pending {
            self.latest.insert(slot, data);
        }
        debug!(written, "Recorded batch");
        Ok(written)
    }
}
