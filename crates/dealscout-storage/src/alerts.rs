//! Alert-history persistence: the record of what has already been delivered.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dealscout_core::{AlertHistory, AlertRecord};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::{write_atomic, RunClaim, StoreError};

/// Key-value store of [`AlertRecord`]s keyed by `source_id`.
///
/// `put_many` only replaces an existing record with a strictly newer one, so a
/// record is effectively immutable until a later delivery supersedes it.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<AlertRecord>, StoreError>;

    /// Persist a batch in one write. Returns how many records were inserted or refreshed.
    async fn put_many(&self, records: &[AlertRecord]) -> Result<usize, StoreError>;

    async fn load_all(&self) -> Result<Vec<AlertRecord>, StoreError>;

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StoreError>;

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn snapshot(
        &self,
        as_of: DateTime<Utc>,
        retention: Duration,
    ) -> Result<AlertHistory, StoreError> {
        let records = self.load_all().await?;
        Ok(AlertHistory::from_records(records, as_of, retention))
    }

    /// Claims the history for one read-decide-write run. `Ok(None)` means
    /// another run sharing this store holds it.
    async fn claim_run(&self) -> Result<Option<RunClaim>, StoreError> {
        Ok(Some(RunClaim::Local))
    }
}

fn merge_newer(map: &mut HashMap<String, DateTime<Utc>>, records: &[AlertRecord]) -> usize {
    let mut written = 0;
    for record in records {
        let newer = map
            .get(&record.source_id)
            .map_or(true, |existing| *existing < record.alerted_at);
        if newer {
            map.insert(record.source_id.clone(), record.alerted_at);
            written += 1;
        }
    }
    written
}

fn to_records<'a>(
    entries: impl Iterator<Item = (&'a String, &'a DateTime<Utc>)>,
) -> Vec<AlertRecord> {
    let mut out: Vec<_> = entries
        .map(|(id, at)| AlertRecord::new(id.clone(), *at))
        .collect();
    out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    out
}

#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    records: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = AlertRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.source_id, r.alerted_at))
            .collect();
        Self {
            records: Mutex::new(map),
        }
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn get(&self, source_id: &str) -> Result<Option<AlertRecord>, StoreError> {
        let map = self.records.lock().await;
        Ok(map
            .get(source_id)
            .map(|at| AlertRecord::new(source_id, *at)))
    }

    async fn put_many(&self, records: &[AlertRecord]) -> Result<usize, StoreError> {
        let mut map = self.records.lock().await;
        Ok(merge_newer(&mut map, records))
    }

    async fn load_all(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let map = self.records.lock().await;
        Ok(to_records(map.iter()))
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StoreError> {
        let map = self.records.lock().await;
        Ok(to_records(map.iter().filter(|(_, at)| **at < cutoff)))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut map = self.records.lock().await;
        let before = map.len();
        map.retain(|_, at| *at >= cutoff);
        Ok(before - map.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AlertFile {
    version: u32,
    records: BTreeMap<String, DateTime<Utc>>,
}

/// JSON-file store. Every mutation rewrites the whole file atomically.
#[derive(Debug)]
pub struct JsonFileAlertStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileAlertStore {
    const VERSION: u32 = 1;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let file: AlertFile =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.records.into_iter().collect())
    }

    async fn write_map(&self, map: &HashMap<String, DateTime<Utc>>) -> Result<(), StoreError> {
        let file = AlertFile {
            version: Self::VERSION,
            records: map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(StoreError::Encode)?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl AlertStore for JsonFileAlertStore {
    async fn get(&self, source_id: &str) -> Result<Option<AlertRecord>, StoreError> {
        let _guard = self.guard.lock().await;
        let map = self.read_map().await?;
        Ok(map
            .get(source_id)
            .map(|at| AlertRecord::new(source_id, *at)))
    }

    async fn put_many(&self, records: &[AlertRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let _guard = self.guard.lock().await;
        let mut map = self.read_map().await?;
        let written = merge_newer(&mut map, records);
        if written > 0 {
            self.write_map(&map).await?;
        }
        Ok(written)
    }

    async fn load_all(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let _guard = self.guard.lock().await;
        let map = self.read_map().await?;
        Ok(to_records(map.iter()))
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StoreError> {
        let _guard = self.guard.lock().await;
        let map = self.read_map().await?;
        Ok(to_records(map.iter().filter(|(_, at)| **at < cutoff)))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.guard.lock().await;
        let mut map = self.read_map().await?;
        let before = map.len();
        map.retain(|_, at| *at >= cutoff);
        let removed = before - map.len();
        if removed > 0 {
            self.write_map(&map).await?;
        }
        Ok(removed)
    }
}
