//! Reverse index from hash-based shared-storage paths to the identity they
//! were derived from.
//!
//! Shared upperdirs live at `<base>/<pod_hash>/<snapshot_hash>`, which is
//! opaque to an operator staring at the storage server. The index file
//! (`<base>/.path-mappings.json`) records, for every hash pair ever placed
//! there, the namespace/pod/container identity and snapshot id behind it.
//!
//! The index is advisory: a failed write is logged by callers and never fails
//! the snapshot operation that triggered it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAPPING_FILE: &str = ".path-mappings.json";

/// One identity record behind a `<pod_hash>/<snapshot_hash>` directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathMapping {
    pub pod_hash: String,
    pub snapshot_hash: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MappingFile {
    mappings: HashMap<String, PathMapping>,
}

/// In-memory index with file-backed persistence, one instance per
/// snapshotter.
#[derive(Debug, Default)]
pub struct PathMappingIndex {
    inner: Mutex<HashMap<String, PathMapping>>,
}

fn mapping_key(pod_hash: &str, snapshot_hash: &str) -> String {
    format!("{pod_hash}/{snapshot_hash}")
}

impl PathMappingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or refreshes) the mapping for a hash pair and persists the
    /// index under `base_path`.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        base_path: &Path,
        pod_hash: &str,
        snapshot_hash: &str,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        snapshot_id: &str,
    ) -> Result<()> {
        let mut mappings = self.inner.lock().expect("path mapping lock poisoned");
        let now = Utc::now();
        let key = mapping_key(pod_hash, snapshot_hash);

        match mappings.get_mut(&key) {
            Some(existing) => {
                existing.namespace = namespace.to_string();
                existing.pod_name = pod_name.to_string();
                existing.container_name = container_name.to_string();
                existing.snapshot_id = snapshot_id.to_string();
                existing.last_accessed = now;
            }
            None => {
                mappings.insert(
                    key,
                    PathMapping {
                        pod_hash: pod_hash.to_string(),
                        snapshot_hash: snapshot_hash.to_string(),
                        namespace: namespace.to_string(),
                        pod_name: pod_name.to_string(),
                        container_name: container_name.to_string(),
                        snapshot_id: snapshot_id.to_string(),
                        created_at: now,
                        last_accessed: now,
                    },
                );
            }
        }

        save(base_path, &mappings)
    }

    /// Merge-reads the index file under `base_path` into memory. A missing
    /// file is not an error.
    pub fn load(&self, base_path: &Path) -> Result<()> {
        let file_path = base_path.join(MAPPING_FILE);
        let data = match fs::read(&file_path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("path mappings file does not exist yet: {}", file_path.display());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let parsed: MappingFile = serde_json::from_slice(&data)
            .map_err(|e| Error::Internal(format!("corrupt path mappings file: {e}")))?;

        let mut mappings = self.inner.lock().expect("path mapping lock poisoned");
        let before = mappings.len();
        mappings.extend(parsed.mappings);
        info!(
            "loaded path mappings from {}: {} loaded, {} total",
            file_path.display(),
            mappings.len() - before,
            mappings.len()
        );
        Ok(())
    }

    /// Looks up the identity behind a hash pair, refreshing its access time.
    pub fn lookup(&self, pod_hash: &str, snapshot_hash: &str) -> Option<PathMapping> {
        let mut mappings = self.inner.lock().expect("path mapping lock poisoned");
        mappings
            .get_mut(&mapping_key(pod_hash, snapshot_hash))
            .map(|m| {
                m.last_accessed = Utc::now();
                m.clone()
            })
    }

    /// Returns all mappings for a pod identity, newest first.
    pub fn find_previous(
        &self,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> Vec<PathMapping> {
        let mappings = self.inner.lock().expect("path mapping lock poisoned");
        let mut found: Vec<PathMapping> = mappings
            .values()
            .filter(|m| {
                m.namespace == namespace
                    && m.pod_name == pod_name
                    && m.container_name == container_name
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found
    }

    /// Returns the `fs` directories of prior incarnations of a pod identity
    /// that still exist under `base_path`, newest first.
    pub fn previous_state_dirs(
        &self,
        base_path: &Path,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
    ) -> Vec<PathBuf> {
        self.find_previous(namespace, pod_name, container_name)
            .into_iter()
            .map(|m| {
                base_path
                    .join(&m.pod_hash)
                    .join(&m.snapshot_hash)
                    .join("fs")
            })
            .filter(|dir| dir.is_dir())
            .collect()
    }

    /// Evicts records not accessed within `max_age` and persists the index.
    pub fn cleanup_stale(&self, base_path: &Path, max_age: Duration) -> Result<usize> {
        let mut mappings = self.inner.lock().expect("path mapping lock poisoned");
        let cutoff = Utc::now() - max_age;
        let before = mappings.len();
        mappings.retain(|_, m| m.last_accessed >= cutoff);
        let removed = before - mappings.len();
        if removed > 0 {
            info!("evicted {removed} stale path mappings");
            save(base_path, &mappings)?;
        }
        Ok(removed)
    }

    /// Evicts records whose on-disk directory no longer exists and persists
    /// the index.
    pub fn cleanup_orphans(&self, base_path: &Path) -> Result<usize> {
        let mut mappings = self.inner.lock().expect("path mapping lock poisoned");
        let before = mappings.len();
        mappings.retain(|_, m| base_path.join(&m.pod_hash).join(&m.snapshot_hash).is_dir());
        let removed = before - mappings.len();
        if removed > 0 {
            info!("evicted {removed} path mappings for missing directories");
            save(base_path, &mappings)?;
        }
        Ok(removed)
    }
}

/// Persists the index atomically, entries ordered by descending numeric
/// snapshot id (lexicographic fallback) to keep the file easy to eyeball.
fn save(base_path: &Path, mappings: &HashMap<String, PathMapping>) -> Result<()> {
    fs::create_dir_all(base_path)?;

    let mut entries: Vec<(&String, &PathMapping)> = mappings.iter().collect();
    entries.sort_by(|(_, a), (_, b)| {
        match (
            a.snapshot_id.parse::<i64>(),
            b.snapshot_id.parse::<i64>(),
        ) {
            (Ok(ia), Ok(ib)) => ib.cmp(&ia),
            _ => b.snapshot_id.cmp(&a.snapshot_id),
        }
    });

    let mut ordered = serde_json::Map::new();
    for (key, mapping) in entries {
        let value = serde_json::to_value(mapping)
            .map_err(|e| Error::Internal(format!("failed to serialize path mapping: {e}")))?;
        ordered.insert(key.clone(), value);
    }
    let mut root = serde_json::Map::new();
    root.insert("mappings".to_string(), serde_json::Value::Object(ordered));

    let data = serde_json::to_vec_pretty(&serde_json::Value::Object(root))
        .map_err(|e| Error::Internal(format!("failed to serialize path mappings: {e}")))?;

    let file_path = base_path.join(MAPPING_FILE);
    let tmp_path = base_path.join(format!("{MAPPING_FILE}.tmp"));
    fs::write(&tmp_path, data)?;
    if let Err(err) = fs::rename(&tmp_path, &file_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    debug!("saved path mappings to {}", file_path.display());
    Ok(())
}
