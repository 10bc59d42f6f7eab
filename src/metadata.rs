//! Transactional metadata store mapping snapshot keys to ids, kinds, parent
//! chains, labels and usage.
//!
//! State lives in a single JSON file (`metadata.db`) under the snapshotter
//! root. Write transactions take an exclusive lock, run against the live
//! state, and either persist atomically (write-temp, rename) or roll back to
//! the pre-transaction state. Transaction closures are synchronous; slow
//! filesystem work belongs outside the transaction.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use containerd_snapshots::{Info, Kind, Usage};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// `containerd_snapshots::Kind` does not implement `Clone`; this mirrors its
/// unit variants to make cheap copies where the type needs duplicating.
pub(crate) fn clone_kind(kind: &Kind) -> Kind {
    match kind {
        Kind::Unknown => Kind::Unknown,
        Kind::View => Kind::View,
        Kind::Active => Kind::Active,
        Kind::Committed => Kind::Committed,
    }
}

/// A snapshot handle as seen by the lifecycle engine: the assigned id plus
/// the committed ancestor ids, nearest parent first.
#[derive(Debug)]
pub struct Snapshot {
    pub id: String,
    pub kind: Kind,
    pub parent_ids: Vec<String>,
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        Snapshot {
            id: self.id.clone(),
            kind: clone_kind(&self.kind),
            parent_ids: self.parent_ids.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    id: u64,
    kind: Kind,
    parent: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    inodes: i64,
}

impl Clone for Record {
    fn clone(&self) -> Self {
        Record {
            id: self.id,
            kind: clone_kind(&self.kind),
            parent: self.parent.clone(),
            labels: self.labels.clone(),
            size: self.size,
            inodes: self.inodes,
        }
    }
}

/// The state a transaction closure operates on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaState {
    next_id: u64,
    snapshots: BTreeMap<String, Record>,
}

impl MetaState {
    fn record(&self, key: &str) -> Result<&Record> {
        self.snapshots
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn to_info(key: &str, record: &Record) -> Info {
        Info {
            kind: clone_kind(&record.kind),
            name: key.to_string(),
            parent: record.parent.clone(),
            labels: record.labels.clone(),
            ..Info::default()
        }
    }

    fn parent_ids(&self, first_parent: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut next = first_parent.to_string();
        while !next.is_empty() {
            let record = self.record(&next)?;
            ids.push(record.id.to_string());
            next = record.parent.clone();
        }
        Ok(ids)
    }

    /// Creates a new Active or View snapshot under `key` on top of `parent`
    /// (empty for a base snapshot).
    pub fn create_snapshot(
        &mut self,
        kind: Kind,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Snapshot> {
        if !matches!(kind, Kind::Active | Kind::View) {
            return Err(Error::InvalidArgument(format!(
                "snapshot kind {kind:?} cannot be created directly"
            )));
        }
        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot key is empty".to_string()));
        }
        if self.snapshots.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        if !parent.is_empty() && self.record(parent)?.kind != Kind::Committed {
            return Err(Error::InvalidArgument(format!(
                "parent {parent} is not committed"
            )));
        }

        self.next_id += 1;
        let id = self.next_id;
        self.snapshots.insert(
            key.to_string(),
            Record {
                id,
                kind: clone_kind(&kind),
                parent: parent.to_string(),
                labels,
                size: 0,
                inodes: 0,
            },
        );

        Ok(Snapshot {
            id: id.to_string(),
            kind,
            parent_ids: self.parent_ids(parent)?,
        })
    }

    /// Returns `(id, info, usage)` for a key or committed name.
    pub fn info(&self, key: &str) -> Result<(String, Info, Usage)> {
        let record = self.record(key)?;
        Ok((
            record.id.to_string(),
            Self::to_info(key, record),
            Usage {
                size: record.size,
                inodes: record.inodes,
            },
        ))
    }

    /// Returns the snapshot handle for a key.
    pub fn snapshot(&self, key: &str) -> Result<Snapshot> {
        let record = self.record(key)?;
        Ok(Snapshot {
            id: record.id.to_string(),
            kind: clone_kind(&record.kind),
            parent_ids: self.parent_ids(&record.parent)?,
        })
    }

    /// Updates a snapshot's mutable fields. Only labels may change; kind,
    /// name and parent are fixed at creation.
    pub fn update(&mut self, info: Info, fieldpaths: Option<Vec<String>>) -> Result<Info> {
        let record = self
            .snapshots
            .get_mut(&info.name)
            .ok_or_else(|| Error::NotFound(info.name.clone()))?;

        match fieldpaths {
            None => record.labels = info.labels.clone(),
            Some(paths) if paths.is_empty() => record.labels = info.labels.clone(),
            Some(paths) => {
                for path in paths {
                    if path == "labels" {
                        record.labels = info.labels.clone();
                    } else if let Some(label) = path.strip_prefix("labels.") {
                        match info.labels.get(label) {
                            Some(value) => {
                                record.labels.insert(label.to_string(), value.clone());
                            }
                            None => {
                                record.labels.remove(label);
                            }
                        }
                    } else {
                        return Err(Error::InvalidArgument(format!(
                            "cannot update field {path}"
                        )));
                    }
                }
            }
        }

        let record = self.record(&info.name)?;
        Ok(Self::to_info(&info.name, record))
    }

    /// Commits the Active snapshot at `key` under the new name, carrying the
    /// measured usage and any commit-time labels. The id is preserved.
    pub fn commit(
        &mut self,
        key: &str,
        name: &str,
        usage: Usage,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "commit name is empty".to_string(),
            ));
        }
        if self.snapshots.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if self.record(key)?.kind != Kind::Active {
            return Err(Error::InvalidArgument(format!(
                "snapshot {key} is not active"
            )));
        }

        let mut record = self.snapshots.remove(key).expect("record checked above");
        record.kind = Kind::Committed;
        record.size = usage.size;
        record.inodes = usage.inodes;
        record.labels.extend(labels);
        let id = record.id;
        self.snapshots.insert(name.to_string(), record);

        Ok(id.to_string())
    }

    /// Removes the snapshot at `key`, returning its id. Refused while other
    /// snapshots still list it as their parent.
    pub fn remove(&mut self, key: &str) -> Result<String> {
        let id = self.record(key)?.id;
        if self.snapshots.values().any(|r| r.parent == key) {
            return Err(Error::InvalidArgument(format!(
                "cannot remove snapshot {key} with children"
            )));
        }
        self.snapshots.remove(key);
        Ok(id.to_string())
    }

    /// The set of live snapshot ids, as directory basenames.
    pub fn ids(&self) -> HashSet<String> {
        self.snapshots.values().map(|r| r.id.to_string()).collect()
    }

    /// All snapshots as `(id, info, usage)`, ordered by id.
    pub fn walk(&self) -> Vec<(String, Info, Usage)> {
        let mut items: Vec<(u64, String, Info, Usage)> = self
            .snapshots
            .iter()
            .map(|(key, record)| {
                (
                    record.id,
                    record.id.to_string(),
                    Self::to_info(key, record),
                    Usage {
                        size: record.size,
                        inodes: record.inodes,
                    },
                )
            })
            .collect();
        items.sort_by_key(|(id, ..)| *id);
        items
            .into_iter()
            .map(|(_, id, info, usage)| (id, info, usage))
            .collect()
    }
}

/// File-backed metadata store with per-operation transactions.
#[derive(Debug)]
pub struct MetaStore {
    db_path: PathBuf,
    state: RwLock<MetaState>,
}

impl MetaStore {
    /// Opens (or initializes) the store at `db_path`.
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let state = match fs::read(&db_path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::Internal(format!("corrupt metadata store: {e}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MetaState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            db_path,
            state: RwLock::new(state),
        })
    }

    /// Runs a read-only transaction.
    pub fn read<R>(&self, f: impl FnOnce(&MetaState) -> Result<R>) -> Result<R> {
        let state = self.state.read().expect("metadata lock poisoned");
        f(&state)
    }

    /// Runs a read-write transaction: on success the new state is persisted
    /// atomically, on any error the pre-transaction state is restored.
    pub fn write<R>(&self, f: impl FnOnce(&mut MetaState) -> Result<R>) -> Result<R> {
        let mut state = self.state.write().expect("metadata lock poisoned");
        let backup = state.clone();

        let result = f(&mut state).and_then(|value| {
            self.persist(&state)?;
            Ok(value)
        });
        if result.is_err() {
            *state = backup;
        }
        result
    }

    fn persist(&self, state: &MetaState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Internal(format!("failed to serialize metadata: {e}")))?;
        let tmp_path = self.db_path.with_extension("db.tmp");
        fs::write(&tmp_path, data)?;
        if let Err(err) = fs::rename(&tmp_path, &self.db_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        debug!("persisted metadata to {}", self.db_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path().join("metadata.db")).unwrap();
        (dir, store)
    }

    fn commit_chain(store: &MetaStore, names: &[&str]) -> Vec<String> {
        let mut parent = String::new();
        let mut ids = Vec::new();
        for name in names {
            let key = format!("prep-{name}");
            let id = store
                .write(|state| {
                    state.create_snapshot(Kind::Active, &key, &parent, HashMap::new())?;
                    state.commit(&key, name, Usage { size: 0, inodes: 0 }, HashMap::new())
                })
                .unwrap();
            ids.push(id);
            parent = name.to_string();
        }
        ids
    }

    #[test]
    fn create_assigns_sequential_ids() {
        let (_dir, store) = store();
        let a = store
            .write(|s| s.create_snapshot(Kind::Active, "a", "", HashMap::new()))
            .unwrap();
        let b = store
            .write(|s| s.create_snapshot(Kind::Active, "b", "", HashMap::new()))
            .unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
        assert!(a.parent_ids.is_empty());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let (_dir, store) = store();
        store
            .write(|s| s.create_snapshot(Kind::Active, "a", "", HashMap::new()))
            .unwrap();
        let err = store
            .write(|s| s.create_snapshot(Kind::Active, "a", "", HashMap::new()))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn parent_must_be_committed() {
        let (_dir, store) = store();
        store
            .write(|s| s.create_snapshot(Kind::Active, "a", "", HashMap::new()))
            .unwrap();
        let err = store
            .write(|s| s.create_snapshot(Kind::Active, "b", "a", HashMap::new()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = store
            .write(|s| s.create_snapshot(Kind::Active, "b", "ghost", HashMap::new()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn parent_ids_are_nearest_first() {
        let (_dir, store) = store();
        let ids = commit_chain(&store, &["base", "mid", "top"]);

        let snap = store
            .write(|s| s.create_snapshot(Kind::Active, "leaf", "top", HashMap::new()))
            .unwrap();
        assert_eq!(
            snap.parent_ids,
            vec![ids[2].clone(), ids[1].clone(), ids[0].clone()]
        );
    }

    #[test]
    fn commit_freezes_usage_and_renames() {
        let (_dir, store) = store();
        store
            .write(|s| s.create_snapshot(Kind::Active, "a", "", HashMap::new()))
            .unwrap();
        store
            .write(|s| {
                s.commit(
                    "a",
                    "img",
                    Usage {
                        size: 42,
                        inodes: 3,
                    },
                    HashMap::new(),
                )
            })
            .unwrap();

        let (_, info, usage) = store.read(|s| s.info("img")).unwrap();
        assert_eq!(info.kind, Kind::Committed);
        assert_eq!(usage.size, 42);
        assert_eq!(usage.inodes, 3);
        assert!(store.read(|s| s.info("a")).unwrap_err().is_not_found());
    }

    #[test]
    fn commit_of_view_or_taken_name_is_rejected() {
        let (_dir, store) = store();
        commit_chain(&store, &["img"]);
        store
            .write(|s| s.create_snapshot(Kind::View, "v", "img", HashMap::new()))
            .unwrap();

        let err = store
            .write(|s| s.commit("v", "img2", Usage { size: 0, inodes: 0 }, HashMap::new()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        store
            .write(|s| s.create_snapshot(Kind::Active, "a", "img", HashMap::new()))
            .unwrap();
        let err = store
            .write(|s| s.commit("a", "img", Usage { size: 0, inodes: 0 }, HashMap::new()))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn remove_refuses_parents_with_children() {
        let (_dir, store) = store();
        commit_chain(&store, &["img"]);
        store
            .write(|s| s.create_snapshot(Kind::Active, "child", "img", HashMap::new()))
            .unwrap();

        let err = store.write(|s| s.remove("img")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        store.write(|s| s.remove("child")).unwrap();
        let id = store.write(|s| s.remove("img")).unwrap();
        assert_eq!(id, "1");
        assert!(store.read(|s| Ok(s.ids())).unwrap().is_empty());
    }

    #[test]
    fn failed_write_transactions_roll_back() {
        let (_dir, store) = store();
        let err = store
            .write(|s| {
                s.create_snapshot(Kind::Active, "a", "", HashMap::new())?;
                Err::<(), _>(Error::Internal("boom".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(store.read(|s| s.info("a")).unwrap_err().is_not_found());

        // The id counter rolled back too: the next create starts at 1.
        let snap = store
            .write(|s| s.create_snapshot(Kind::Active, "b", "", HashMap::new()))
            .unwrap();
        assert_eq!(snap.id, "1");
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("metadata.db");
        {
            let store = MetaStore::new(db.clone()).unwrap();
            commit_chain(&store, &["img"]);
        }
        let store = MetaStore::new(db).unwrap();
        let (id, info, _) = store.read(|s| s.info("img")).unwrap();
        assert_eq!(id, "1");
        assert_eq!(info.kind, Kind::Committed);
    }

    #[test]
    fn update_replaces_or_patches_labels() {
        let (_dir, store) = store();
        let mut labels = HashMap::new();
        labels.insert("keep".to_string(), "old".to_string());
        store
            .write(|s| s.create_snapshot(Kind::Active, "a", "", labels))
            .unwrap();

        let (_, mut info, _) = store.read(|s| s.info("a")).unwrap();
        info.labels.insert("new".to_string(), "v".to_string());
        info.labels.remove("keep");

        let patched = store
            .write(|s| s.update(info.clone(), Some(vec!["labels.new".to_string()])))
            .unwrap();
        assert_eq!(patched.labels.get("new").map(String::as_str), Some("v"));
        assert_eq!(patched.labels.get("keep").map(String::as_str), Some("old"));

        let replaced = store.write(|s| s.update(info, None)).unwrap();
        assert!(!replaced.labels.contains_key("keep"));

        let (_, info, _) = store.read(|s| s.info("a")).unwrap();
        let err = store
            .write(|s| s.update(info, Some(vec!["kind".to_string()])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn walk_lists_snapshots_in_id_order() {
        let (_dir, store) = store();
        commit_chain(&store, &["base", "mid"]);
        store
            .write(|s| s.create_snapshot(Kind::Active, "leaf", "mid", HashMap::new()))
            .unwrap();

        let items = store.read(|s| Ok(s.walk())).unwrap();
        let ids: Vec<&str> = items.iter().map(|(id, ..)| id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(items[2].1.parent, "mid");
    }
}
