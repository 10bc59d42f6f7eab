//! Path resolution for snapshot homes, short-path layout and shared-storage
//! placement.
//!
//! Snapshot homes normally live under `<root>/snapshots/<id>`. With short
//! base paths enabled they move to `<shared_storage_base>/l/<id>`, where
//! `shared_storage_base` is two directories above the snapshotter root (e.g.
//! `/s` for a root of `/s/d/io.containerd.snapshotter.v1.overlayfs`). The
//! shorter prefix bounds the length of `lowerdir=` mount options for deeply
//! layered images.
//!
//! Snapshots carrying the shared-storage labels additionally place their
//! writable layer at `<shared_disk_path>/<pod_hash>/<snapshot_hash>`, which
//! survives snapshot removal so a later incarnation of the same pod can
//! recover its state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use containerd_snapshots::Info;
use log::debug;

use crate::error::{Error, Result};
use crate::identity;
use crate::labels;

/// Basename of the short snapshots root under the shared storage base.
const SHORT_SNAPSHOTS_DIR: &str = "l";

/// Identity components extracted from the shared-storage labels.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedIdentity {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub pod_hash: String,
    pub snapshot_hash: String,
}

/// The resolved on-disk locations for a shared snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedPaths {
    pub disk_path: PathBuf,
    pub base: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub identity: SharedIdentity,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    short_base_paths: bool,
}

/// Returns true when the snapshot's labels opt it into shared placement.
pub fn is_shared_snapshot(snap_labels: &HashMap<String, String>) -> bool {
    snap_labels
        .get(labels::USE_SHARED_STORAGE_LABEL)
        .map(|v| v == "true")
        .unwrap_or(false)
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>, short_base_paths: bool) -> Self {
        Self {
            root: root.into(),
            short_base_paths,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn short_base_paths(&self) -> bool {
        self.short_base_paths
    }

    /// The legacy snapshots root, `<root>/snapshots`.
    pub fn canonical_snapshots_root(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Two directories above the snapshotter root, shared with the short
    /// snapshots root. `None` when the root is too shallow to have one.
    pub fn shared_storage_base(&self) -> Option<PathBuf> {
        self.root
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
    }

    /// `<shared_storage_base>/l`, when short base paths are enabled.
    pub fn short_snapshots_root(&self) -> Option<PathBuf> {
        if !self.short_base_paths {
            return None;
        }
        self.shared_storage_base()
            .map(|base| base.join(SHORT_SNAPSHOTS_DIR))
    }

    /// The root new snapshot homes are created under.
    pub fn snapshots_root(&self) -> PathBuf {
        self.short_snapshots_root()
            .unwrap_or_else(|| self.canonical_snapshots_root())
    }

    /// The home directory of a snapshot: its existing location when one of
    /// the two roots already holds it, otherwise the configured root. Never
    /// fails; a home for a brand-new id simply does not exist yet.
    pub fn snapshot_home(&self, id: &str) -> PathBuf {
        let configured = self.snapshots_root().join(id);
        if configured.exists() {
            return configured;
        }
        if let Some(alternate) = self.alternate_snapshot_dir(id) {
            if alternate.exists() {
                return alternate;
            }
        }
        configured
    }

    fn alternate_snapshot_dir(&self, id: &str) -> Option<PathBuf> {
        if self.short_base_paths {
            Some(self.canonical_snapshots_root().join(id))
        } else {
            self.shared_storage_base()
                .map(|base| base.join(SHORT_SNAPSHOTS_DIR).join(id))
        }
    }

    /// The `fs` directory of a local snapshot home.
    pub fn fs_dir(&self, id: &str) -> PathBuf {
        self.snapshot_home(id).join("fs")
    }

    /// The `work` directory of a local snapshot home.
    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.snapshot_home(id).join("work")
    }

    /// The canonical-layout `fs` path, used as a last-resort fallback when
    /// label injection cannot resolve a better location.
    pub fn fallback_fs_dir(&self, id: &str) -> PathBuf {
        self.canonical_snapshots_root().join(id).join("fs")
    }

    /// Locates an existing `fs` directory for `id`, trying the configured
    /// layout first and the opposite layout second.
    pub fn locate_fs_dir(&self, id: &str) -> Result<PathBuf> {
        let configured = self.snapshots_root().join(id).join("fs");
        if configured.exists() {
            return Ok(configured);
        }
        if let Some(alternate) = self.alternate_snapshot_dir(id) {
            let alternate = alternate.join("fs");
            if alternate.exists() {
                debug!(
                    "snapshot {id} found at alternate location {}",
                    alternate.display()
                );
                return Ok(alternate);
            }
        }
        Err(Error::NotFound(format!(
            "snapshot {id} has no fs directory in either layout"
        )))
    }

    /// Resolves the shared base directory for a snapshot from its labels and
    /// id, without touching the filesystem.
    pub fn shared_paths(&self, info: &Info, id: &str) -> Result<SharedPaths> {
        let get = |key: &str| {
            info.labels
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };
        let (disk_path, namespace, pod_name, container_name) = match (
            get(labels::SHARED_DISK_PATH_LABEL),
            get(labels::K8S_NAMESPACE_LABEL),
            get(labels::K8S_POD_NAME_LABEL),
            get(labels::K8S_CONTAINER_NAME_LABEL),
        ) {
            (Some(d), Some(n), Some(p), Some(c)) => (d, n, p, c),
            _ => {
                return Err(Error::InvalidArgument(
                    "missing one or more required labels for shared storage path".to_string(),
                ))
            }
        };
        if id.is_empty() {
            return Err(Error::InvalidArgument(
                "snapshot id is required for shared storage path".to_string(),
            ));
        }

        if self.short_base_paths {
            if let Some(base) = self.shared_storage_base() {
                let disk = Path::new(disk_path);
                if disk == base || disk == base.join(SHORT_SNAPSHOTS_DIR) {
                    return Err(Error::PathConflict(disk_path.to_string()));
                }
            }
        }

        let pod_hash = identity::pod_hash(namespace, pod_name, container_name);
        let snapshot_hash = identity::snapshot_hash(id);
        let base = Path::new(disk_path).join(&pod_hash).join(&snapshot_hash);
        debug!(
            "shared base for snapshot {id} ({namespace}/{pod_name}/{container_name}) is {}",
            base.display()
        );

        Ok(SharedPaths {
            disk_path: PathBuf::from(disk_path),
            upper: base.join("fs"),
            work: base.join("work"),
            base,
            identity: SharedIdentity {
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                container_name: container_name.to_string(),
                pod_hash,
                snapshot_hash,
            },
        })
    }

    /// The upperdir of a snapshot: on shared storage when the labels say so,
    /// otherwise the local home.
    pub fn upper_path(&self, id: &str, info: &Info) -> Result<PathBuf> {
        if is_shared_snapshot(&info.labels) {
            return Ok(self.shared_paths(info, id)?.upper);
        }
        Ok(self.fs_dir(id))
    }

    /// The workdir of a snapshot. Only meaningful for active snapshots.
    pub fn work_path(&self, id: &str, info: &Info) -> Result<PathBuf> {
        if is_shared_snapshot(&info.labels) {
            return Ok(self.shared_paths(info, id)?.work);
        }
        Ok(self.work_dir(id))
    }
}
