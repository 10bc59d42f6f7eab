//! The shared-upperdir overlay snapshotter.
//!
//! Serves the containerd snapshots API on top of overlayfs, with two twists
//! over a plain local snapshotter: labeled snapshots place their writable
//! layer on external shared storage (surviving removal, so a later
//! incarnation of the same pod can recover its state), and snapshot homes
//! can live under a short sibling root to keep `lowerdir=` mount options
//! inside the kernel's single-page limit for deeply layered images.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use containerd_snapshots::api::types::Mount;
use containerd_snapshots::{Info, Kind, Snapshotter, Usage};
use log::{debug, error, info, warn};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
use tokio_stream::Stream;
use tonic::Status;

use crate::diskusage;
use crate::error::{Error, Result};
use crate::idmap::IdMap;
use crate::labels;
use crate::metadata::{clone_kind, MetaStore, Snapshot};
use crate::mounts;
use crate::path_mapping::PathMappingIndex;
use crate::paths::{self, PathResolver};

const OVERLAY_INDEX_PARAM: &str = "/sys/module/overlay/parameters/index";

/// Snapshotter configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Defer filesystem removal to `cleanup`, making keys immediately
    /// reusable after `remove`.
    pub async_remove: bool,
    /// Inject the resolved upperdir location as a label on stat/update/list.
    pub upperdir_label: bool,
    /// Default options for overlay mounts (not applied to bind mounts).
    pub mount_options: Vec<String>,
    /// Turn uid/gid mapping labels into overlay uidmap/gidmap options.
    pub remap_ids: bool,
    /// Place snapshot homes under `<shared_storage_base>/l` instead of
    /// `<root>/snapshots`.
    pub short_base_paths: bool,
}

/// Overlayfs snapshotter with shared-upperdir placement.
pub struct OverlaySnapshotter {
    resolver: PathResolver,
    store: MetaStore,
    mappings: PathMappingIndex,
    loaded_mapping_bases: Mutex<HashSet<PathBuf>>,
    options: Vec<String>,
    async_remove: bool,
    upperdir_label: bool,
    remap_ids: bool,
}

impl OverlaySnapshotter {
    /// Creates a snapshotter rooted at `root`.
    ///
    /// Validates the backing filesystem, opens the metadata store, probes
    /// kernel mount options, ensures the snapshot roots exist and, with
    /// short base paths enabled, migrates any pre-existing snapshot homes
    /// from the canonical root to the short one.
    pub fn new(root: &Path, config: Config) -> Result<Self> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(root)?;

        if !supports_d_type(root)? {
            return Err(Error::Unsupported(format!(
                "{} does not support d_type; if the backing filesystem is xfs, \
                 please reformat with ftype=1",
                root.display()
            )));
        }

        let store = MetaStore::new(root.join("metadata.db"))?;
        let resolver = PathResolver::new(root, config.short_base_paths);

        let mut options = config.mount_options;
        if !has_option(&options, "userxattr", false) {
            match needs_user_xattr() {
                Ok(true) => options.push("userxattr".to_string()),
                Ok(false) => {}
                Err(err) => {
                    warn!("cannot detect whether the userxattr mount option is needed: {err}")
                }
            }
        }
        if !has_option(&options, "index", true) && supports_index() {
            options.push("index=off".to_string());
        }

        if let Some(short_root) = resolver.short_snapshots_root() {
            builder.create(short_root)?;
        }
        builder.create(resolver.canonical_snapshots_root())?;

        if config.short_base_paths {
            migrate_snapshot_homes(&resolver);
        }

        Ok(Self {
            resolver,
            store,
            mappings: PathMappingIndex::new(),
            loaded_mapping_bases: Mutex::new(HashSet::new()),
            options,
            async_remove: config.async_remove,
            upperdir_label: config.upperdir_label,
            remap_ids: config.remap_ids,
        })
    }

    /// The path resolver, exposed for tooling.
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// The shared-storage reverse index, exposed for tooling.
    pub fn path_mappings(&self) -> &PathMappingIndex {
        &self.mappings
    }

    /// Removes directories from both snapshot roots whose basenames are not
    /// in the metadata id-set.
    pub fn cleanup(&self) -> Result<()> {
        // A write transaction freezes the id-set against concurrent creates.
        let cleanup = self.store.write(|state| Ok(self.cleanup_directories(&state.ids())))?;
        for dir in cleanup {
            debug!("cleanup removing {}", dir.display());
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!("failed to remove directory {}: {err}", dir.display());
            }
        }
        Ok(())
    }

    /// Visits every snapshot, with the upperdir label injected when enabled.
    pub fn walk(&self, mut f: impl FnMut(Info) -> Result<()>) -> Result<()> {
        let items = self.store.read(|state| Ok(state.walk()))?;
        for (id, mut item, _) in items {
            if self.upperdir_label {
                self.inject_upperdir_label(&id, &mut item);
            }
            f(item)?;
        }
        Ok(())
    }

    fn cleanup_directories(&self, ids: &HashSet<String>) -> Vec<PathBuf> {
        let mut roots = vec![self.resolver.canonical_snapshots_root()];
        roots.extend(self.resolver.short_snapshots_root());

        let mut cleanup = Vec::new();
        for root in roots {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                if !ids.contains(&name.to_string_lossy().into_owned()) {
                    cleanup.push(root.join(name));
                }
            }
        }
        cleanup
    }

    fn inject_upperdir_label(&self, id: &str, info: &mut Info) {
        let upper = match self.resolver.upper_path(id, info) {
            Ok(path) => path,
            Err(err) => {
                warn!("failed to determine upper path for snapshot {id}: {err}, using default");
                self.resolver.fallback_fs_dir(id)
            }
        };
        info.labels.insert(
            labels::UPPERDIR_LABEL.to_string(),
            upper.to_string_lossy().into_owned(),
        );
    }

    /// The uid/gid a fresh upperdir should be chowned to: the mapped root
    /// pair when remap labels are present, the nearest parent's owner
    /// otherwise, nothing for an unmapped base snapshot.
    fn resolve_chown_pair(&self, snapshot: &Snapshot, snap_info: &Info) -> Result<Option<(u32, u32)>> {
        let uid_label = snap_info.labels.get(labels::UID_MAPPING_LABEL);
        let gid_label = snap_info.labels.get(labels::GID_MAPPING_LABEL);
        if uid_label.is_some() || gid_label.is_some() {
            let id_map = IdMap::parse(
                uid_label.map(String::as_str).unwrap_or(""),
                gid_label.map(String::as_str).unwrap_or(""),
            )?;
            return id_map.root_pair().map(Some);
        }

        if let Some(parent_id) = snapshot.parent_ids.first() {
            let parent_fs = self.resolver.locate_fs_dir(parent_id)?;
            let meta = fs::metadata(&parent_fs)?;
            if !meta.is_dir() {
                return Err(Error::Internal(format!(
                    "parent {parent_id} fs is not a directory"
                )));
            }
            return Ok(Some((meta.uid(), meta.gid())));
        }

        Ok(None)
    }

    fn create_shared_directories(
        &self,
        snapshot: &Snapshot,
        snap_info: &Info,
        chown_pair: Option<(u32, u32)>,
    ) -> Result<()> {
        let shared = self.resolver.shared_paths(snap_info, &snapshot.id)?;

        let mut upper_builder = fs::DirBuilder::new();
        upper_builder.recursive(true).mode(0o755);
        upper_builder.create(&shared.upper)?;

        let mut work_builder = fs::DirBuilder::new();
        work_builder.recursive(true).mode(0o711);
        if let Err(err) = work_builder.create(&shared.work) {
            let _ = fs::remove_dir_all(&shared.upper);
            return Err(err.into());
        }
        debug!(
            "created shared upperdir {} and workdir {}",
            shared.upper.display(),
            shared.work.display()
        );

        if let Some((uid, gid)) = chown_pair {
            if let Err(err) = lchown(&shared.upper, uid, gid) {
                let _ = fs::remove_dir_all(&shared.upper);
                let _ = fs::remove_dir_all(&shared.work);
                return Err(err);
            }
        }

        // The index is advisory; a failed write never fails the snapshot.
        self.ensure_mappings_loaded(&shared.disk_path);
        if let Err(err) = self.mappings.register(
            &shared.disk_path,
            &shared.identity.pod_hash,
            &shared.identity.snapshot_hash,
            &shared.identity.namespace,
            &shared.identity.pod_name,
            &shared.identity.container_name,
            &snapshot.id,
        ) {
            warn!(
                "failed to register path mapping for {}: {err}",
                shared.base.display()
            );
        }

        // Local marker so external tooling can see the id exists.
        let marker = self.resolver.snapshots_root().join(&snapshot.id);
        if !marker.exists() {
            let mut marker_builder = fs::DirBuilder::new();
            marker_builder.mode(0o700);
            if let Err(err) = marker_builder.create(&marker) {
                warn!(
                    "failed to create local marker directory for shared snapshot {}: {err}",
                    snapshot.id
                );
            }
        }

        Ok(())
    }

    fn create_local_directories(
        &self,
        snapshot: &Snapshot,
        kind: Kind,
        chown_pair: Option<(u32, u32)>,
    ) -> Result<()> {
        let snapshots_root = self.resolver.snapshots_root();
        let temp_dir = tempfile::Builder::new()
            .prefix("new-")
            .tempdir_in(&snapshots_root)?;

        let mut fs_builder = fs::DirBuilder::new();
        fs_builder.mode(0o755);
        fs_builder.create(temp_dir.path().join("fs"))?;
        if kind == Kind::Active {
            let mut work_builder = fs::DirBuilder::new();
            work_builder.mode(0o711);
            work_builder.create(temp_dir.path().join("work"))?;
        }

        if let Some((uid, gid)) = chown_pair {
            lchown(&temp_dir.path().join("fs"), uid, gid)?;
        }

        let home = snapshots_root.join(&snapshot.id);
        fs::rename(temp_dir.path(), &home)?;
        let _ = temp_dir.into_path();
        fs::set_permissions(&home, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn create_snapshot(
        &self,
        kind: Kind,
        key: String,
        parent: String,
        snap_labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>> {
        let (snapshot, snap_info) = self.store.write(|state| {
            let snapshot = state.create_snapshot(clone_kind(&kind), &key, &parent, snap_labels)?;
            let (_, snap_info, _) = state.info(&key)?;

            let chown_pair = self.resolve_chown_pair(&snapshot, &snap_info)?;

            if paths::is_shared_snapshot(&snap_info.labels) && kind == Kind::Active {
                self.create_shared_directories(&snapshot, &snap_info, chown_pair)?;
            } else {
                self.create_local_directories(&snapshot, clone_kind(&kind), chown_pair)?;
            }

            Ok((snapshot, snap_info))
        })?;

        mounts::compose(
            &self.resolver,
            &self.options,
            self.remap_ids,
            &snapshot,
            &snap_info,
        )
    }

    fn stat_impl(&self, key: &str) -> Result<Info> {
        let (id, mut snap_info, _) = self.store.read(|state| state.info(key))?;
        if self.upperdir_label {
            self.inject_upperdir_label(&id, &mut snap_info);
        }
        Ok(snap_info)
    }

    fn update_impl(&self, snap_info: Info, fieldpaths: Option<Vec<String>>) -> Result<Info> {
        self.store.write(|state| {
            let mut updated = state.update(snap_info, fieldpaths)?;
            if self.upperdir_label {
                let (id, ..) = state.info(&updated.name)?;
                self.inject_upperdir_label(&id, &mut updated);
            }
            Ok(updated)
        })
    }

    fn usage_impl(&self, key: &str) -> Result<Usage> {
        let (id, snap_info, usage) = self.store.read(|state| state.info(key))?;
        if snap_info.kind != Kind::Active {
            return Ok(usage);
        }
        // No silent fallback to the alternate layout here: scanning the
        // wrong location would double-count or miss writes.
        let upper = self.resolver.upper_path(&id, &snap_info)?;
        diskusage::disk_usage(&upper)
    }

    fn mounts_impl(&self, key: &str) -> Result<Vec<Mount>> {
        let (snapshot, snap_info) = self.store.read(|state| {
            let snapshot = state.snapshot(key)?;
            let (_, snap_info, _) = state.info(key)?;
            Ok((snapshot, snap_info))
        })?;
        mounts::compose(
            &self.resolver,
            &self.options,
            self.remap_ids,
            &snapshot,
            &snap_info,
        )
    }

    fn commit_impl(&self, name: &str, key: &str, commit_labels: HashMap<String, String>) -> Result<()> {
        self.store.write(|state| {
            let (id, snap_info, _) = state.info(key)?;
            let upper = self.resolver.upper_path(&id, &snap_info)?;
            let usage = diskusage::disk_usage(&upper)?;
            state.commit(key, name, usage, commit_labels)?;
            Ok(())
        })
    }

    fn remove_impl(&self, key: &str) -> Result<()> {
        // Read the labels first so the shared base can still be derived
        // after the metadata record is gone.
        let pre = self.store.read(|state| match state.info(key) {
            Ok(found) => Ok(Some(found)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        })?;

        let mut retained_shared = None;
        if let Some((id, snap_info, _)) = &pre {
            if paths::is_shared_snapshot(&snap_info.labels) {
                match self.resolver.shared_paths(snap_info, id) {
                    Ok(shared) => retained_shared = Some(shared.base),
                    Err(err) => warn!(
                        "failed to determine shared path for removal of snapshot {id}: {err}, \
                         shared data may be orphaned"
                    ),
                }
            }
        }

        let cleanup = self.store.write(|state| {
            let id = state.remove(key)?;
            debug!("removed snapshot {key} (id {id}) from metadata");
            if self.async_remove {
                Ok(Vec::new())
            } else {
                Ok(self.cleanup_directories(&state.ids()))
            }
        })?;

        // Slow tree removal happens outside the transaction.
        for dir in cleanup {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!("failed to remove directory {}: {err}", dir.display());
            }
        }

        // The shared base is deliberately left in place for a later
        // incarnation of the pod; an external reaper owns its deletion.
        if let Some(base) = retained_shared {
            info!(
                "preserving shared snapshot data for potential resume at {}",
                base.display()
            );
        }

        Ok(())
    }

    fn ensure_mappings_loaded(&self, base: &Path) {
        let mut loaded = self
            .loaded_mapping_bases
            .lock()
            .expect("mapping base lock poisoned");
        if loaded.insert(base.to_path_buf()) {
            if let Err(err) = self.mappings.load(base) {
                warn!("failed to load path mappings from {}: {err}", base.display());
            }
        }
    }
}

#[tonic::async_trait]
impl Snapshotter for OverlaySnapshotter {
    type Error = Status;

    async fn stat(&self, key: String) -> std::result::Result<Info, Self::Error> {
        info!("stat({key})");
        self.stat_impl(&key).map_err(|err| {
            error!("stat({key}) failed: {err}");
            err.into()
        })
    }

    async fn update(
        &self,
        snap_info: Info,
        fieldpaths: Option<Vec<String>>,
    ) -> std::result::Result<Info, Self::Error> {
        info!("update({}, {fieldpaths:?})", snap_info.name);
        self.update_impl(snap_info, fieldpaths).map_err(|err| {
            error!("update failed: {err}");
            err.into()
        })
    }

    async fn usage(&self, key: String) -> std::result::Result<Usage, Self::Error> {
        debug!("usage({key})");
        self.usage_impl(&key).map_err(|err| {
            error!("usage({key}) failed: {err}");
            err.into()
        })
    }

    async fn mounts(&self, key: String) -> std::result::Result<Vec<Mount>, Self::Error> {
        debug!("mounts({key})");
        self.mounts_impl(&key).map_err(|err| {
            error!("mounts({key}) failed: {err}");
            err.into()
        })
    }

    async fn prepare(
        &self,
        key: String,
        parent: String,
        snap_labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<Mount>, Self::Error> {
        info!("prepare({key}, {parent})");
        self.create_snapshot(Kind::Active, key, parent, snap_labels)
            .map_err(|err| {
                error!("prepare failed: {err}");
                err.into()
            })
    }

    async fn view(
        &self,
        key: String,
        parent: String,
        snap_labels: HashMap<String, String>,
    ) -> std::result::Result<Vec<Mount>, Self::Error> {
        info!("view({key}, {parent})");
        self.create_snapshot(Kind::View, key, parent, snap_labels)
            .map_err(|err| {
                error!("view failed: {err}");
                err.into()
            })
    }

    async fn commit(
        &self,
        name: String,
        key: String,
        commit_labels: HashMap<String, String>,
    ) -> std::result::Result<(), Self::Error> {
        info!("commit({name}, {key})");
        self.commit_impl(&name, &key, commit_labels).map_err(|err| {
            error!("commit({name}, {key}) failed: {err}");
            err.into()
        })
    }

    async fn remove(&self, key: String) -> std::result::Result<(), Self::Error> {
        info!("remove({key})");
        self.remove_impl(&key).map_err(|err| {
            error!("remove({key}) failed: {err}");
            err.into()
        })
    }

    type InfoStream =
        Pin<Box<dyn Stream<Item = std::result::Result<Info, Self::Error>> + Send + 'static>>;
    async fn list(
        &self,
        _snapshotter: String,
        _filters: Vec<String>,
    ) -> std::result::Result<Self::InfoStream, Self::Error> {
        info!("list()");
        let mut items = Vec::new();
        self.walk(|item| {
            items.push(item);
            Ok(())
        })
        .map_err(Status::from)?;
        Ok(Box::pin(async_stream::try_stream! {
            for item in items {
                yield item;
            }
        }))
    }
}

fn lchown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    fchownat(
        None,
        path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
        FchownatFlags::NoFollowSymlink,
    )?;
    Ok(())
}

fn has_option(options: &[String], key: &str, has_value: bool) -> bool {
    options.iter().any(|option| {
        if has_value {
            option
                .strip_prefix(key)
                .map(|rest| rest.starts_with('='))
                .unwrap_or(false)
        } else {
            option == key
        }
    })
}

/// Checks that directory entries on the backing filesystem report their file
/// type, which overlayfs requires (xfs needs ftype=1 for this).
fn supports_d_type(path: &Path) -> Result<bool> {
    let probe_name = ".dtype-probe";
    let probe = path.join(probe_name);
    fs::File::create(&probe)?;

    let result = (|| {
        let mut dir = nix::dir::Dir::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?;
        for entry in dir.iter() {
            let entry = entry?;
            if entry.file_name().to_bytes() == probe_name.as_bytes() {
                return Ok(entry.file_type().is_some());
            }
        }
        Ok(true)
    })();

    let _ = fs::remove_file(&probe);
    result
}

/// Whether overlay mounts made by this process need the `userxattr` option:
/// true when running inside a user namespace.
fn needs_user_xattr() -> Result<bool> {
    let uid_map = fs::read_to_string("/proc/self/uid_map")?;
    let fields: Vec<&str> = uid_map.split_whitespace().collect();
    Ok(fields != ["0", "0", "4294967295"])
}

/// Whether the kernel exposes the overlay `index` module parameter.
fn supports_index() -> bool {
    Path::new(OVERLAY_INDEX_PARAM).exists()
}

/// Moves pre-existing snapshot homes from the canonical root to the short
/// root, one rename per snapshot, best effort. Migration is refused outright
/// when the short root already holds entries, since a mixed layout with an
/// unknown id set cannot be reconciled safely; dual-location lookup absorbs
/// whatever stays behind.
fn migrate_snapshot_homes(resolver: &PathResolver) {
    let Some(short_root) = resolver.short_snapshots_root() else {
        return;
    };
    let canonical = resolver.canonical_snapshots_root();

    let entries: Vec<_> = match fs::read_dir(&canonical) {
        Ok(entries) => entries.flatten().collect(),
        Err(_) => return,
    };
    if entries.is_empty() {
        return;
    }

    let short_occupied = fs::read_dir(&short_root)
        .map(|mut dir| dir.next().is_some())
        .unwrap_or(false);
    if short_occupied {
        warn!(
            "not migrating {} snapshot homes from {}: short root {} is not empty",
            entries.len(),
            canonical.display(),
            short_root.display()
        );
        return;
    }

    let mut migrated = 0usize;
    for entry in &entries {
        let from = entry.path();
        let to = short_root.join(entry.file_name());
        match fs::rename(&from, &to) {
            Ok(()) => migrated += 1,
            Err(err) => warn!(
                "failed to migrate snapshot home {} to {}: {err}",
                from.display(),
                to.display()
            ),
        }
    }
    info!(
        "migrated {migrated}/{} snapshot homes to {}",
        entries.len(),
        short_root.display()
    );
}
