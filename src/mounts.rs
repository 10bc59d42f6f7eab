//! Composition of overlay and bind mount descriptors for snapshots.

use containerd_snapshots::api::types::Mount;
use containerd_snapshots::{Info, Kind};
use log::debug;

use crate::error::Result;
use crate::labels;
use crate::metadata::Snapshot;
use crate::paths::PathResolver;

/// Builds the mount descriptors for a snapshot.
///
/// With no parents the snapshot is exposed as a bind mount of its own `fs`;
/// a view of a single committed layer binds that layer read-only; everything
/// else becomes an overlay whose `lowerdir` lists the parents nearest-first,
/// exactly in the order reported by the metadata store.
pub fn compose(
    resolver: &PathResolver,
    default_options: &[String],
    remap_ids: bool,
    snapshot: &Snapshot,
    info: &Info,
) -> Result<Vec<Mount>> {
    let mut id_map_options = Vec::new();
    if remap_ids {
        if let Some(v) = info.labels.get(labels::UID_MAPPING_LABEL) {
            id_map_options.push(format!("uidmap={v}"));
        }
        if let Some(v) = info.labels.get(labels::GID_MAPPING_LABEL) {
            id_map_options.push(format!("gidmap={v}"));
        }
    }

    if snapshot.parent_ids.is_empty() {
        let ro_flag = if snapshot.kind == Kind::View { "ro" } else { "rw" };
        let mut options = id_map_options;
        options.push(ro_flag.to_string());
        options.push("rbind".to_string());
        return Ok(vec![Mount {
            r#type: "bind".to_string(),
            source: resolver
                .upper_path(&snapshot.id, info)?
                .to_string_lossy()
                .into_owned(),
            target: String::new(),
            options,
        }]);
    }

    if snapshot.kind == Kind::View && snapshot.parent_ids.len() == 1 {
        let parent_fs = resolver.locate_fs_dir(&snapshot.parent_ids[0])?;
        let mut options = id_map_options;
        options.push("ro".to_string());
        options.push("rbind".to_string());
        return Ok(vec![Mount {
            r#type: "bind".to_string(),
            source: parent_fs.to_string_lossy().into_owned(),
            target: String::new(),
            options,
        }]);
    }

    let mut options: Vec<String> = default_options.to_vec();
    options.extend(id_map_options);

    let parent_paths = snapshot
        .parent_ids
        .iter()
        .map(|id| {
            resolver
                .locate_fs_dir(id)
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect::<Result<Vec<String>>>()?;
    options.push(format!("lowerdir={}", parent_paths.join(":")));

    if snapshot.kind == Kind::Active {
        options.push(format!(
            "upperdir={}",
            resolver.upper_path(&snapshot.id, info)?.display()
        ));
        options.push(format!(
            "workdir={}",
            resolver.work_path(&snapshot.id, info)?.display()
        ));
    }

    debug!(
        "composed overlay options for snapshot {} ({} bytes)",
        snapshot.id,
        options.iter().map(|o| o.len() + 1).sum::<usize>()
    );

    Ok(vec![Mount {
        r#type: "overlay".to_string(),
        source: "overlay".to_string(),
        target: String::new(),
        options,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn local_info(kind: Kind) -> Info {
        Info {
            kind,
            name: "k".to_string(),
            ..Info::default()
        }
    }

    fn resolver_with_parents(root: &Path, ids: &[&str]) -> PathResolver {
        for id in ids {
            fs::create_dir_all(root.join("snapshots").join(id).join("fs")).unwrap();
        }
        PathResolver::new(root, false)
    }

    #[test]
    fn base_active_is_a_rw_bind() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_parents(dir.path(), &["1"]);
        let snapshot = Snapshot {
            id: "1".to_string(),
            kind: Kind::Active,
            parent_ids: Vec::new(),
        };

        let mounts = compose(&resolver, &[], false, &snapshot, &local_info(Kind::Active)).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].r#type, "bind");
        assert_eq!(
            mounts[0].source,
            dir.path().join("snapshots/1/fs").to_string_lossy()
        );
        assert_eq!(mounts[0].options, vec!["rw", "rbind"]);
    }

    #[test]
    fn view_of_single_parent_binds_the_parent_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_parents(dir.path(), &["7"]);
        let snapshot = Snapshot {
            id: "8".to_string(),
            kind: Kind::View,
            parent_ids: vec!["7".to_string()],
        };

        let mounts = compose(&resolver, &[], false, &snapshot, &local_info(Kind::View)).unwrap();
        assert_eq!(mounts[0].r#type, "bind");
        assert_eq!(
            mounts[0].source,
            dir.path().join("snapshots/7/fs").to_string_lossy()
        );
        assert_eq!(mounts[0].options, vec!["ro", "rbind"]);
    }

    #[test]
    fn overlay_preserves_parent_order_nearest_first() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_parents(dir.path(), &["7", "8", "9", "10"]);
        let snapshot = Snapshot {
            id: "10".to_string(),
            kind: Kind::Active,
            parent_ids: vec!["9".to_string(), "8".to_string(), "7".to_string()],
        };

        let mounts = compose(
            &resolver,
            &["index=off".to_string()],
            false,
            &snapshot,
            &local_info(Kind::Active),
        )
        .unwrap();
        assert_eq!(mounts[0].r#type, "overlay");
        assert_eq!(mounts[0].source, "overlay");

        let root = dir.path().join("snapshots");
        let lowerdir = format!(
            "lowerdir={}:{}:{}",
            root.join("9/fs").display(),
            root.join("8/fs").display(),
            root.join("7/fs").display()
        );
        assert_eq!(
            mounts[0].options,
            vec![
                "index=off".to_string(),
                lowerdir,
                format!("upperdir={}", root.join("10/fs").display()),
                format!("workdir={}", root.join("10/work").display()),
            ]
        );
    }

    #[test]
    fn view_with_many_parents_has_no_upperdir() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_parents(dir.path(), &["7", "8"]);
        let snapshot = Snapshot {
            id: "9".to_string(),
            kind: Kind::View,
            parent_ids: vec!["8".to_string(), "7".to_string()],
        };

        let mounts = compose(&resolver, &[], false, &snapshot, &local_info(Kind::View)).unwrap();
        assert!(mounts[0]
            .options
            .iter()
            .all(|o| !o.starts_with("upperdir=") && !o.starts_with("workdir=")));
        assert!(mounts[0].options.iter().any(|o| o.starts_with("lowerdir=")));
    }

    #[test]
    fn id_map_options_come_before_lowerdir() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_parents(dir.path(), &["7", "8"]);
        let snapshot = Snapshot {
            id: "8".to_string(),
            kind: Kind::Active,
            parent_ids: vec!["7".to_string()],
        };
        let mut info = local_info(Kind::Active);
        info.labels
            .insert(labels::UID_MAPPING_LABEL.to_string(), "0:1000:65536".into());
        info.labels
            .insert(labels::GID_MAPPING_LABEL.to_string(), "0:1000:65536".into());

        let mounts = compose(
            &resolver,
            &["userxattr".to_string()],
            true,
            &snapshot,
            &info,
        )
        .unwrap();
        let options = &mounts[0].options;
        assert_eq!(options[0], "userxattr");
        assert_eq!(options[1], "uidmap=0:1000:65536");
        assert_eq!(options[2], "gidmap=0:1000:65536");
        assert!(options[3].starts_with("lowerdir="));

        // Remapping disabled: the labels are ignored.
        let mounts = compose(&resolver, &[], false, &snapshot, &info).unwrap();
        assert!(mounts[0].options.iter().all(|o| !o.starts_with("uidmap=")));
    }

    #[test]
    fn missing_parent_in_both_layouts_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_with_parents(dir.path(), &["8"]);
        let snapshot = Snapshot {
            id: "8".to_string(),
            kind: Kind::Active,
            parent_ids: vec!["404".to_string()],
        };

        let err = compose(&resolver, &[], false, &snapshot, &local_info(Kind::Active)).unwrap_err();
        assert!(err.is_not_found());
    }
}
