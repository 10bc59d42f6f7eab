//! Disk usage scanning for active upperdirs.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use containerd_snapshots::Usage;
use walkdir::WalkDir;

use crate::error::Result;

/// Computes the `(size, inodes)` usage of a directory tree.
///
/// Hardlinked files are counted once, keyed by `(dev, ino)`. Sizes are the
/// byte lengths of regular files; directory metadata is not charged.
pub fn disk_usage(path: &Path) -> Result<Usage> {
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut size: i64 = 0;

    for entry in WalkDir::new(path) {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        if meta.is_file() {
            size += meta.len() as i64;
        }
    }

    Ok(Usage {
        inodes: seen.len() as i64,
        size,
    })
}
