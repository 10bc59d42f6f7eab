//! Content-addressed, layered filesystem management for container runtimes,
//! built on Linux overlayfs.
//!
//! Beyond the conventional local overlay snapshotter, selected snapshots
//! (chosen by metadata labels) place their writable layer on shared storage
//! at a path derived deterministically from pod identity, and snapshot homes
//! can be relocated to a short sibling root so that `lowerdir=` mount
//! options stay within the kernel's limit for deeply layered images.

pub mod diskusage;
pub mod error;
pub mod identity;
pub mod idmap;
pub mod labels;
pub mod metadata;
pub mod mounts;
pub mod path_mapping;
pub mod paths;
pub mod snapshotter;

pub use error::{Error, Result};
pub use snapshotter::{Config, OverlaySnapshotter};
