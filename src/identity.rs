//! Derivation of short, fixed-width identifiers from pod and snapshot
//! identity.
//!
//! Shared upperdirs are addressed as `<base>/<pod_hash>/<snapshot_hash>`;
//! keeping both components at eight hex characters keeps `lowerdir=` mount
//! option strings well inside the kernel's single-page limit even for deeply
//! layered images.

use sha2::{Digest, Sha256};

/// Width, in hex characters, of a derived identity hash.
pub const HASH_LEN: usize = 8;

/// Returns the full lowercase hex SHA-256 of the input.
pub fn hash_string(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn short_hash(s: &str) -> String {
    let mut h = hash_string(s);
    h.truncate(HASH_LEN);
    h
}

/// Derives the pod-identity hash from the namespace, pod name and container
/// name labels.
pub fn pod_hash(namespace: &str, pod_name: &str, container_name: &str) -> String {
    short_hash(&format!("{namespace}/{pod_name}/{container_name}"))
}

/// Derives the snapshot hash from the engine-assigned snapshot id.
pub fn snapshot_hash(id: &str) -> String {
    short_hash(id)
}
