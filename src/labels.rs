//! Snapshot label keys recognized by the snapshotter.
//!
//! All keys live under the `containerd.io/snapshot/` namespace and arrive
//! verbatim from the CRI layer above.

/// Optional output label carrying the resolved location of a snapshot's
/// upperdir (the change set between the snapshot and its parent).
pub const UPPERDIR_LABEL: &str = "containerd.io/snapshot/overlay.upperdir";

/// Marker label that activates shared-storage placement. Value must be the
/// literal string `"true"`.
pub const USE_SHARED_STORAGE_LABEL: &str = "containerd.io/snapshot/use-shared-storage";

/// Absolute base path on shared storage under which shared upperdirs live.
pub const SHARED_DISK_PATH_LABEL: &str = "containerd.io/snapshot/shared-disk-path";

/// Kubernetes namespace of the pod the snapshot belongs to.
pub const K8S_NAMESPACE_LABEL: &str = "containerd.io/snapshot/k8s-namespace";

/// Kubernetes pod name of the pod the snapshot belongs to.
pub const K8S_POD_NAME_LABEL: &str = "containerd.io/snapshot/k8s-pod-name";

/// Kubernetes container name within the pod.
pub const K8S_CONTAINER_NAME_LABEL: &str = "containerd.io/snapshot/k8s-container-name";

/// UID remapping requested for the snapshot, as `container:host:size` triples.
pub const UID_MAPPING_LABEL: &str = "containerd.io/snapshot/uidmapping";

/// GID remapping requested for the snapshot, as `container:host:size` triples.
pub const GID_MAPPING_LABEL: &str = "containerd.io/snapshot/gidmapping";
