//! Disk arbitration trait.

use crate::{Dissent, HalResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque handle the backend uses to address a disk independently of where
/// (or whether) it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskRef(String);

impl DiskRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of what the disk arbitration service knows about one mounted
/// volume. Every attribute is optional because backends may not report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescription {
    pub disk: DiskRef,
    pub volume_uuid: Option<String>,
    pub volume_name: Option<String>,
    pub device_internal: Option<bool>,
    pub media_ejectable: Option<bool>,
    pub volume_path: Option<PathBuf>,
    /// Backed by a disk image (loop device) rather than real media.
    pub disk_image: bool,
}

/// Called exactly once when a mount/unmount request finishes.
pub type Completion = Box<dyn FnOnce(Result<(), Dissent>) + Send + 'static>;

/// Trait for enumerating, describing, mounting and unmounting disks.
///
/// Mount and unmount are asynchronous: they return as soon as the request is
/// issued and report the outcome through the [`Completion`].
pub trait DiskOps: Send + Sync {
    /// All currently mounted filesystem locations, in mount table order.
    fn mounted_locations(&self) -> HalResult<Vec<PathBuf>>;

    /// Describe the disk mounted at `location`.
    ///
    /// Returns `Ok(None)` when the location is not backed by a disk the
    /// arbitration service knows about.
    fn describe(&self, location: &Path) -> HalResult<Option<DiskDescription>>;

    /// Request an unmount. `force` overrides open-file dissent.
    fn unmount_disk(&self, disk: &DiskRef, force: bool, done: Completion);

    /// Request a mount by device reference.
    fn mount_disk(&self, disk: &DiskRef, done: Completion);
}
