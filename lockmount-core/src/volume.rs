//! Volume model: which mounted filesystems count as external, and how they
//! are unmounted and re-mounted.
//!
//! A [`Volume`] is rebuilt from a live [`DiskDescription`] on every
//! enumeration. Its identity is the filesystem UUID, never the mount path;
//! the only thing persisted about it is the per-id enabled flag.

use crate::preferences::PreferenceStore;
use anyhow::Result;
use lockmount_hal::{Completion, DiskDescription, DiskOps, DiskRef};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Volumes carrying this label are firmware partitions and never managed.
pub const RESERVED_EFI_LABEL: &str = "EFI";

/// Where udisks mounts removable media on Linux.
pub const DEFAULT_VOLUME_ROOTS: &[&str] = &["/media", "/run/media"];

pub fn default_volume_roots() -> Vec<PathBuf> {
    DEFAULT_VOLUME_ROOTS.iter().map(PathBuf::from).collect()
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub name: String,
    /// Mount path at enumeration time.
    pub location: PathBuf,
    pub disk: DiskRef,
}

impl PartialEq for Volume {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Volume {}

impl Hash for Volume {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

impl Volume {
    /// Build a volume from an eligible description. Returns `None` when the
    /// description cannot identify a managed volume.
    pub fn from_description(desc: &DiskDescription, location: &Path) -> Option<Self> {
        if !is_eligible_external_volume(desc) {
            return None;
        }
        let id = desc.volume_uuid.clone()?;
        let location = desc
            .volume_path
            .clone()
            .unwrap_or_else(|| location.to_path_buf());
        let name = desc.volume_name.clone().unwrap_or_else(|| id.clone());
        Some(Self {
            id,
            name,
            location,
            disk: desc.disk.clone(),
        })
    }

    pub fn enabled(&self, prefs: &PreferenceStore) -> bool {
        prefs.volume_enabled(&self.id)
    }

    pub fn set_enabled(&self, prefs: &mut PreferenceStore, enabled: bool) -> Result<()> {
        prefs.set_volume_enabled(&self.id, enabled)
    }

    pub fn unmount(&self, disks: &dyn DiskOps, force: bool) {
        self.unmount_then(disks, force, Box::new(|_| {}));
    }

    /// Unmount and report the outcome to `on_done` after logging it.
    pub fn unmount_then(&self, disks: &dyn DiskOps, force: bool, on_done: Completion) {
        log::info!("Unmounting {} from {}", self, self.location.display());
        let label = self.to_string();
        disks.unmount_disk(
            &self.disk,
            force,
            Box::new(move |result| {
                match &result {
                    Ok(()) => log::debug!("Unmounted {}", label),
                    Err(dissent) => log::warn!("Unmount of {} refused: {}", label, dissent),
                }
                on_done(result);
            }),
        );
    }

    pub fn mount(&self, disks: &dyn DiskOps) {
        self.mount_then(disks, Box::new(|_| {}));
    }

    /// Mount by device reference and report the outcome to `on_done`.
    pub fn mount_then(&self, disks: &dyn DiskOps, on_done: Completion) {
        log::info!("Mounting {}", self);
        let label = self.to_string();
        disks.mount_disk(
            &self.disk,
            Box::new(move |result| {
                match &result {
                    Ok(()) => log::debug!("Mounted {}", label),
                    Err(dissent) => log::warn!("Mount of {} refused: {}", label, dissent),
                }
                on_done(result);
            }),
        );
    }
}

/// Whether a disk description is a removable volume we may manage.
///
/// A description without a UUID or without the internal flag is excluded,
/// as are disk images, internal non-ejectable devices and EFI partitions.
pub fn is_eligible_external_volume(desc: &DiskDescription) -> bool {
    if desc.volume_uuid.as_deref().map_or(true, str::is_empty) {
        return false;
    }
    let Some(internal) = desc.device_internal else {
        return false;
    };
    if internal && !desc.media_ejectable.unwrap_or(false) {
        return false;
    }
    if desc.disk_image {
        return false;
    }
    desc.volume_name.as_deref() != Some(RESERVED_EFI_LABEL)
}

/// True when `location` lies strictly below one of `roots`.
pub fn is_under_volume_roots(location: &Path, roots: &[PathBuf]) -> bool {
    roots
        .iter()
        .any(|root| location != root.as_path() && location.starts_with(root))
}

/// Currently mounted external volumes, in enumeration order, one per id.
///
/// Enumeration failure is logged and reads as no volumes.
pub fn list_mounted_external_volumes(disks: &dyn DiskOps, roots: &[PathBuf]) -> Vec<Volume> {
    let locations = match disks.mounted_locations() {
        Ok(locations) => locations,
        Err(err) => {
            log::warn!("Failed to enumerate mounted volumes: {}", err);
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut volumes = Vec::new();
    for location in locations
        .iter()
        .filter(|l| is_under_volume_roots(l, roots))
    {
        let desc = match disks.describe(location) {
            Ok(Some(desc)) => desc,
            Ok(None) => {
                log::debug!("No disk description for {}", location.display());
                continue;
            }
            Err(err) => {
                log::debug!("Failed to describe {}: {}", location.display(), err);
                continue;
            }
        };
        let Some(volume) = Volume::from_description(&desc, location) else {
            log::debug!("Skipping ineligible volume at {}", location.display());
            continue;
        };
        if seen.insert(volume.id.clone()) {
            volumes.push(volume);
        }
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockmount_hal::{Dissent, FakeDisk, FakeHal};
    use std::sync::mpsc;

    fn roots() -> Vec<PathBuf> {
        default_volume_roots()
    }

    fn desc(uuid: &str, name: &str) -> DiskDescription {
        DiskDescription {
            disk: DiskRef::new("/dev/sdb1"),
            volume_uuid: Some(uuid.to_string()),
            volume_name: Some(name.to_string()),
            device_internal: Some(false),
            media_ejectable: Some(true),
            volume_path: Some(PathBuf::from(format!("/media/{}", name))),
            disk_image: false,
        }
    }

    #[test]
    fn classification_rules() {
        assert!(is_eligible_external_volume(&desc("1", "USB")));

        let mut d = desc("1", "EFI");
        assert!(!is_eligible_external_volume(&d));

        d = desc("1", "Image");
        d.disk_image = true;
        assert!(!is_eligible_external_volume(&d));

        d = desc("1", "Internal");
        d.device_internal = Some(true);
        d.media_ejectable = Some(false);
        assert!(!is_eligible_external_volume(&d));

        // Internal but ejectable, e.g. an SD card reader on the mainboard.
        d.media_ejectable = Some(true);
        assert!(is_eligible_external_volume(&d));

        d = desc("1", "NoFlag");
        d.device_internal = None;
        assert!(!is_eligible_external_volume(&d));

        d = desc("", "NoUuid");
        assert!(!is_eligible_external_volume(&d));
    }

    #[test]
    fn classification_is_pure() {
        let d = desc("1", "USB");
        assert_eq!(
            is_eligible_external_volume(&d),
            is_eligible_external_volume(&d.clone())
        );
    }

    #[test]
    fn identity_ignores_location() {
        let a = Volume::from_description(&desc("1111", "USB"), Path::new("/media/USB")).unwrap();
        let mut moved = desc("1111", "Renamed");
        moved.volume_path = Some(PathBuf::from("/run/media/me/USB1"));
        let b = Volume::from_description(&moved, Path::new("/run/media/me/USB1")).unwrap();
        assert_eq!(a, b);

        let other = Volume::from_description(&desc("2222", "USB"), Path::new("/media/USB")).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn roots_must_strictly_contain_location() {
        let roots = roots();
        assert!(is_under_volume_roots(Path::new("/media/USB"), &roots));
        assert!(is_under_volume_roots(
            Path::new("/run/media/alex/USB"),
            &roots
        ));
        assert!(!is_under_volume_roots(Path::new("/media"), &roots));
        assert!(!is_under_volume_roots(Path::new("/mediafoo/x"), &roots));
        assert!(!is_under_volume_roots(Path::new("/home"), &roots));
    }

    #[test]
    fn lists_only_external_volumes() {
        let hal = FakeHal::new();
        hal.add_plain_mount("/");
        hal.add_plain_mount("/media/plain");
        hal.attach(FakeDisk::external("/dev/sdb1", "1111", "USB", "/media/USB"));
        hal.attach(FakeDisk::external("/dev/sdc1", "2222", "EFI", "/media/EFI"));
        hal.attach(FakeDisk::external("/dev/loop0", "3333", "Img", "/media/Img").disk_image());
        hal.attach(FakeDisk::external("/dev/sdd1", "4444", "Home", "/home/data"));

        let volumes = list_mounted_external_volumes(&hal, &roots());
        let ids: Vec<&str> = volumes.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["1111"]);
        assert_eq!(volumes[0].location, PathBuf::from("/media/USB"));
    }

    #[test]
    fn enumeration_skips_fixed_and_undescribed_disks() {
        let hal = FakeHal::new();
        hal.attach(
            FakeDisk::external("/dev/nvme0n1p3", "1111", "Data", "/media/Data")
                .internal(true)
                .ejectable(false),
        );
        // Card reader on the mainboard: internal but ejectable.
        hal.attach(
            FakeDisk::external("/dev/mmcblk0p1", "2222", "SD", "/media/SD")
                .internal(true)
                .ejectable(true),
        );
        hal.attach(FakeDisk::external("/dev/sdb1", "3333", "NoId", "/media/NoId").without_uuid());
        hal.attach(FakeDisk::external("/dev/sdc1", "4444", "Bare", "/media/Bare").without_flags());
        hal.attach(FakeDisk::external(
            "/dev/sdd1",
            "5555",
            "Stick",
            "/run/media/alex/Stick",
        ));

        let ids: Vec<String> = list_mounted_external_volumes(&hal, &roots())
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec!["2222", "5555"]);
    }

    #[test]
    fn duplicate_ids_are_listed_once() {
        let hal = FakeHal::new();
        hal.attach(FakeDisk::external("/dev/sdb1", "1111", "USB", "/media/USB"));
        hal.attach(FakeDisk::external("/dev/sdc1", "1111", "Clone", "/media/Clone"));

        let volumes = list_mounted_external_volumes(&hal, &roots());
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "USB");
    }

    #[test]
    fn enumeration_failure_reads_as_empty() {
        let hal = FakeHal::new();
        hal.attach(FakeDisk::external("/dev/sdb1", "1111", "USB", "/media/USB"));
        hal.break_enumeration(true);
        assert!(list_mounted_external_volumes(&hal, &roots()).is_empty());
    }

    #[test]
    fn enabled_defaults_to_true_and_persists_through_store() {
        let mut prefs = PreferenceStore::in_memory();
        let volume =
            Volume::from_description(&desc("1111", "USB"), Path::new("/media/USB")).unwrap();
        assert!(volume.enabled(&prefs));
        volume.set_enabled(&mut prefs, false).unwrap();
        assert!(!volume.enabled(&prefs));
    }

    #[test]
    fn unmount_dissent_reaches_the_caller() {
        let hal = FakeHal::new();
        hal.attach(FakeDisk::external("/dev/sdb1", "1111", "USB", "/media/USB"));
        hal.refuse_unmount("/dev/sdb1", Dissent::Busy);
        let volume = list_mounted_external_volumes(&hal, &roots()).remove(0);

        let (tx, rx) = mpsc::channel();
        volume.unmount_then(&hal, true, Box::new(move |r| tx.send(r).unwrap()));
        assert_eq!(rx.recv().unwrap(), Err(Dissent::Busy));
        assert!(hal.is_disk_mounted("/dev/sdb1"));
    }

    #[test]
    fn mount_goes_by_device_reference() {
        let hal = FakeHal::new();
        hal.attach(FakeDisk::external("/dev/sdb1", "1111", "USB", "/media/USB"));
        let volume = list_mounted_external_volumes(&hal, &roots()).remove(0);

        volume.unmount(&hal, false);
        assert!(!hal.is_disk_mounted("/dev/sdb1"));
        volume.mount(&hal);
        assert!(hal.is_disk_mounted("/dev/sdb1"));
        assert_eq!(hal.mount_count("/dev/sdb1"), 1);
    }
}
