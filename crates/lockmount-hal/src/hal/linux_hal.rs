//! Linux HAL implementation backed by UDisks2 on the system bus.
//!
//! Mounted locations come from `/proc/self/mountinfo`; everything else
//! (identity, drive flags, mount and unmount) goes through UDisks2 so an
//! unprivileged session daemon can manage removable media the same way the
//! desktop file manager does.

use super::{Completion, DiskDescription, DiskOps, DiskRef};
use crate::procfs::mountinfo::{find_mount, read_mountinfo};
use crate::{Dissent, HalError, HalResult};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedObjectPath, Value};

const UDISKS2_DESTINATION: &str = "org.freedesktop.UDisks2";
const UDISKS2_MANAGER_PATH: &str = "/org/freedesktop/UDisks2/Manager";
const UDISKS2_BLOCK_DEVICES: &str = "/org/freedesktop/UDisks2/block_devices";
const MANAGER_INTERFACE: &str = "org.freedesktop.UDisks2.Manager";
const BLOCK_INTERFACE: &str = "org.freedesktop.UDisks2.Block";
const DRIVE_INTERFACE: &str = "org.freedesktop.UDisks2.Drive";
const FILESYSTEM_INTERFACE: &str = "org.freedesktop.UDisks2.Filesystem";
const LOOP_INTERFACE: &str = "org.freedesktop.UDisks2.Loop";

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Buses whose drives are hot-pluggable and therefore never "internal".
const EXTERNAL_BUSES: &[&str] = &["usb", "sdio", "ieee1394"];

/// Real disk arbitration backend for Linux systems.
#[derive(Debug, Clone)]
pub struct LinuxHal {
    conn: Connection,
}

impl LinuxHal {
    pub fn new() -> HalResult<Self> {
        let conn = Connection::system()
            .map_err(|e| HalError::Unavailable(format!("system bus: {}", e)))?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn proxy<'a>(&'a self, path: &'a str, interface: &'static str) -> HalResult<Proxy<'a>> {
        Ok(Proxy::new(&self.conn, UDISKS2_DESTINATION, path, interface)?)
    }

    /// Map a device node (e.g. `/dev/sdb1`) to its UDisks2 block object.
    fn resolve_block(&self, device: &str) -> HalResult<Option<String>> {
        let manager = self.proxy(UDISKS2_MANAGER_PATH, MANAGER_INTERFACE)?;
        let mut devspec: HashMap<&str, Value<'_>> = HashMap::new();
        devspec.insert("path", Value::from(device));
        let options: HashMap<&str, Value<'_>> = HashMap::new();

        match manager.call::<_, _, Vec<OwnedObjectPath>>("ResolveDevice", &(devspec, options)) {
            Ok(paths) => Ok(paths.into_iter().next().map(|p| p.as_str().to_string())),
            Err(err) => {
                // ResolveDevice needs UDisks2 >= 2.7; fall back to the
                // object naming convention.
                log::debug!("ResolveDevice({}) failed: {}", device, err);
                let name = fs::canonicalize(device)
                    .ok()
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
                Ok(name.map(|n| format!("{}/{}", UDISKS2_BLOCK_DEVICES, n.replace('-', "_2d"))))
            }
        }
    }

    fn describe_block(&self, block_path: &str, location: &Path) -> HalResult<DiskDescription> {
        let block = self.proxy(block_path, BLOCK_INTERFACE)?;
        let uuid: String = block.get_property("IdUUID")?;
        let label: String = block.get_property("IdLabel")?;
        let drive: OwnedObjectPath = block.get_property("Drive")?;

        let disk_image = self
            .proxy(block_path, LOOP_INTERFACE)
            .and_then(|p| Ok(p.get_property::<u32>("SetupByUID")?))
            .is_ok();

        let (device_internal, media_ejectable) = if drive.as_str() == "/" {
            (None, None)
        } else {
            let drive = self.proxy(drive.as_str(), DRIVE_INTERFACE)?;
            let removable: bool = drive.get_property("Removable")?;
            let ejectable: bool = drive.get_property("Ejectable")?;
            let bus: String = drive.get_property("ConnectionBus")?;
            let internal = !(removable || EXTERNAL_BUSES.contains(&bus.as_str()));
            (Some(internal), Some(ejectable))
        };

        // Unlabelled filesystems are mounted under their UUID or a generic
        // name by udisks; that directory name is what the user sees.
        let volume_name = if label.is_empty() {
            location
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        } else {
            Some(label)
        };

        Ok(DiskDescription {
            disk: DiskRef::new(block_path),
            volume_uuid: (!uuid.is_empty()).then_some(uuid),
            volume_name,
            device_internal,
            media_ejectable,
            volume_path: Some(location.to_path_buf()),
            disk_image,
        })
    }
}

fn map_call_err(err: zbus::Error) -> Dissent {
    match err {
        zbus::Error::MethodError(name, detail, _) => {
            Dissent::from_udisks_error(name.as_str(), detail.as_deref())
        }
        other => Dissent::Other(other.to_string()),
    }
}

fn filesystem_proxy<'a>(conn: &'a Connection, disk: &'a DiskRef) -> Result<Proxy<'a>, Dissent> {
    Proxy::new(conn, UDISKS2_DESTINATION, disk.as_str(), FILESYSTEM_INTERFACE).map_err(map_call_err)
}

fn unmount_blocking(conn: &Connection, disk: &DiskRef, force: bool) -> Result<(), Dissent> {
    let mut options: HashMap<&str, Value<'_>> = HashMap::new();
    options.insert("force", Value::from(force));
    // Nobody is at the keyboard while the session is locked.
    options.insert("auth.no_user_interaction", Value::from(true));
    let () = filesystem_proxy(conn, disk)?
        .call("Unmount", &(options,))
        .map_err(map_call_err)?;
    Ok(())
}

fn mount_blocking(conn: &Connection, disk: &DiskRef) -> Result<(), Dissent> {
    let options: HashMap<&str, Value<'_>> = HashMap::new();
    let mount_path: String = filesystem_proxy(conn, disk)?
        .call("Mount", &(options,))
        .map_err(map_call_err)?;
    log::debug!("{} mounted at {}", disk, mount_path);
    Ok(())
}

impl DiskOps for LinuxHal {
    fn mounted_locations(&self) -> HalResult<Vec<PathBuf>> {
        Ok(read_mountinfo(Path::new(MOUNTINFO_PATH))?
            .into_iter()
            .map(|entry| entry.mount_point)
            .collect())
    }

    fn describe(&self, location: &Path) -> HalResult<Option<DiskDescription>> {
        let entries = read_mountinfo(Path::new(MOUNTINFO_PATH))?;
        let Some(entry) = find_mount(location, &entries) else {
            return Ok(None);
        };
        if !entry.source.starts_with("/dev/") {
            return Ok(None);
        }
        let Some(block_path) = self.resolve_block(&entry.source)? else {
            return Ok(None);
        };
        self.describe_block(&block_path, location).map(Some)
    }

    fn unmount_disk(&self, disk: &DiskRef, force: bool, done: Completion) {
        let conn = self.conn.clone();
        let disk = disk.clone();
        std::thread::spawn(move || done(unmount_blocking(&conn, &disk, force)));
    }

    fn mount_disk(&self, disk: &DiskRef, done: Completion) {
        let conn = self.conn.clone();
        let disk = disk.clone();
        std::thread::spawn(move || done(mount_blocking(&conn, &disk)));
    }
}
