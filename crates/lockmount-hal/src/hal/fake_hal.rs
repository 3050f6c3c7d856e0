//! Fake HAL implementation for testing.
//!
//! FakeHal models a handful of disks in memory and records each operation so
//! tests can assert on exactly what the controller asked for. Requests
//! complete synchronously unless mounts are deferred, in which case the
//! completions wait for [`FakeHal::complete_pending_mounts`]. FakeSignals
//! lets tests emit system signals by hand.

use super::{
    Completion, DiskDescription, DiskOps, DiskRef, SignalOps, SignalSink, SignalSubscription,
    SubscriptionTable, SystemSignal,
};
use crate::{Dissent, HalError, HalResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Unmount { disk: DiskRef, force: bool },
    Mount { disk: DiskRef },
}

/// A disk known to the fake disk arbitration service.
#[derive(Debug, Clone)]
pub struct FakeDisk {
    pub disk: DiskRef,
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub internal: Option<bool>,
    pub ejectable: Option<bool>,
    pub disk_image: bool,
    /// Where the disk lands on its next mount.
    pub mount_point: PathBuf,
}

impl FakeDisk {
    /// A removable USB-style disk with a label and UUID.
    pub fn external(disk: &str, uuid: &str, name: &str, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            disk: DiskRef::new(disk),
            uuid: Some(uuid.to_string()),
            name: Some(name.to_string()),
            internal: Some(false),
            ejectable: Some(true),
            disk_image: false,
            mount_point: mount_point.into(),
        }
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = Some(internal);
        self
    }

    pub fn ejectable(mut self, ejectable: bool) -> Self {
        self.ejectable = Some(ejectable);
        self
    }

    pub fn disk_image(mut self) -> Self {
        self.disk_image = true;
        self
    }

    pub fn without_uuid(mut self) -> Self {
        self.uuid = None;
        self
    }

    pub fn without_flags(mut self) -> Self {
        self.internal = None;
        self.ejectable = None;
        self
    }
}

#[derive(Default)]
struct FakeHalState {
    /// All operations that were recorded
    operations: Vec<Operation>,
    disks: HashMap<DiskRef, FakeDisk>,
    /// Mount table in mount order: (location, disk). Locations without a
    /// disk model non-disk mounts such as `/` or `/proc`.
    mounts: Vec<(PathBuf, Option<DiskRef>)>,
    refuse_unmount: HashMap<DiskRef, Dissent>,
    refuse_mount: HashMap<DiskRef, Dissent>,
    enumeration_broken: bool,
    defer_mounts: bool,
    pending_mounts: Vec<(DiskRef, Completion)>,
}

impl std::fmt::Debug for FakeHalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeHalState")
            .field("operations", &self.operations)
            .field("mounts", &self.mounts)
            .field("pending_mounts", &self.pending_mounts.len())
            .finish_non_exhaustive()
    }
}

/// Fake disk arbitration backend that records operations.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a disk and mount it at its mount point.
    pub fn attach(&self, disk: FakeDisk) {
        let mut state = self.state.lock().unwrap();
        state
            .mounts
            .push((disk.mount_point.clone(), Some(disk.disk.clone())));
        state.disks.insert(disk.disk.clone(), disk);
    }

    /// Add a mount that is not backed by any described disk.
    pub fn add_plain_mount(&self, location: impl Into<PathBuf>) {
        self.state
            .lock()
            .unwrap()
            .mounts
            .push((location.into(), None));
    }

    /// Mount a disk behind the controller's back, as a user would.
    pub fn mount_externally(&self, disk: &str) {
        let disk = DiskRef::new(disk);
        let mut state = self.state.lock().unwrap();
        let _ = Self::apply_mount(&mut state, &disk);
    }

    /// Unmount a disk behind the controller's back, as a user would.
    pub fn unmount_externally(&self, disk: &str) {
        let disk = DiskRef::new(disk);
        self.state
            .lock()
            .unwrap()
            .mounts
            .retain(|(_, d)| d.as_ref() != Some(&disk));
    }

    /// Change where a disk lands on its next mount.
    pub fn set_mount_point(&self, disk: &str, mount_point: impl Into<PathBuf>) {
        if let Some(d) = self
            .state
            .lock()
            .unwrap()
            .disks
            .get_mut(&DiskRef::new(disk))
        {
            d.mount_point = mount_point.into();
        }
    }

    pub fn refuse_unmount(&self, disk: &str, dissent: Dissent) {
        self.state
            .lock()
            .unwrap()
            .refuse_unmount
            .insert(DiskRef::new(disk), dissent);
    }

    pub fn refuse_mount(&self, disk: &str, dissent: Dissent) {
        self.state
            .lock()
            .unwrap()
            .refuse_mount
            .insert(DiskRef::new(disk), dissent);
    }

    /// Make `mounted_locations` fail until cleared.
    pub fn break_enumeration(&self, broken: bool) {
        self.state.lock().unwrap().enumeration_broken = broken;
    }

    pub fn is_disk_mounted(&self, disk: &str) -> bool {
        let disk = DiskRef::new(disk);
        self.state
            .lock()
            .unwrap()
            .mounts
            .iter()
            .any(|(_, d)| d.as_ref() == Some(&disk))
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    pub fn unmount_count(&self, disk: &str) -> usize {
        self.count_ops(|op| matches!(op, Operation::Unmount { disk: d, .. } if d.as_str() == disk))
    }

    pub fn mount_count(&self, disk: &str) -> usize {
        self.count_ops(|op| matches!(op, Operation::Mount { disk: d } if d.as_str() == disk))
    }

    /// Hold mount completions back until [`Self::complete_pending_mounts`].
    pub fn defer_mounts(&self, defer: bool) {
        self.state.lock().unwrap().defer_mounts = defer;
    }

    pub fn pending_mount_count(&self) -> usize {
        self.state.lock().unwrap().pending_mounts.len()
    }

    /// Answer every held-back mount with `result`; `Ok` mounts the disk.
    /// Returns how many completions ran.
    pub fn complete_pending_mounts(&self, result: Result<(), Dissent>) -> usize {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending_mounts);
        let count = pending.len();
        for (disk, done) in pending {
            let outcome = match &result {
                Ok(()) => Self::apply_mount(&mut self.state.lock().unwrap(), &disk),
                Err(dissent) => Err(dissent.clone()),
            };
            done(outcome);
        }
        count
    }

    fn count_ops(&self, check: impl Fn(&Operation) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .operations
            .iter()
            .filter(|op| check(op))
            .count()
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }

    fn apply_mount(state: &mut FakeHalState, disk: &DiskRef) -> Result<(), Dissent> {
        if state.mounts.iter().any(|(_, d)| d.as_ref() == Some(disk)) {
            return Err(Dissent::AlreadyMounted);
        }
        let mount_point = state
            .disks
            .get(disk)
            .map(|d| d.mount_point.clone())
            .ok_or_else(|| Dissent::Other(format!("unknown disk {}", disk)))?;
        state.mounts.push((mount_point, Some(disk.clone())));
        Ok(())
    }
}

impl DiskOps for FakeHal {
    fn mounted_locations(&self) -> HalResult<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        if state.enumeration_broken {
            return Err(HalError::Unavailable("fake enumeration broken".to_string()));
        }
        Ok(state.mounts.iter().map(|(loc, _)| loc.clone()).collect())
    }

    fn describe(&self, location: &Path) -> HalResult<Option<DiskDescription>> {
        let state = self.state.lock().unwrap();
        let disk = state
            .mounts
            .iter()
            .rev()
            .find(|(loc, _)| loc == location)
            .and_then(|(_, d)| d.as_ref())
            .and_then(|d| state.disks.get(d));
        Ok(disk.map(|d| DiskDescription {
            disk: d.disk.clone(),
            volume_uuid: d.uuid.clone(),
            volume_name: d.name.clone(),
            device_internal: d.internal,
            media_ejectable: d.ejectable,
            volume_path: Some(location.to_path_buf()),
            disk_image: d.disk_image,
        }))
    }

    fn unmount_disk(&self, disk: &DiskRef, force: bool, done: Completion) {
        log::info!("FAKE HAL: unmount {} (force: {})", disk, force);
        self.record_operation(Operation::Unmount {
            disk: disk.clone(),
            force,
        });

        let result = {
            let mut state = self.state.lock().unwrap();
            if let Some(dissent) = state.refuse_unmount.get(disk).cloned() {
                Err(dissent)
            } else if !state.mounts.iter().any(|(_, d)| d.as_ref() == Some(disk)) {
                Err(Dissent::NotMounted)
            } else {
                state.mounts.retain(|(_, d)| d.as_ref() != Some(disk));
                Ok(())
            }
        };
        done(result);
    }

    fn mount_disk(&self, disk: &DiskRef, done: Completion) {
        log::info!("FAKE HAL: mount {}", disk);
        self.record_operation(Operation::Mount { disk: disk.clone() });

        let result = {
            let mut state = self.state.lock().unwrap();
            if state.defer_mounts {
                state.pending_mounts.push((disk.clone(), done));
                return;
            }
            match state.refuse_mount.get(disk).cloned() {
                Some(dissent) => Err(dissent),
                None => Self::apply_mount(&mut state, disk),
            }
        };
        done(result);
    }
}

/// Signal source driven by hand from tests.
#[derive(Clone, Default)]
pub struct FakeSignals {
    table: SubscriptionTable,
    handled: Arc<Mutex<Vec<SystemSignal>>>,
}

impl FakeSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `signal` to its subscribers; returns how many received it.
    pub fn emit(&self, signal: SystemSignal) -> usize {
        log::info!("FAKE SIGNALS: emit {}", signal);
        self.table.dispatch(signal)
    }

    pub fn subscription_count(&self, signal: SystemSignal) -> usize {
        self.table.count(signal)
    }

    pub fn total_subscriptions(&self) -> usize {
        self.table.len()
    }

    /// Signals the owner reported as acted on, in order.
    pub fn handled(&self) -> Vec<SystemSignal> {
        self.handled.lock().unwrap().clone()
    }
}

impl SignalOps for FakeSignals {
    fn subscribe(&self, signal: SystemSignal, sink: SignalSink) -> HalResult<SignalSubscription> {
        Ok(self.table.insert(signal, sink))
    }

    fn signal_handled(&self, signal: SystemSignal) {
        self.handled.lock().unwrap().push(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn usb() -> FakeDisk {
        FakeDisk::external("/dev/sdb1", "1111-AAAA", "USB", "/media/USB")
    }

    fn completion() -> (Completion, mpsc::Receiver<Result<(), Dissent>>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
            rx,
        )
    }

    #[test]
    fn fake_hal_records_unmount() {
        let hal = FakeHal::new();
        hal.attach(usb());

        let (done, rx) = completion();
        hal.unmount_disk(&DiskRef::new("/dev/sdb1"), true, done);

        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(
            hal.operations(),
            vec![Operation::Unmount {
                disk: DiskRef::new("/dev/sdb1"),
                force: true
            }]
        );
        assert!(!hal.is_disk_mounted("/dev/sdb1"));
    }

    #[test]
    fn fake_hal_mount_uses_current_mount_point() {
        let hal = FakeHal::new();
        hal.attach(usb());
        hal.unmount_externally("/dev/sdb1");
        hal.set_mount_point("/dev/sdb1", "/media/USB1");

        let (done, rx) = completion();
        hal.mount_disk(&DiskRef::new("/dev/sdb1"), done);

        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert_eq!(
            hal.mounted_locations().unwrap(),
            vec![PathBuf::from("/media/USB1")]
        );
    }

    #[test]
    fn fake_hal_reports_dissent() {
        let hal = FakeHal::new();
        hal.attach(usb());
        hal.refuse_unmount("/dev/sdb1", Dissent::Busy);

        let (done, rx) = completion();
        hal.unmount_disk(&DiskRef::new("/dev/sdb1"), false, done);

        assert_eq!(rx.recv().unwrap(), Err(Dissent::Busy));
        assert!(hal.is_disk_mounted("/dev/sdb1"));
        assert_eq!(hal.unmount_count("/dev/sdb1"), 1);
    }

    #[test]
    fn second_unmount_is_a_not_mounted_dissent() {
        let hal = FakeHal::new();
        hal.attach(usb());
        let disk = DiskRef::new("/dev/sdb1");

        let (done, _rx) = completion();
        hal.unmount_disk(&disk, false, done);
        let (done, rx) = completion();
        hal.unmount_disk(&disk, false, done);

        assert_eq!(rx.recv().unwrap(), Err(Dissent::NotMounted));
    }

    #[test]
    fn describe_ignores_plain_mounts() {
        let hal = FakeHal::new();
        hal.add_plain_mount("/");
        hal.attach(usb());

        assert!(hal.describe(Path::new("/")).unwrap().is_none());
        let desc = hal.describe(Path::new("/media/USB")).unwrap().unwrap();
        assert_eq!(desc.volume_uuid.as_deref(), Some("1111-AAAA"));
        assert_eq!(desc.volume_path, Some(PathBuf::from("/media/USB")));
    }

    #[test]
    fn deferred_mount_waits_for_completion() {
        let hal = FakeHal::new();
        hal.attach(usb());
        hal.unmount_externally("/dev/sdb1");
        hal.defer_mounts(true);

        let (done, rx) = completion();
        hal.mount_disk(&DiskRef::new("/dev/sdb1"), done);
        assert!(rx.try_recv().is_err());
        assert_eq!(hal.pending_mount_count(), 1);
        assert!(!hal.is_disk_mounted("/dev/sdb1"));

        assert_eq!(hal.complete_pending_mounts(Ok(())), 1);
        assert_eq!(rx.recv().unwrap(), Ok(()));
        assert!(hal.is_disk_mounted("/dev/sdb1"));
        assert_eq!(hal.complete_pending_mounts(Ok(())), 0);
    }

    #[test]
    fn broken_enumeration_errors() {
        let hal = FakeHal::new();
        hal.break_enumeration(true);
        assert!(hal.mounted_locations().is_err());
    }

    #[test]
    fn fake_signals_deliver_to_subscribers() {
        let signals = FakeSignals::new();
        let (tx, rx) = mpsc::channel();
        let sink: SignalSink = Arc::new(move |s| {
            let _ = tx.send(s);
        });
        let sub = signals.subscribe(SystemSignal::ScreenLocked, sink).unwrap();

        assert_eq!(signals.emit(SystemSignal::ScreenLocked), 1);
        assert_eq!(rx.recv().unwrap(), SystemSignal::ScreenLocked);

        drop(sub);
        assert_eq!(signals.emit(SystemSignal::ScreenLocked), 0);
    }
}
