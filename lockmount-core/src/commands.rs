//! One-shot actions behind the CLI subcommands.

use crate::errors::LockmountError;
use crate::preferences::PreferenceStore;
use crate::volume::{list_mounted_external_volumes, Volume};
use anyhow::Result;
use lockmount_hal::{DiskOps, Dissent};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct VolumeStatus {
    pub volume: Volume,
    pub enabled: bool,
}

pub fn list_volumes(
    disks: &dyn DiskOps,
    roots: &[PathBuf],
    prefs: &PreferenceStore,
) -> Vec<VolumeStatus> {
    list_mounted_external_volumes(disks, roots)
        .into_iter()
        .map(|volume| VolumeStatus {
            enabled: volume.enabled(prefs),
            volume,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted,
    Refused(Dissent),
    /// No answer before the wait ran out.
    Pending,
}

#[derive(Debug, Default)]
pub struct UnmountReport {
    pub results: Vec<(Volume, UnmountOutcome)>,
}

impl UnmountReport {
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, outcome)| *outcome != UnmountOutcome::Unmounted)
            .count()
    }
}

/// Unmount every enabled external volume right away.
///
/// Each request is independent: a refusal is reported for that volume and
/// the rest of the batch carries on. Nothing is tracked for remount.
pub fn unmount_all_now(
    disks: &dyn DiskOps,
    roots: &[PathBuf],
    prefs: &PreferenceStore,
    wait: Duration,
) -> UnmountReport {
    let volumes: Vec<Volume> = list_mounted_external_volumes(disks, roots)
        .into_iter()
        .filter(|volume| volume.enabled(prefs))
        .collect();

    let (tx, rx) = mpsc::channel();
    for (index, volume) in volumes.iter().enumerate() {
        let tx = tx.clone();
        volume.unmount_then(
            disks,
            prefs.force_unmount(),
            Box::new(move |result| {
                let _ = tx.send((index, result));
            }),
        );
    }
    drop(tx);

    let mut outcomes = vec![UnmountOutcome::Pending; volumes.len()];
    let deadline = Instant::now() + wait;
    let mut remaining = volumes.len();
    while remaining > 0 {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let Ok((index, result)) = rx.recv_timeout(timeout) else {
            break;
        };
        outcomes[index] = match result {
            Ok(()) => UnmountOutcome::Unmounted,
            Err(dissent) => UnmountOutcome::Refused(dissent),
        };
        remaining -= 1;
    }

    UnmountReport {
        results: volumes.into_iter().zip(outcomes).collect(),
    }
}

/// Find a mounted volume by id, falling back to an unambiguous name.
pub fn resolve_volume(volumes: &[Volume], query: &str) -> Result<Volume, LockmountError> {
    if let Some(volume) = volumes.iter().find(|v| v.id == query) {
        return Ok(volume.clone());
    }
    let mut by_name = volumes.iter().filter(|v| v.name == query);
    match (by_name.next(), by_name.next()) {
        (Some(volume), None) => Ok(volume.clone()),
        (Some(_), Some(_)) => Err(LockmountError::AmbiguousVolume(query.to_string())),
        (None, _) => Err(LockmountError::UnknownVolume(query.to_string())),
    }
}

/// Enable or disable a volume. Returns the id that was written.
///
/// Volumes that are not mounted can still be toggled by id if the
/// preferences already know them.
pub fn set_volume_enabled(
    disks: &dyn DiskOps,
    roots: &[PathBuf],
    prefs: &mut PreferenceStore,
    query: &str,
    enabled: bool,
) -> Result<String> {
    let volumes = list_mounted_external_volumes(disks, roots);
    let id = match resolve_volume(&volumes, query) {
        Ok(volume) => {
            volume.set_enabled(prefs, enabled)?;
            volume.id
        }
        Err(LockmountError::UnknownVolume(_)) if prefs.snapshot().volumes.contains_key(query) => {
            prefs.set_volume_enabled(query, enabled)?;
            query.to_string()
        }
        Err(err) => return Err(err.into()),
    };
    log::info!(
        "Volume {} {}",
        id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(id)
}
