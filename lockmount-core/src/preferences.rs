//! Persisted preferences: trigger set, global flags and per-volume overrides.
//!
//! The store is an owned object. Whoever needs preferences gets a reference
//! to it; the controller hears about trigger changes through the hook
//! registered with [`PreferenceStore::on_triggers_changed`].

use crate::errors::LockmountError;
use crate::trigger::TriggerKind;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const PREFERENCES_VERSION: u32 = 1;
pub const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    pub version: u32,
    pub unmount_when: BTreeSet<TriggerKind>,
    pub force_unmount: bool,
    pub remount_after_delay: bool,
    /// Volume id → enabled. Absent ids are enabled.
    pub volumes: BTreeMap<String, bool>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            version: PREFERENCES_VERSION,
            unmount_when: BTreeSet::new(),
            force_unmount: false,
            remount_after_delay: false,
            volumes: BTreeMap::new(),
        }
    }
}

pub type TriggerHook = Box<dyn FnMut(&BTreeSet<TriggerKind>) + Send>;

pub struct PreferenceStore {
    path: Option<PathBuf>,
    prefs: Preferences,
    loaded_mtime: Option<SystemTime>,
    hooks: Vec<TriggerHook>,
}

impl fmt::Debug for PreferenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceStore")
            .field("path", &self.path)
            .field("prefs", &self.prefs)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl PreferenceStore {
    /// Open the store backed by `path`. A missing file means defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let prefs = load_preferences(&path)?.unwrap_or_default();
        Ok(Self {
            loaded_mtime: modified(&path),
            path: Some(path),
            prefs,
            hooks: Vec::new(),
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            prefs: Preferences::default(),
            loaded_mtime: None,
            hooks: Vec::new(),
        }
    }

    /// `<config dir>/lockmount/preferences.json` for the current user.
    pub fn default_path() -> Result<PathBuf> {
        let dirs =
            ProjectDirs::from("org", "lockmount", "lockmount").ok_or(LockmountError::NoConfigDir)?;
        Ok(dirs.config_dir().join(PREFERENCES_FILE))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> &Preferences {
        &self.prefs
    }

    pub fn unmount_when(&self) -> &BTreeSet<TriggerKind> {
        &self.prefs.unmount_when
    }

    /// Replace the trigger set, persist it, then notify the change hooks.
    pub fn set_unmount_when(&mut self, triggers: BTreeSet<TriggerKind>) -> Result<()> {
        self.update(|prefs| prefs.unmount_when = triggers)?;
        self.fire_trigger_hooks();
        Ok(())
    }

    pub fn force_unmount(&self) -> bool {
        self.prefs.force_unmount
    }

    pub fn set_force_unmount(&mut self, force: bool) -> Result<()> {
        self.update(|prefs| prefs.force_unmount = force)
    }

    pub fn remount_after_delay(&self) -> bool {
        self.prefs.remount_after_delay
    }

    pub fn set_remount_after_delay(&mut self, delay: bool) -> Result<()> {
        self.update(|prefs| prefs.remount_after_delay = delay)
    }

    /// Volumes are managed unless explicitly disabled.
    pub fn volume_enabled(&self, id: &str) -> bool {
        self.prefs.volumes.get(id).copied().unwrap_or(true)
    }

    pub fn set_volume_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        self.update(|prefs| {
            prefs.volumes.insert(id.to_string(), enabled);
        })
    }

    pub fn on_triggers_changed(&mut self, hook: TriggerHook) {
        self.hooks.push(hook);
    }

    /// Re-read the backing file if another process rewrote it.
    ///
    /// Returns whether anything was reloaded. Trigger hooks fire only when
    /// the trigger set actually changed.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        let mtime = modified(&path);
        if mtime == self.loaded_mtime {
            return Ok(false);
        }

        let prefs = load_preferences(&path)?.unwrap_or_default();
        self.loaded_mtime = mtime;
        let triggers_changed = prefs.unmount_when != self.prefs.unmount_when;
        self.prefs = prefs;
        log::info!("Reloaded preferences from {}", path.display());

        if triggers_changed {
            self.fire_trigger_hooks();
        }
        Ok(true)
    }

    fn fire_trigger_hooks(&mut self) {
        let triggers = self.prefs.unmount_when.clone();
        for hook in &mut self.hooks {
            hook(&triggers);
        }
    }

    /// Apply `change` to a copy and persist it. The in-memory preferences
    /// only move once the write has succeeded.
    fn update(&mut self, change: impl FnOnce(&mut Preferences)) -> Result<()> {
        let mut next = self.prefs.clone();
        change(&mut next);
        if let Some(path) = &self.path {
            save_preferences_atomic(path, &next)?;
            self.loaded_mtime = modified(path);
        }
        self.prefs = next;
        Ok(())
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

pub fn load_preferences(path: &Path) -> Result<Option<Preferences>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read preferences file: {}", path.display()))?;
    let prefs: Preferences =
        serde_json::from_str(&content).context("Failed to parse preferences file")?;
    if prefs.version > PREFERENCES_VERSION {
        return Err(LockmountError::UnsupportedPreferencesVersion {
            found: prefs.version,
            supported: PREFERENCES_VERSION,
        }
        .into());
    }
    Ok(Some(prefs))
}

pub fn save_preferences_atomic(path: &Path, prefs: &Preferences) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create preferences directory: {}", parent.display())
        })?;
    }

    let tmp_path = temp_path(path);
    let payload = serde_json::to_string_pretty(prefs).context("Failed to serialize preferences")?;

    let mut file = File::create(&tmp_path).with_context(|| {
        format!(
            "Failed to create temp preferences file: {}",
            tmp_path.display()
        )
    })?;
    file.write_all(payload.as_bytes())
        .context("Failed to write preferences")?;
    file.sync_all().context("Failed to flush preferences")?;

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to atomically replace preferences file: {}",
            path.display()
        )
    })?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all().ok();
        }
    }

    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(PREFERENCES_FILE);
    path.with_file_name(format!("{}.tmp", file_name))
}
