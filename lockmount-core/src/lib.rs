//! lockmount core library.
//!
//! `lockmount-core` holds the volume model, the persisted preferences, the
//! activity controller that unmounts and re-mounts removable media around
//! lock/sleep transitions, and the daemon loop and CLI that drive it.

pub mod cli;
pub mod commands;
pub mod controller;
pub mod daemon;
pub mod errors;
pub mod logging;
pub mod preferences;
pub mod trigger;
pub mod volume;

pub use controller::{ActivityController, SETTLE_DELAY};
pub use preferences::{PreferenceStore, Preferences};
pub use trigger::TriggerKind;
pub use volume::{list_mounted_external_volumes, Volume};
