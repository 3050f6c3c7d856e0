//! Trigger kinds: which system transitions make lockmount unmount.

use clap::ValueEnum;
use lockmount_hal::SystemSignal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    /// Screensaver started / stopped
    Screensaver,
    /// Screen locked / unlocked
    ScreenLock,
    /// Displays went to sleep / woke up
    DisplaySleep,
    /// System is about to sleep / woke up
    SystemSleep,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 4] = [
        TriggerKind::Screensaver,
        TriggerKind::ScreenLock,
        TriggerKind::DisplaySleep,
        TriggerKind::SystemSleep,
    ];

    /// The (enter, exit) signal pair this trigger listens to.
    pub fn signals(self) -> (SystemSignal, SystemSignal) {
        match self {
            TriggerKind::Screensaver => (
                SystemSignal::ScreensaverStarted,
                SystemSignal::ScreensaverStopped,
            ),
            TriggerKind::ScreenLock => (SystemSignal::ScreenLocked, SystemSignal::ScreenUnlocked),
            TriggerKind::DisplaySleep => (SystemSignal::DisplaysSlept, SystemSignal::DisplaysWoke),
            TriggerKind::SystemSleep => {
                (SystemSignal::SystemWillSleep, SystemSignal::SystemDidWake)
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TriggerKind::Screensaver => "screensaver",
            TriggerKind::ScreenLock => "screen-lock",
            TriggerKind::DisplaySleep => "display-sleep",
            TriggerKind::SystemSleep => "system-sleep",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TriggerKind::Screensaver => "Screensaver started",
            TriggerKind::ScreenLock => "Screen is locked",
            TriggerKind::DisplaySleep => "Display turned off",
            TriggerKind::SystemSleep => "System starts sleeping",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
