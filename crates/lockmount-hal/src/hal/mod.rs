//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for host operations and provides
//! both real (LinuxHal, DbusSignals) and fake (FakeHal, FakeSignals)
//! implementations.

pub mod dbus_signals;
pub mod disk_ops;
pub mod fake_hal;
pub mod linux_hal;
pub mod signal_ops;

pub use dbus_signals::DbusSignals;
pub use disk_ops::{Completion, DiskDescription, DiskOps, DiskRef};
pub use fake_hal::{FakeDisk, FakeHal, FakeSignals, Operation};
pub use linux_hal::LinuxHal;
pub use signal_ops::{SignalOps, SignalSink, SignalSubscription, SubscriptionTable, SystemSignal};
