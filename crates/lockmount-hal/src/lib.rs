//! lockmount Host Abstraction Layer (HAL).
//!
//! Everything lockmount needs from the host goes through the traits in
//! [`hal`]: enumerating and describing mounted disks, asking the disk
//! arbitration service to mount/unmount them, and listening for the system
//! state transitions that drive the controller.

pub mod error;
pub mod hal;
pub mod procfs;

pub use error::{Dissent, HalError, HalResult};
pub use hal::*;
