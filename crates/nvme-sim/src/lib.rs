//! In-process NVMe controller used to exercise `nvme-host` without hardware.
//!
//! [`SimPlatform`] bundles a PCI function, flat DMA memory, a virtual clock
//! and a [`SimController`] that executes admin and NVM commands against
//! in-memory namespaces. Test hooks on the controller hold completions,
//! inject errors and raise asynchronous events.

mod clock;
mod config;
mod controller;
mod memory;
mod pci;
mod platform;

pub use clock::SimClock;
pub use config::{NamespaceSpec, SimConfig};
pub use controller::{
    LoggedCommand, SimCmb, SimController, AER_NOTICE_NS_ATTRIBUTE, AER_TYPE_NOTICE, CMB_ADDRESS,
    CMB_BAR,
};
pub use memory::{SegmentList, SimMemory, BUS_BASE, CPU_BASE};
pub use pci::{SimPciConfig, BAR0_ADDRESS};
pub use platform::SimPlatform;
