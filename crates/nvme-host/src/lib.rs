//! Polled NVMe (NVM Express) host driver core.
//!
//! The crate drives a PCIe NVMe controller through a handful of platform
//! traits ([`Platform`], [`Mmio`], [`DmaMemory`], [`Clock`]) and never spawns
//! threads: completions are only processed when the caller polls a
//! [`QueuePair`].
//!
//! Covered:
//! - Controller bring-up and reset state machine, including quirk delays
//! - Admin and I/O queue pairs with tracker recycling, retry and fail
//! - PRP lists and native SGL descriptors for contiguous and scattered payloads
//! - Request splitting at stripe and transfer-size boundaries
//! - Namespaces, asynchronous events, log page and feature capability tables
//! - Controller memory buffer submission queues
//!
//! Interrupts are not modelled; I/O queues are created with interrupts
//! disabled.

mod admin;
mod command;
mod controller;
mod error;
mod identify;
mod log_page;
mod namespace;
mod options;
mod platform;
mod prp;
mod qpair;
mod quirks;
mod regs;
mod registry;
mod request;

#[cfg(test)]
mod testing;

pub use admin::{AdminData, CommitAction, FormatParams, SecureErase, ALL_NAMESPACES};
pub use command::{
    admin_opcode, command_specific_status, generic_status, nvm_opcode, status_type, Command,
    Completion, Psdt, SglDescriptor, SglType, Status, COMMAND_SIZE, COMPLETION_SIZE,
    SGL_DESCRIPTOR_SIZE,
};
pub use controller::{Controller, ControllerStat, ControllerState, InitStatus};
pub use error::{Error, Result};
pub use identify::{
    parse_namespace_list, IdentifyController, IdentifyNamespace, LbaFormat,
    CNS_ACTIVE_NAMESPACE_LIST, CNS_CONTROLLER, CNS_NAMESPACE, IDENTIFY_DATA_SIZE,
    LPA_COMMAND_EFFECTS, OACS_FIRMWARE, OACS_FORMAT_NVM, OACS_NS_MANAGEMENT, OAES_NS_ATTRIBUTE,
    ONCS_COMPARE, ONCS_DSM, ONCS_RESERVATIONS, ONCS_WRITE_UNCORRECTABLE, ONCS_WRITE_ZEROES,
};
pub use log_page::{feature_id, log_id, IdSet, IntelLogDirectory};
pub use namespace::{
    AcquireAction, DsmRange, IoFlags, Namespace, NamespaceFlags, NamespaceHandle, NamespaceStat,
    PersistAction, PiType, RegisterAction, ReleaseAction, ReservationType, DSM_MAX_RANGES,
};
pub use options::{AerHandler, Arbitration, ControllerOptions, QpairOptions, QueuePriority};
pub use platform::{
    Clock, DmaMemory, DmaRegion, Mmio, PciConfig, PciId, Platform, SystemClock, PCI_COMMAND,
    PCI_COMMAND_BUS_MASTER, PCI_COMMAND_INTX_DISABLE, PCI_COMMAND_MEMORY,
    PCI_SUBSYSTEM_VENDOR_ID, PCI_VENDOR_ID,
};
pub use qpair::QueuePair;
pub use quirks::{
    lookup as lookup_quirks, Quirks, PCI_ANY_ID, PCI_VENDOR_INTEL, PCI_VENDOR_MEMBLAZE,
    PCI_VENDOR_SAMSUNG, PCI_VENDOR_VIRTUALBOX,
};
pub use regs::{
    Capabilities, CmbLocation, CmbSize, ControllerConfig, ControllerStatus, Version,
    CC_SHN_ABRUPT, CC_SHN_NONE, CC_SHN_NORMAL, DOORBELL_BASE, REG_ACQ, REG_AQA, REG_ASQ,
    REG_CAP, REG_CC, REG_CMBLOC, REG_CMBSZ, REG_CSTS, REG_INTMC, REG_INTMS, REG_NSSR, REG_VS,
    SHST_COMPLETE, SHST_NORMAL, SHST_OCCURRING,
};
pub use registry::{ControllerHandle, Registry};
pub use request::{CompletionFn, Payload, Request, ScatterGather, Segment, SharedSgl};
