//! Known deviations of specific controllers from standard NVMe behaviour.

use std::time::Duration;

use bitflags::bitflags;

use crate::platform::PciId;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Quirks: u32 {
        /// Intel vendor log page 0xC1 (read latency) is implemented.
        const INTEL_READ_LATENCY = 1 << 0;
        /// Intel vendor log page 0xC2 (write latency) is implemented.
        const INTEL_WRITE_LATENCY = 1 << 1;
        /// CSTS.RDY must not be sampled right after CC.EN is cleared.
        const DELAY_BEFORE_CHECK_READY = 1 << 2;
        /// I/O crossing a vendor-reported stripe boundary performs poorly.
        const INTEL_STRIPING = 1 << 3;
        /// The controller needs time after CSTS.RDY before accepting admin commands.
        const DELAY_AFTER_READY = 1 << 4;
        /// The controller advertises log pages it does not implement.
        const NO_LOG_PAGES = 1 << 5;
    }
}

pub const DELAY_BEFORE_CHECK_READY: Duration = Duration::from_millis(2000);
pub const DELAY_AFTER_READY: Duration = Duration::from_millis(100);

pub const PCI_ANY_ID: u16 = 0xffff;

pub const PCI_VENDOR_INTEL: u16 = 0x8086;
pub const PCI_VENDOR_MEMBLAZE: u16 = 0x1c5f;
pub const PCI_VENDOR_SAMSUNG: u16 = 0x144d;
pub const PCI_VENDOR_VIRTUALBOX: u16 = 0x80ee;

struct QuirkEntry {
    id: PciId,
    flags: Quirks,
}

const fn entry(vendor: u16, device: u16, flags: Quirks) -> QuirkEntry {
    QuirkEntry {
        id: PciId {
            vendor,
            device,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
        },
        flags,
    }
}

const INTEL_DC: Quirks = Quirks::INTEL_READ_LATENCY
    .union(Quirks::INTEL_WRITE_LATENCY)
    .union(Quirks::INTEL_STRIPING);

static QUIRK_TABLE: &[QuirkEntry] = &[
    entry(PCI_VENDOR_INTEL, 0x0953, INTEL_DC),
    entry(PCI_VENDOR_INTEL, 0x0a53, INTEL_DC),
    entry(PCI_VENDOR_INTEL, 0x0a54, INTEL_DC),
    entry(PCI_VENDOR_INTEL, 0x5845, Quirks::NO_LOG_PAGES),
    entry(PCI_VENDOR_MEMBLAZE, 0x0540, Quirks::DELAY_BEFORE_CHECK_READY),
    entry(PCI_VENDOR_SAMSUNG, 0xa821, Quirks::DELAY_BEFORE_CHECK_READY),
    entry(PCI_VENDOR_SAMSUNG, 0xa822, Quirks::DELAY_BEFORE_CHECK_READY),
    entry(PCI_VENDOR_VIRTUALBOX, 0x4e56, Quirks::DELAY_AFTER_READY),
];

fn field_matches(pattern: u16, value: u16) -> bool {
    pattern == PCI_ANY_ID || pattern == value
}

/// Returns the quirks of the first table entry matching `id`.
pub fn lookup(id: &PciId) -> Quirks {
    QUIRK_TABLE
        .iter()
        .find(|e| {
            field_matches(e.id.vendor, id.vendor)
                && field_matches(e.id.device, id.device)
                && field_matches(e.id.subvendor, id.subvendor)
                && field_matches(e.id.subdevice, id.subdevice)
        })
        .map(|e| e.flags)
        .unwrap_or(Quirks::empty())
}
