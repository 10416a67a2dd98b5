//! Type 0 configuration space of the simulated function.

use std::sync::Mutex;

use nvme_host::{PciConfig, PciId, PCI_COMMAND, PCI_COMMAND_BUS_MASTER, PCI_COMMAND_MEMORY};

/// Bus address BAR0 (64-bit) is programmed with.
pub const BAR0_ADDRESS: u64 = 0xfebf_0000;

pub struct SimPciConfig {
    space: Mutex<[u8; 256]>,
}

impl SimPciConfig {
    /// `cmb` is the BAR number and bus address of the controller memory buffer.
    pub fn new(id: PciId, cmb: Option<(u8, u32)>) -> Self {
        let mut space = [0u8; 256];
        space[0x00..0x02].copy_from_slice(&id.vendor.to_le_bytes());
        space[0x02..0x04].copy_from_slice(&id.device.to_le_bytes());

        // Class code: mass storage, non-volatile memory, NVMe.
        space[0x09] = 0x02;
        space[0x0a] = 0x08;
        space[0x0b] = 0x01;

        // BAR0/1: 64-bit non-prefetchable memory.
        space[0x10..0x14].copy_from_slice(&(BAR0_ADDRESS as u32 | 0x4).to_le_bytes());
        space[0x14..0x18].copy_from_slice(&((BAR0_ADDRESS >> 32) as u32).to_le_bytes());
        if let Some((bar, addr)) = cmb {
            let off = 0x10 + 4 * bar as usize;
            space[off..off + 4].copy_from_slice(&(addr & !0xf).to_le_bytes());
        }

        space[0x2c..0x2e].copy_from_slice(&id.subvendor.to_le_bytes());
        space[0x2e..0x30].copy_from_slice(&id.subdevice.to_le_bytes());
        Self {
            space: Mutex::new(space),
        }
    }

    pub fn command(&self) -> u16 {
        self.read32(PCI_COMMAND) as u16
    }

    pub fn memory_enabled(&self) -> bool {
        self.command() as u32 & PCI_COMMAND_MEMORY != 0
    }

    pub fn bus_master(&self) -> bool {
        self.command() as u32 & PCI_COMMAND_BUS_MASTER != 0
    }
}

impl PciConfig for SimPciConfig {
    fn read32(&self, offset: u16) -> u32 {
        let off = offset as usize & !3;
        if off + 4 > 256 {
            return 0xffff_ffff;
        }
        let space = self.space.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        u32::from_le_bytes(space[off..off + 4].try_into().unwrap())
    }

    /// Only the command register is writable; status bits are read-only.
    fn write32(&self, offset: u16, value: u32) {
        if offset != PCI_COMMAND {
            return;
        }
        let mut space = self.space.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        space[0x04..0x06].copy_from_slice(&(value as u16).to_le_bytes());
    }
}
