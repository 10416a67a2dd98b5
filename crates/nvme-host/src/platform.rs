//! Services the driver core consumes from its host environment.
//!
//! The core never allocates DMA memory, maps BARs or reads the time on its
//! own; everything goes through these traits so that the same code runs in a
//! kernel, a user-space I/O framework or against `nvme-sim`.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A region of physically contiguous, DMA-capable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// CPU-visible address.
    pub vaddr: u64,
    /// Address the device uses to reach the same memory.
    pub bus: u64,
    pub len: usize,
}

/// DMA-capable memory: allocation, translation and CPU access.
pub trait DmaMemory: Send + Sync {
    /// Allocates `len` physically contiguous bytes aligned to `align`.
    fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion>;
    fn free(&self, region: DmaRegion);

    /// Translates a CPU address to a bus address. `None` when the address is not
    /// backed by DMA-capable memory.
    fn translate(&self, vaddr: u64) -> Option<u64>;

    /// Reads through the CPU mapping of the bus address `bus`.
    fn read(&self, bus: u64, buf: &mut [u8]);
    fn write(&self, bus: u64, data: &[u8]);

    fn read_u64(&self, bus: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read(bus, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&self, bus: u64, val: u64) {
        self.write(bus, &val.to_le_bytes())
    }

    fn zero(&self, region: &DmaRegion) {
        let zeros = vec![0u8; region.len];
        self.write(region.bus, &zeros);
    }
}

/// A mapped register window (a PCI BAR).
///
/// Implementations must perform each access as a single, uncached device
/// access in program order.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);

    fn read64(&self, offset: u64) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        hi << 32 | lo
    }

    fn write64(&self, offset: u64, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    /// Copies a block into the window, used for rings living in device memory.
    fn write_bytes(&self, offset: u64, data: &[u8]) {
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write32(offset + (i * 4) as u64, u32::from_le_bytes(word));
        }
    }
}

/// 32-bit PCI configuration space access.
pub trait PciConfig: Send + Sync {
    fn read32(&self, offset: u16) -> u32;
    fn write32(&self, offset: u16, value: u32);
}

/// Monotonic time and blocking sleeps.
pub trait Clock: Send + Sync {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Everything needed to drive one PCI function.
pub trait Platform: Send + Sync {
    fn pci(&self) -> Arc<dyn PciConfig>;
    fn map_bar(&self, bar: u8, write_combine: bool) -> Option<Arc<dyn Mmio>>;
    fn unmap_bar(&self, bar: u8);
    fn memory(&self) -> Arc<dyn DmaMemory>;
    fn clock(&self) -> Arc<dyn Clock>;
}

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x2c;

pub const PCI_COMMAND_MEMORY: u32 = 1 << 1;
pub const PCI_COMMAND_BUS_MASTER: u32 = 1 << 2;
pub const PCI_COMMAND_INTX_DISABLE: u32 = 1 << 10;

/// PCI identity used for quirk matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
    pub subvendor: u16,
    pub subdevice: u16,
}

impl PciId {
    pub fn read(cfg: &dyn PciConfig) -> PciId {
        let id = cfg.read32(PCI_VENDOR_ID);
        let sub = cfg.read32(PCI_SUBSYSTEM_VENDOR_ID);
        PciId {
            vendor: id as u16,
            device: (id >> 16) as u16,
            subvendor: sub as u16,
            subdevice: (sub >> 16) as u16,
        }
    }
}

/// Wall-clock [`Clock`] backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Owned DMA allocation, freed on drop.
pub(crate) struct DmaBuffer {
    mem: Arc<dyn DmaMemory>,
    region: DmaRegion,
}

impl DmaBuffer {
    pub(crate) fn alloc(mem: &Arc<dyn DmaMemory>, len: usize, align: usize) -> crate::Result<Self> {
        let region = mem
            .alloc(len, align)
            .ok_or(crate::Error::DmaAlloc { len })?;
        mem.zero(&region);
        Ok(Self {
            mem: Arc::clone(mem),
            region,
        })
    }

    pub(crate) fn region(&self) -> DmaRegion {
        self.region
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) {
        self.mem.write(self.region.bus + offset as u64, data);
    }

    pub(crate) fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.region.len];
        self.mem.read(self.region.bus, &mut out);
        out
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.mem.free(self.region);
    }
}
