//! Flat DMA memory with a first-fit allocator.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use nvme_host::{DmaMemory, DmaRegion, ScatterGather, Segment};

/// Bus address of the first byte of simulated memory.
pub const BUS_BASE: u64 = 0x4000_0000;
/// CPU address of the first byte of simulated memory.
pub const CPU_BASE: u64 = 0x7f00_0000_0000;

struct MemInner {
    bytes: Vec<u8>,
    /// Free ranges keyed by offset, values are lengths. Adjacent ranges are merged.
    free: BTreeMap<u64, u64>,
    live: usize,
    /// CPU ranges with no bus mapping.
    unmapped: Vec<Range<u64>>,
    fail_allocs: bool,
}

/// DMA-capable memory backed by one host buffer.
///
/// CPU addresses are [`CPU_BASE`] + offset and bus addresses are [`BUS_BASE`] +
/// offset, so a driver that forgets to translate hands the device an address
/// outside memory.
pub struct SimMemory {
    inner: Mutex<MemInner>,
}

impl SimMemory {
    pub fn new(size: usize) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, size as u64);
        Self {
            inner: Mutex::new(MemInner {
                bytes: vec![0u8; size],
                free,
                live: 0,
                unmapped: Vec::new(),
                fail_allocs: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn size(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.lock().live
    }

    /// Makes every following allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.lock().fail_allocs = fail;
    }

    /// Removes the bus mapping of the CPU range `[vaddr, vaddr + len)`.
    pub fn unmap(&self, vaddr: u64, len: u64) {
        self.lock().unmapped.push(vaddr..vaddr + len);
    }

    pub fn bus_to_cpu(bus: u64) -> u64 {
        bus - BUS_BASE + CPU_BASE
    }

    /// Whether `[bus, bus + len)` lies inside simulated memory.
    pub fn contains(&self, bus: u64, len: usize) -> bool {
        let size = self.lock().bytes.len() as u64;
        bus >= BUS_BASE && bus - BUS_BASE + len as u64 <= size
    }

    /// Reads through a CPU address.
    pub fn read_cpu(&self, vaddr: u64, buf: &mut [u8]) {
        self.read(vaddr - CPU_BASE + BUS_BASE, buf);
    }

    pub fn write_cpu(&self, vaddr: u64, data: &[u8]) {
        self.write(vaddr - CPU_BASE + BUS_BASE, data);
    }

    fn offset(&self, bus: u64, len: usize, bytes: &[u8]) -> Option<usize> {
        let off = bus.checked_sub(BUS_BASE)? as usize;
        (off + len <= bytes.len()).then_some(off)
    }
}

impl DmaMemory for SimMemory {
    fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion> {
        let mut inner = self.lock();
        if inner.fail_allocs {
            return None;
        }
        let len = len.max(1) as u64;
        let align = align.max(1) as u64;
        let (start, free_off, free_len) = inner.free.iter().find_map(|(&off, &flen)| {
            let start = off.div_ceil(align) * align;
            (start + len <= off + flen).then_some((start, off, flen))
        })?;

        inner.free.remove(&free_off);
        if start > free_off {
            inner.free.insert(free_off, start - free_off);
        }
        let end = start + len;
        if end < free_off + free_len {
            inner.free.insert(end, free_off + free_len - end);
        }
        inner.live += 1;
        Some(DmaRegion {
            vaddr: CPU_BASE + start,
            bus: BUS_BASE + start,
            len: len as usize,
        })
    }

    fn free(&self, region: DmaRegion) {
        let mut inner = self.lock();
        let mut off = region.bus - BUS_BASE;
        let mut len = region.len.max(1) as u64;
        if let Some((&prev, &plen)) = inner.free.range(..off).next_back() {
            if prev + plen == off {
                inner.free.remove(&prev);
                off = prev;
                len += plen;
            }
        }
        if let Some(&nlen) = inner.free.get(&(off + len)) {
            inner.free.remove(&(off + len));
            len += nlen;
        }
        inner.free.insert(off, len);
        inner.live = inner.live.saturating_sub(1);
    }

    fn translate(&self, vaddr: u64) -> Option<u64> {
        let inner = self.lock();
        if inner.unmapped.iter().any(|r| r.contains(&vaddr)) {
            return None;
        }
        let off = vaddr.checked_sub(CPU_BASE)?;
        (off < inner.bytes.len() as u64).then_some(BUS_BASE + off)
    }

    fn read(&self, bus: u64, buf: &mut [u8]) {
        let inner = self.lock();
        match self.offset(bus, buf.len(), &inner.bytes) {
            Some(off) => buf.copy_from_slice(&inner.bytes[off..off + buf.len()]),
            None => {
                tracing::warn!(bus, len = buf.len(), "read outside simulated memory");
                buf.fill(0);
            }
        }
    }

    fn write(&self, bus: u64, data: &[u8]) {
        let mut inner = self.lock();
        match self.offset(bus, data.len(), &inner.bytes) {
            Some(off) => inner.bytes[off..off + data.len()].copy_from_slice(data),
            None => tracing::warn!(bus, len = data.len(), "write outside simulated memory"),
        }
    }
}

/// Scatter list over fixed bus segments.
#[derive(Debug, Clone)]
pub struct SegmentList {
    segments: Vec<Segment>,
    index: usize,
    skip: usize,
}

impl SegmentList {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            index: 0,
            skip: 0,
        }
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len as usize).sum()
    }
}

impl ScatterGather for SegmentList {
    fn reset(&mut self, mut offset: usize) {
        self.index = 0;
        while let Some(seg) = self.segments.get(self.index) {
            if offset < seg.len as usize {
                break;
            }
            offset -= seg.len as usize;
            self.index += 1;
        }
        self.skip = offset;
    }

    fn next_segment(&mut self) -> Option<Segment> {
        let seg = self.segments.get(self.index)?;
        let out = Segment {
            bus: seg.bus + self.skip as u64,
            len: seg.len - self.skip as u32,
        };
        self.index += 1;
        self.skip = 0;
        Some(out)
    }
}
