//! Fakes shared by unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::platform::{DmaMemory, DmaRegion};
use crate::request::{ScatterGather, Segment};

/// Bus addresses sit this far above the CPU addresses that map to them.
pub const BUS_OFFSET: u64 = 0x1_0000_0000;

/// Byte-granular sparse memory with an offset translation.
pub struct SparseMemory {
    bytes: Mutex<BTreeMap<u64, u8>>,
    next: Mutex<u64>,
    poisoned: Mutex<HashSet<u64>>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(BTreeMap::new()),
            next: Mutex::new(0x8000_0000),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    /// Makes the page containing `vaddr` untranslatable.
    pub fn poison(&self, vaddr: u64) {
        self.poisoned.lock().unwrap().insert(vaddr & !0xfff);
    }
}

impl DmaMemory for SparseMemory {
    fn alloc(&self, len: usize, align: usize) -> Option<DmaRegion> {
        let mut next = self.next.lock().unwrap();
        let align = align.max(1) as u64;
        let vaddr = next.div_ceil(align) * align;
        *next = vaddr + len as u64;
        Some(DmaRegion {
            vaddr,
            bus: vaddr + BUS_OFFSET,
            len,
        })
    }

    fn free(&self, _region: DmaRegion) {}

    fn translate(&self, vaddr: u64) -> Option<u64> {
        if self.poisoned.lock().unwrap().contains(&(vaddr & !0xfff)) {
            return None;
        }
        Some(vaddr + BUS_OFFSET)
    }

    fn read(&self, bus: u64, buf: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = bytes.get(&(bus + i as u64)).copied().unwrap_or(0);
        }
    }

    fn write(&self, bus: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(bus + i as u64, *b);
        }
    }
}

/// Scatter list over a fixed vector of segments.
pub struct VecSgl {
    segments: Vec<Segment>,
    index: usize,
    skip: usize,
}

impl VecSgl {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            index: 0,
            skip: 0,
        }
    }
}

impl ScatterGather for VecSgl {
    fn reset(&mut self, mut offset: usize) {
        self.index = 0;
        while self.index < self.segments.len() && offset >= self.segments[self.index].len as usize
        {
            offset -= self.segments[self.index].len as usize;
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
