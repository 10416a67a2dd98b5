//! Data pointer construction: PRP entries/lists and native SGL descriptors.
//!
//! Secondary entries are written into the tracker's pointer-list page, which
//! is exactly one page long, so a list never crosses a page boundary and never
//! chains.

use crate::command::{Command, Psdt, SglDescriptor, SGL_DESCRIPTOR_SIZE};
use crate::platform::{DmaMemory, DmaRegion};
use crate::request::ScatterGather;

/// Why a data pointer could not be built. All of these complete the command
/// with INVALID_FIELD without reaching the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildError {
    /// A payload address has no bus mapping.
    Translation(u64),
    /// More secondary entries than fit in one list page.
    ListOverflow,
    /// An interior scatter segment is not page aligned at the required end.
    Misaligned(u64),
    /// The scatter iterator ended before the payload length was covered.
    ShortPayload,
}

fn write_list(mem: &dyn DmaMemory, list: &DmaRegion, entries: &[u64]) {
    let mut bytes = Vec::with_capacity(entries.len() * 8);
    for entry in entries {
        bytes.extend_from_slice(&entry.to_le_bytes());
    }
    mem.write(list.bus, &bytes);
}

/// Fills PRP1/PRP2 for a virtually contiguous buffer. Returns the number of
/// secondary entries, i.e. pages after the first.
pub(crate) fn build_contiguous_prp(
    cmd: &mut Command,
    mem: &dyn DmaMemory,
    vaddr: u64,
    len: usize,
    page_size: u64,
    list: &DmaRegion,
) -> Result<usize, BuildError> {
    let mask = page_size - 1;
    let bus = mem.translate(vaddr).ok_or(BuildError::Translation(vaddr))?;
    cmd.psdt = Psdt::Prp;
    cmd.prp1 = bus;
    cmd.prp2 = 0;

    let unaligned = bus & mask;
    let pages = (len as u64 + unaligned).div_ceil(page_size).max(1);
    let entries = (pages - 1) as usize;
    if entries == 0 {
        return Ok(0);
    }

    let first_boundary = vaddr + (page_size - unaligned);
    let translate_page = |i: usize| {
        let page_vaddr = first_boundary + i as u64 * page_size;
        mem.translate(page_vaddr)
            .ok_or(BuildError::Translation(page_vaddr))
    };

    if entries == 1 {
        cmd.prp2 = translate_page(0)?;
        return Ok(1);
    }

    if entries > list.len / 8 {
        return Err(BuildError::ListOverflow);
    }
    let prps = (0..entries)
        .map(translate_page)
        .collect::<Result<Vec<u64>, BuildError>>()?;
    write_list(mem, list, &prps);
    cmd.prp2 = list.bus;
    Ok(entries)
}

/// Builds PRPs from a scattered payload. Every segment except the first must
/// start on a page boundary and every segment except the last must end on one.
pub(crate) fn build_scattered_prp(
    cmd: &mut Command,
    mem: &dyn DmaMemory,
    sgl: &mut dyn ScatterGather,
    offset: usize,
    len: usize,
    page_size: u64,
    list: &DmaRegion,
) -> Result<usize, BuildError> {
    let mask = page_size - 1;
    cmd.psdt = Psdt::Prp;
    cmd.prp1 = 0;
    cmd.prp2 = 0;

    sgl.reset(offset);
    let mut remaining = len;
    let mut first = true;
    let mut entries: Vec<u64> = Vec::new();
    while remaining > 0 {
        let seg = sgl.next_segment().ok_or(BuildError::ShortPayload)?;
        if seg.len == 0 {
            return Err(BuildError::ShortPayload);
        }
        let seg_len = (seg.len as usize).min(remaining);
        if !first && seg.bus & mask != 0 {
            return Err(BuildError::Misaligned(seg.bus));
        }
        remaining -= seg_len;
        let end = seg.bus + seg_len as u64;
        if remaining > 0 && end & mask != 0 {
            return Err(BuildError::Misaligned(end));
        }

        let mut addr = seg.bus;
        while addr < end {
            if first {
                cmd.prp1 = addr;
                first = false;
            } else {
                entries.push(addr);
            }
            addr = (addr & !mask) + page_size;
        }
    }

    match entries.len() {
        0 => {}
        1 => cmd.prp2 = entries[0],
        n if n > list.len / 8 => return Err(BuildError::ListOverflow),
        _ => {
            write_list(mem, list, &entries);
            cmd.prp2 = list.bus;
        }
    }
    Ok(entries.len())
}

/// Builds native SGL descriptors: one data block per segment, placed inline
/// when there is a single segment and in a last-segment list otherwise.
pub(crate) fn build_sgl(
    cmd: &mut Command,
    mem: &dyn DmaMemory,
    sgl: &mut dyn ScatterGather,
    offset: usize,
    len: usize,
    list: &DmaRegion,
) -> Result<usize, BuildError> {
    let max = list.len / SGL_DESCRIPTOR_SIZE;
    sgl.reset(offset);
    let mut remaining = len;
    let mut descs: Vec<SglDescriptor> = Vec::new();
    while remaining > 0 {
        let seg = sgl.next_segment().ok_or(BuildError::ShortPayload)?;
        if seg.len == 0 {
            return Err(BuildError::ShortPayload);
        }
        if descs.len() == max {
            return Err(BuildError::ListOverflow);
        }
        let seg_len = (seg.len as usize).min(remaining);
        descs.push(SglDescriptor::data_block(seg.bus, seg_len as u32));
        remaining -= seg_len;
    }

    match descs.as_slice() {
        [] => cmd.psdt = Psdt::Prp,
        [only] => cmd.set_sgl1(*only),
        _ => {
            let mut bytes = Vec::with_capacity(descs.len() * SGL_DESCRIPTOR_SIZE);
            for desc in &descs {
                bytes.extend_from_slice(&desc.to_bytes());
            }
            mem.write(list.bus, &bytes);
            cmd.set_sgl1(SglDescriptor::last_segment(list.bus, bytes.len() as u32));
        }
    }
    Ok(descs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SglType;
    use crate::request::Segment;
    use crate::testing::{SparseMemory, VecSgl, BUS_OFFSET};
    use proptest::prelude::*;

    const PAGE: u64 = 4096;

    fn list(mem: &SparseMemory) -> DmaRegion {
        mem.alloc(PAGE as usize, PAGE as usize).unwrap()
    }

    #[test]
    fn single_page_uses_prp1_only() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut cmd = Command::default();
        let n = build_contiguous_prp(&mut cmd, &mem, 0x10_0100, 512, PAGE, &list).unwrap();
        assert_eq!(n, 0);
        assert_eq!(cmd.prp1, 0x10_0100 + BUS_OFFSET);
        assert_eq!(cmd.prp2, 0);
    }

    #[test]
    fn two_pages_put_second_page_in_prp2() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut cmd = Command::default();
        let n = build_contiguous_prp(&mut cmd, &mem, 0x10_0800, 4096, PAGE, &list).unwrap();
        assert_eq!(n, 1);
        assert_eq!(cmd.prp2, 0x10_1000 + BUS_OFFSET);
    }

    #[test]
    fn three_pages_use_the_list() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut cmd = Command::default();
        let n = build_contiguous_prp(&mut cmd, &mem, 0x10_0000, 3 * 4096, PAGE, &list).unwrap();
        assert_eq!(n, 2);
        assert_eq!(cmd.prp2, list.bus);
        assert_eq!(mem.read_u64(list.bus), 0x10_1000 + BUS_OFFSET);
        assert_eq!(mem.read_u64(list.bus + 8), 0x10_2000 + BUS_OFFSET);
    }

    #[test]
    fn untranslatable_page_fails() {
        let mem = SparseMemory::new();
        mem.poison(0x10_2000);
        let list = list(&mem);
        let mut cmd = Command::default();
        assert_eq!(
            build_contiguous_prp(&mut cmd, &mem, 0x10_0000, 3 * 4096, PAGE, &list),
            Err(BuildError::Translation(0x10_2000))
        );
    }

    #[test]
    fn oversized_transfer_overflows_list() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut cmd = Command::default();
        assert_eq!(
            build_contiguous_prp(&mut cmd, &mem, 0x10_0000, 514 * 4096, PAGE, &list),
            Err(BuildError::ListOverflow)
        );
    }

    #[test]
    fn scattered_prp_walks_segment_pages() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut sgl = VecSgl::new(vec![
            Segment {
                bus: 0x20_0800,
                len: 0x800,
            },
            Segment {
                bus: 0x40_0000,
                len: 0x2000,
            },
            Segment {
                bus: 0x60_0000,
                len: 0x200,
            },
        ]);
        let mut cmd = Command::default();
        let n =
            build_scattered_prp(&mut cmd, &mem, &mut sgl, 0, 0x2a00, PAGE, &list).unwrap();
        assert_eq!(n, 3);
        assert_eq!(cmd.prp1, 0x20_0800);
        assert_eq!(cmd.prp2, list.bus);
        assert_eq!(mem.read_u64(list.bus), 0x40_0000);
        assert_eq!(mem.read_u64(list.bus + 8), 0x40_1000);
        assert_eq!(mem.read_u64(list.bus + 16), 0x60_0000);
    }

    #[test]
    fn scattered_prp_rejects_unaligned_interior_segment() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut sgl = VecSgl::new(vec![
            Segment {
                bus: 0x20_0000,
                len: 0x600,
            },
            Segment {
                bus: 0x40_0000,
                len: 0x1000,
            },
        ]);
        let mut cmd = Command::default();
        assert_eq!(
            build_scattered_prp(&mut cmd, &mem, &mut sgl, 0, 0x1600, PAGE, &list),
            Err(BuildError::Misaligned(0x20_0600))
        );
    }

    #[test]
    fn scattered_prp_short_payload() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut sgl = VecSgl::new(vec![Segment {
            bus: 0x20_0000,
            len: 0x1000,
        }]);
        let mut cmd = Command::default();
        assert_eq!(
            build_scattered_prp(&mut cmd, &mem, &mut sgl, 0, 0x2000, PAGE, &list),
            Err(BuildError::ShortPayload)
        );
    }

    #[test]
    fn sgl_single_segment_is_inline() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut sgl = VecSgl::new(vec![Segment {
            bus: 0x20_0010,
            len: 0x3000,
        }]);
        let mut cmd = Command::default();
        assert_eq!(build_sgl(&mut cmd, &mem, &mut sgl, 0, 0x1000, &list), Ok(1));
        let desc = cmd.sgl1().unwrap();
        assert_eq!(desc, SglDescriptor::data_block(0x20_0010, 0x1000));
    }

    #[test]
    fn sgl_multiple_segments_use_last_segment_list() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut sgl = VecSgl::new(vec![
            Segment {
                bus: 0x20_0010,
                len: 0x100,
            },
            Segment {
                bus: 0x30_0020,
                len: 0x100,
            },
        ]);
        let mut cmd = Command::default();
        assert_eq!(build_sgl(&mut cmd, &mem, &mut sgl, 0, 0x180, &list), Ok(2));
        let desc = cmd.sgl1().unwrap();
        assert_eq!(desc.kind, SglType::LastSegment);
        assert_eq!(desc.address, list.bus);
        assert_eq!(desc.length, 32);

        let mut raw = [0u8; 16];
        mem.read(list.bus + 16, &mut raw);
        assert_eq!(
            SglDescriptor::from_bytes(&raw),
            Some(SglDescriptor::data_block(0x30_0020, 0x80))
        );
    }

    #[test]
    fn sgl_reset_honors_offset() {
        let mem = SparseMemory::new();
        let list = list(&mem);
        let mut sgl = VecSgl::new(vec![
            Segment {
                bus: 0x20_0000,
                len: 0x1000,
            },
            Segment {
                bus: 0x30_0000,
                len: 0x1000,
            },
        ]);
        let mut cmd = Command::default();
        build_sgl(&mut cmd, &mem, &mut sgl, 0x1200, 0x200, &list).unwrap();
        assert_eq!(
            cmd.sgl1(),
            Some(SglDescriptor::data_block(0x30_0200, 0x200))
        );
    }

    proptest! {
        #[test]
        fn contiguous_entry_count_law(
            page_index in 0x100u64..0x200,
            offset in 0u64..PAGE,
            len in 1usize..(256 * 4096),
        ) {
            let mem = SparseMemory::new();
            let list = list(&mem);
            let vaddr = page_index * PAGE + offset;
            let mut cmd = Command::default();
            let n = build_contiguous_prp(&mut cmd, &mem, vaddr, len, PAGE, &list).unwrap();

            let bus = vaddr + BUS_OFFSET;
            let expected = (len as u64 + bus % PAGE).div_ceil(PAGE) - 1;
            prop_assert_eq!(n as u64, expected);
            prop_assert_eq!(cmd.prp1, bus);
            if expected == 1 {
                prop_assert_eq!(cmd.prp2, (bus & !(PAGE - 1)) + PAGE);
            }
            if expected > 1 {
                prop_assert_eq!(cmd.prp2, list.bus);
                let last = mem.read_u64(list.bus + (expected - 1) * 8);
                prop_assert_eq!(last, (bus & !(PAGE - 1)) + expected * PAGE);
            }
        }
    }
}
