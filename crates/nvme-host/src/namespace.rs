//! Namespace geometry and NVM command builders.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::command::{nvm_opcode, Command, Completion};
use crate::identify::{
    IdentifyController, IdentifyNamespace, ONCS_DSM, ONCS_RESERVATIONS, ONCS_WRITE_ZEROES,
};
use crate::platform::DmaBuffer;
use crate::qpair::QueuePair;
use crate::quirks::Quirks;
use crate::request::{Payload, Request, SharedSgl};
use crate::{Error, Result};

bitflags! {
    /// Commands and features a namespace supports.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct NamespaceFlags: u32 {
        const DEALLOCATE = 1 << 0;
        const FLUSH = 1 << 1;
        const RESERVATION = 1 << 2;
        const WRITE_ZEROES = 1 << 3;
        const DPS_PI = 1 << 4;
        const EXTENDED_LBA = 1 << 5;
        const DEALLOCATED_READS_ZERO = 1 << 6;
    }
}

bitflags! {
    /// Per-command flags carried in CDW12 of read/write/write-zeroes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IoFlags: u32 {
        const PRCHK_REFTAG = 1 << 26;
        const PRCHK_APPTAG = 1 << 27;
        const PRCHK_GUARD = 1 << 28;
        const PRACT = 1 << 29;
        const FUA = 1 << 30;
        const LIMITED_RETRY = 1 << 31;
    }
}

/// Protection information type of the active format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiType {
    None,
    Type1,
    Type2,
    Type3,
}

impl PiType {
    fn from_dps(dps: u8) -> PiType {
        match dps & 0x7 {
            1 => PiType::Type1,
            2 => PiType::Type2,
            3 => PiType::Type3,
            _ => PiType::None,
        }
    }
}

pub const DSM_MAX_RANGES: usize = 256;
const DSM_ATTR_DEALLOCATE: u32 = 1 << 2;

/// One dataset management range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsmRange {
    pub attributes: u32,
    pub length: u32,
    pub starting_lba: u64,
}

impl DsmRange {
    pub fn new(starting_lba: u64, length: u32) -> Self {
        Self {
            attributes: 0,
            length,
            starting_lba,
        }
    }

    fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.attributes.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..16].copy_from_slice(&self.starting_lba.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationType {
    WriteExclusive = 1,
    ExclusiveAccess = 2,
    WriteExclusiveRegistrantsOnly = 3,
    ExclusiveAccessRegistrantsOnly = 4,
    WriteExclusiveAllRegistrants = 5,
    ExclusiveAccessAllRegistrants = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAction {
    Register = 0,
    Unregister = 1,
    Replace = 2,
}

/// Change persist through power loss state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistAction {
    #[default]
    NoChange = 0,
    Clear = 2,
    Persist = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAction {
    Acquire = 0,
    Preempt = 1,
    PreemptAndAbort = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    Release = 0,
    Clear = 1,
}

/// Snapshot of a namespace's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceStat {
    pub id: u32,
    pub sector_size: u32,
    pub sectors: u64,
    pub max_io_sectors: u32,
    pub stripe_sectors: u32,
    pub metadata_size: u32,
    pub pi_type: PiType,
    pub flags: NamespaceFlags,
}

/// An active namespace and the geometry derived from its identify data.
#[derive(Debug)]
pub struct Namespace {
    id: u32,
    sector_size: u32,
    /// Payload bytes per LBA, including inline metadata for extended formats.
    extended_lba_size: u32,
    sectors: u64,
    sectors_per_max_io: u32,
    sectors_per_stripe: u32,
    md_size: u32,
    pi_type: PiType,
    flags: NamespaceFlags,
    data: IdentifyNamespace,
}

impl Namespace {
    pub(crate) fn from_identify(
        id: u32,
        data: IdentifyNamespace,
        cdata: &IdentifyController,
        quirks: Quirks,
        max_xfer_size: usize,
        min_page_size: u64,
    ) -> Self {
        let format = data.current_format();
        let sector_size = 1u32 << format.lbads.clamp(9, 31);
        let md_size = format.ms as u32;
        let extended = data.extended_lba();
        let extended_lba_size = if extended {
            sector_size + md_size
        } else {
            sector_size
        };
        let sectors_per_max_io = ((max_xfer_size / extended_lba_size as usize) as u32).max(1);

        let stripe_hint = cdata.vs.get(3).copied().unwrap_or(0);
        let sectors_per_stripe = if quirks.contains(Quirks::INTEL_STRIPING) && stripe_hint != 0 {
            ((1u64 << stripe_hint) * min_page_size / sector_size as u64) as u32
        } else {
            0
        };

        let mut flags = NamespaceFlags::empty();
        if cdata.oncs & ONCS_DSM != 0 {
            flags |= NamespaceFlags::DEALLOCATE;
        }
        if cdata.volatile_write_cache() {
            flags |= NamespaceFlags::FLUSH;
        }
        if cdata.oncs & ONCS_RESERVATIONS != 0 {
            flags |= NamespaceFlags::RESERVATION;
        }
        if cdata.oncs & ONCS_WRITE_ZEROES != 0 {
            flags |= NamespaceFlags::WRITE_ZEROES;
        }
        let pi_type = PiType::from_dps(data.dps);
        if pi_type != PiType::None {
            flags |= NamespaceFlags::DPS_PI;
        }
        if extended {
            flags |= NamespaceFlags::EXTENDED_LBA;
        }
        if data.deallocated_reads_zero() {
            flags |= NamespaceFlags::DEALLOCATED_READS_ZERO;
        }

        Self {
            id,
            sector_size,
            extended_lba_size,
            sectors: data.nsze,
            sectors_per_max_io,
            sectors_per_stripe,
            md_size,
            pi_type,
            flags,
            data,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }

    pub fn max_io_sectors(&self) -> u32 {
        self.sectors_per_max_io
    }

    pub fn stripe_sectors(&self) -> u32 {
        self.sectors_per_stripe
    }

    pub fn metadata_size(&self) -> u32 {
        self.md_size
    }

    pub fn pi_type(&self) -> PiType {
        self.pi_type
    }

    pub fn flags(&self) -> NamespaceFlags {
        self.flags
    }

    pub fn data(&self) -> &IdentifyNamespace {
        &self.data
    }

    pub fn stat(&self) -> NamespaceStat {
        NamespaceStat {
            id: self.id,
            sector_size: self.sector_size,
            sectors: self.sectors,
            max_io_sectors: self.sectors_per_max_io,
            stripe_sectors: self.sectors_per_stripe,
            metadata_size: self.md_size,
            pi_type: self.pi_type,
            flags: self.flags,
        }
    }

    fn rw_command(&self, opc: u8, lba: u64, count: u32, flags: IoFlags) -> Command {
        let mut cmd = Command::new(opc).with_nsid(self.id);
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = (count - 1) | flags.bits();
        cmd
    }

    /// Splits `[lba, lba + count)` at stripe boundaries and at the per-command
    /// transfer limit.
    pub fn split_ranges(&self, lba: u64, count: u32) -> Vec<(u64, u32)> {
        let mut ranges = Vec::new();
        let mut lba = lba;
        let mut remaining = count;
        while remaining > 0 {
            let mut n = remaining.min(self.sectors_per_max_io);
            if self.sectors_per_stripe > 0 {
                let stripe = self.sectors_per_stripe as u64;
                n = n.min((stripe - lba % stripe) as u32);
            }
            ranges.push((lba, n));
            lba += n as u64;
            remaining -= n;
        }
        ranges
    }

    /// Builds a read or write request, split into children when it crosses a
    /// stripe boundary or exceeds the transfer limit.
    pub fn build_rw(
        &self,
        opc: u8,
        payload: Payload,
        lba: u64,
        count: u32,
        flags: IoFlags,
    ) -> Result<Request> {
        if count == 0 {
            return Err(Error::InvalidArgument("zero-length transfer"));
        }
        let stride = self.extended_lba_size as usize;
        let mut parent = Request::new(self.rw_command(opc, lba, count, flags))
            .with_payload(payload.clone(), count as usize * stride);

        let ranges = self.split_ranges(lba, count);
        if ranges.len() == 1 {
            return Ok(parent);
        }
        let mut offset = 0;
        for (child_lba, child_count) in ranges {
            let len = child_count as usize * stride;
            parent.add_child(
                Request::new(self.rw_command(opc, child_lba, child_count, flags))
                    .with_payload_range(payload.clone(), offset, len),
            );
            offset += len;
        }
        Ok(parent)
    }

    pub fn read(
        &self,
        qpair: &QueuePair,
        buf: u64,
        lba: u64,
        count: u32,
        flags: IoFlags,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let req = self.build_rw(nvm_opcode::READ, Payload::Contiguous(buf), lba, count, flags)?;
        qpair.submit(req.on_complete(cb))
    }

    pub fn write(
        &self,
        qpair: &QueuePair,
        buf: u64,
        lba: u64,
        count: u32,
        flags: IoFlags,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let req = self.build_rw(nvm_opcode::WRITE, Payload::Contiguous(buf), lba, count, flags)?;
        qpair.submit(req.on_complete(cb))
    }

    /// Read into a scattered buffer.
    pub fn readv(
        &self,
        qpair: &QueuePair,
        sgl: SharedSgl,
        lba: u64,
        count: u32,
        flags: IoFlags,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let req = self.build_rw(nvm_opcode::READ, Payload::Scattered(sgl), lba, count, flags)?;
        qpair.submit(req.on_complete(cb))
    }

    /// Write from a scattered buffer.
    pub fn writev(
        &self,
        qpair: &QueuePair,
        sgl: SharedSgl,
        lba: u64,
        count: u32,
        flags: IoFlags,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let req = self.build_rw(nvm_opcode::WRITE, Payload::Scattered(sgl), lba, count, flags)?;
        qpair.submit(req.on_complete(cb))
    }

    pub fn flush(
        &self,
        qpair: &QueuePair,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let cmd = Command::new(nvm_opcode::FLUSH).with_nsid(self.id);
        qpair.submit(Request::new(cmd).on_complete(cb))
    }

    pub fn write_zeroes(
        &self,
        qpair: &QueuePair,
        lba: u64,
        count: u32,
        flags: IoFlags,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgument("zero-length write zeroes"));
        }
        if count > u16::MAX as u32 + 1 {
            return Err(Error::InvalidArgument("write zeroes exceeds 65536 blocks"));
        }
        let cmd = self.rw_command(nvm_opcode::WRITE_ZEROES, lba, count, flags);
        qpair.submit(Request::new(cmd).on_complete(cb))
    }

    /// Deallocates (trims) up to 256 ranges.
    pub fn deallocate(
        &self,
        qpair: &QueuePair,
        ranges: &[DsmRange],
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        if ranges.is_empty() {
            return Err(Error::InvalidArgument("no ranges to deallocate"));
        }
        if ranges.len() > DSM_MAX_RANGES {
            return Err(Error::InvalidArgument("too many deallocate ranges"));
        }
        let mut bytes = Vec::with_capacity(ranges.len() * 16);
        for range in ranges {
            bytes.extend_from_slice(&range.to_bytes());
        }

        let mut cmd = Command::new(nvm_opcode::DATASET_MANAGEMENT).with_nsid(self.id);
        cmd.cdw10 = ranges.len() as u32 - 1;
        cmd.cdw11 = DSM_ATTR_DEALLOCATE;
        self.submit_with_buffer(qpair, cmd, &bytes, cb)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reservation_register(
        &self,
        qpair: &QueuePair,
        action: RegisterAction,
        ignore_key: bool,
        persist: PersistAction,
        current_key: u64,
        new_key: u64,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut cmd = Command::new(nvm_opcode::RESERVATION_REGISTER).with_nsid(self.id);
        cmd.cdw10 = action as u32 | (ignore_key as u32) << 3 | (persist as u32) << 30;
        let mut keys = [0u8; 16];
        keys[0..8].copy_from_slice(&current_key.to_le_bytes());
        keys[8..16].copy_from_slice(&new_key.to_le_bytes());
        self.submit_with_buffer(qpair, cmd, &keys, cb)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reservation_acquire(
        &self,
        qpair: &QueuePair,
        action: AcquireAction,
        ignore_key: bool,
        rtype: ReservationType,
        current_key: u64,
        preempt_key: u64,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut cmd = Command::new(nvm_opcode::RESERVATION_ACQUIRE).with_nsid(self.id);
        cmd.cdw10 = action as u32 | (ignore_key as u32) << 3 | (rtype as u32) << 8;
        let mut keys = [0u8; 16];
        keys[0..8].copy_from_slice(&current_key.to_le_bytes());
        keys[8..16].copy_from_slice(&preempt_key.to_le_bytes());
        self.submit_with_buffer(qpair, cmd, &keys, cb)
    }

    pub fn reservation_release(
        &self,
        qpair: &QueuePair,
        action: ReleaseAction,
        ignore_key: bool,
        rtype: ReservationType,
        current_key: u64,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let mut cmd = Command::new(nvm_opcode::RESERVATION_RELEASE).with_nsid(self.id);
        cmd.cdw10 = action as u32 | (ignore_key as u32) << 3 | (rtype as u32) << 8;
        self.submit_with_buffer(qpair, cmd, &current_key.to_le_bytes(), cb)
    }

    /// Reads the reservation status into the caller's buffer at `buf`.
    pub fn reservation_report(
        &self,
        qpair: &QueuePair,
        buf: u64,
        len: usize,
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length reservation report"));
        }
        if len % 4 != 0 {
            return Err(Error::InvalidArgument("reservation report length must be dword aligned"));
        }
        let mut cmd = Command::new(nvm_opcode::RESERVATION_REPORT).with_nsid(self.id);
        cmd.cdw10 = (len / 4 - 1) as u32;
        let req = Request::new(cmd)
            .with_payload(Payload::Contiguous(buf), len)
            .on_complete(cb);
        qpair.submit(req)
    }

    /// Submits `cmd` with `data` staged in a driver-owned DMA buffer that lives
    /// until the command completes.
    fn submit_with_buffer(
        &self,
        qpair: &QueuePair,
        cmd: Command,
        data: &[u8],
        cb: impl FnOnce(&Completion) + Send + 'static,
    ) -> Result<()> {
        let buffer = DmaBuffer::alloc(qpair.memory(), data.len(), qpair.page_size() as usize)?;
        buffer.write(0, data);
        let vaddr = buffer.region().vaddr;
        let req = Request::new(cmd)
            .with_payload(Payload::Contiguous(vaddr), data.len())
            .on_complete(move |cpl| {
                cb(cpl);
                drop(buffer);
            });
        qpair.submit(req)
    }
}

/// An open reference to a namespace. Dropping it closes the namespace.
pub struct NamespaceHandle {
    ns: Arc<Namespace>,
    open: Arc<AtomicUsize>,
}

impl NamespaceHandle {
    pub(crate) fn new(ns: Arc<Namespace>, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self { ns, open }
    }

    pub fn close(self) {}
}

impl Deref for NamespaceHandle {
    type Target = Namespace;

    fn deref(&self) -> &Namespace {
        &self.ns
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}
