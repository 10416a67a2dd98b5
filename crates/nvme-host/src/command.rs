//! Submission and completion entry formats.
//!
//! Commands are 64 bytes, completions 16 bytes, both little-endian. The
//! helpers here only encode and decode; they never touch device memory.

use std::fmt;

pub const COMMAND_SIZE: usize = 64;
pub const COMPLETION_SIZE: usize = 16;

/// Admin command set opcodes.
pub mod admin_opcode {
    pub const DELETE_IO_SQ: u8 = 0x00;
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const DELETE_IO_CQ: u8 = 0x04;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
    pub const ABORT: u8 = 0x08;
    pub const SET_FEATURES: u8 = 0x09;
    pub const GET_FEATURES: u8 = 0x0a;
    pub const ASYNC_EVENT_REQUEST: u8 = 0x0c;
    pub const NS_MANAGEMENT: u8 = 0x0d;
    pub const FIRMWARE_COMMIT: u8 = 0x10;
    pub const FIRMWARE_IMAGE_DOWNLOAD: u8 = 0x11;
    pub const NS_ATTACHMENT: u8 = 0x15;
    pub const KEEP_ALIVE: u8 = 0x18;
    pub const FORMAT_NVM: u8 = 0x80;
}

/// NVM command set opcodes.
pub mod nvm_opcode {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_UNCORRECTABLE: u8 = 0x04;
    pub const COMPARE: u8 = 0x05;
    pub const WRITE_ZEROES: u8 = 0x08;
    pub const DATASET_MANAGEMENT: u8 = 0x09;
    pub const RESERVATION_REGISTER: u8 = 0x0d;
    pub const RESERVATION_REPORT: u8 = 0x0e;
    pub const RESERVATION_ACQUIRE: u8 = 0x11;
    pub const RESERVATION_RELEASE: u8 = 0x15;
}

/// Status code types (completion status bits 11:9).
pub mod status_type {
    pub const GENERIC: u8 = 0x0;
    pub const COMMAND_SPECIFIC: u8 = 0x1;
    pub const MEDIA_ERROR: u8 = 0x2;
    pub const VENDOR_SPECIFIC: u8 = 0x7;
}

/// Generic command status codes.
pub mod generic_status {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const COMMAND_ID_CONFLICT: u8 = 0x03;
    pub const DATA_TRANSFER_ERROR: u8 = 0x04;
    pub const ABORTED_POWER_LOSS: u8 = 0x05;
    pub const INTERNAL_DEVICE_ERROR: u8 = 0x06;
    pub const ABORTED_BY_REQUEST: u8 = 0x07;
    pub const ABORTED_SQ_DELETION: u8 = 0x08;
    pub const ABORTED_FAILED_FUSED: u8 = 0x09;
    pub const ABORTED_MISSING_FUSED: u8 = 0x0a;
    pub const INVALID_NAMESPACE_OR_FORMAT: u8 = 0x0b;
    pub const COMMAND_SEQUENCE_ERROR: u8 = 0x0c;
    pub const INVALID_SGL_SEGMENT_DESCRIPTOR: u8 = 0x0d;
    pub const INVALID_NUMBER_OF_SGL_DESCRIPTORS: u8 = 0x0e;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
    pub const CAPACITY_EXCEEDED: u8 = 0x81;
    pub const NAMESPACE_NOT_READY: u8 = 0x82;
    pub const RESERVATION_CONFLICT: u8 = 0x83;
    pub const FORMAT_IN_PROGRESS: u8 = 0x84;
}

/// Command specific status codes.
pub mod command_specific_status {
    pub const COMPLETION_QUEUE_INVALID: u8 = 0x00;
    pub const INVALID_QUEUE_IDENTIFIER: u8 = 0x01;
    pub const MAXIMUM_QUEUE_SIZE_EXCEEDED: u8 = 0x02;
    pub const ABORT_COMMAND_LIMIT_EXCEEDED: u8 = 0x03;
    pub const ASYNC_EVENT_REQUEST_LIMIT_EXCEEDED: u8 = 0x05;
    pub const INVALID_FIRMWARE_SLOT: u8 = 0x06;
    pub const INVALID_FIRMWARE_IMAGE: u8 = 0x07;
    pub const INVALID_INTERRUPT_VECTOR: u8 = 0x08;
    pub const INVALID_LOG_PAGE: u8 = 0x09;
    pub const INVALID_FORMAT: u8 = 0x0a;
    pub const FIRMWARE_REQUIRES_RESET: u8 = 0x0b;
    pub const INVALID_QUEUE_DELETION: u8 = 0x0c;
}

/// Payload descriptor type carried in CDW0 bits 15:14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Psdt {
    #[default]
    Prp = 0,
    /// SGL for data, MPTR is a contiguous metadata buffer.
    SglContiguous = 1,
    /// SGL for data and metadata.
    SglSegment = 2,
}

impl Psdt {
    fn from_bits(bits: u8) -> Psdt {
        match bits & 0x3 {
            1 => Psdt::SglContiguous,
            2 => Psdt::SglSegment,
            _ => Psdt::Prp,
        }
    }
}

/// SGL descriptor type (upper nibble of byte 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SglType {
    DataBlock = 0x0,
    BitBucket = 0x1,
    Segment = 0x2,
    LastSegment = 0x3,
}

impl SglType {
    pub fn from_bits(bits: u8) -> Option<SglType> {
        match bits {
            0x0 => Some(SglType::DataBlock),
            0x1 => Some(SglType::BitBucket),
            0x2 => Some(SglType::Segment),
            0x3 => Some(SglType::LastSegment),
            _ => None,
        }
    }
}

pub const SGL_DESCRIPTOR_SIZE: usize = 16;

/// A 16-byte scatter/gather list descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SglDescriptor {
    pub address: u64,
    pub length: u32,
    pub kind: SglType,
}

impl SglDescriptor {
    pub fn data_block(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            kind: SglType::DataBlock,
        }
    }

    pub fn last_segment(address: u64, length: u32) -> Self {
        Self {
            address,
            length,
            kind: SglType::LastSegment,
        }
    }

    /// The descriptor as the two little-endian quadwords of a data pointer.
    pub fn to_words(self) -> (u64, u64) {
        let type_byte = (self.kind as u64) << 4;
        (self.address, self.length as u64 | (type_byte << 56))
    }

    pub fn from_words(lo: u64, hi: u64) -> Option<Self> {
        let kind = SglType::from_bits(((hi >> 60) & 0xf) as u8)?;
        Some(Self {
            address: lo,
            length: hi as u32,
            kind,
        })
    }

    pub fn to_bytes(self) -> [u8; SGL_DESCRIPTOR_SIZE] {
        let (lo, hi) = self.to_words();
        let mut out = [0u8; SGL_DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&lo.to_le_bytes());
        out[8..16].copy_from_slice(&hi.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; SGL_DESCRIPTOR_SIZE]) -> Option<Self> {
        let lo = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let hi = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        Self::from_words(lo, hi)
    }
}

/// A submission queue entry.
///
/// `prp1`/`prp2` hold either PRP entries or, when [`Command::psdt`] is an SGL
/// variant, the two halves of the first SGL descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    pub opc: u8,
    pub fuse: u8,
    pub psdt: Psdt,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Command {
    pub fn new(opc: u8) -> Self {
        Self {
            opc,
            ..Self::default()
        }
    }

    pub fn with_nsid(mut self, nsid: u32) -> Self {
        self.nsid = nsid;
        self
    }

    pub fn set_sgl1(&mut self, desc: SglDescriptor) {
        let (lo, hi) = desc.to_words();
        self.psdt = Psdt::SglContiguous;
        self.prp1 = lo;
        self.prp2 = hi;
    }

    pub fn sgl1(&self) -> Option<SglDescriptor> {
        match self.psdt {
            Psdt::Prp => None,
            _ => SglDescriptor::from_words(self.prp1, self.prp2),
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        let dw0 = self.opc as u32
            | ((self.fuse as u32 & 0x3) << 8)
            | ((self.psdt as u32) << 14)
            | ((self.cid as u32) << 16);
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[8..12].copy_from_slice(&self.cdw2.to_le_bytes());
        out[12..16].copy_from_slice(&self.cdw3.to_le_bytes());
        out[16..24].copy_from_slice(&self.mptr.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        out[40..44].copy_from_slice(&self.cdw10.to_le_bytes());
        out[44..48].copy_from_slice(&self.cdw11.to_le_bytes());
        out[48..52].copy_from_slice(&self.cdw12.to_le_bytes());
        out[52..56].copy_from_slice(&self.cdw13.to_le_bytes());
        out[56..60].copy_from_slice(&self.cdw14.to_le_bytes());
        out[60..64].copy_from_slice(&self.cdw15.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; COMMAND_SIZE]) -> Self {
        let dw = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let qw = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        let dw0 = dw(0);
        Self {
            opc: (dw0 & 0xff) as u8,
            fuse: ((dw0 >> 8) & 0x3) as u8,
            psdt: Psdt::from_bits(((dw0 >> 14) & 0x3) as u8),
            cid: (dw0 >> 16) as u16,
            nsid: dw(4),
            cdw2: dw(8),
            cdw3: dw(12),
            mptr: qw(16),
            prp1: qw(24),
            prp2: qw(32),
            cdw10: dw(40),
            cdw11: dw(44),
            cdw12: dw(48),
            cdw13: dw(52),
            cdw14: dw(56),
            cdw15: dw(60),
        }
    }
}

/// Completion status without the phase tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status {
    pub sct: u8,
    pub sc: u8,
    pub more: bool,
    pub dnr: bool,
}

impl Status {
    pub const SUCCESS: Status = Status::generic(generic_status::SUCCESS, false);

    pub const fn new(sct: u8, sc: u8, dnr: bool) -> Status {
        Status {
            sct,
            sc,
            more: false,
            dnr,
        }
    }

    pub const fn generic(sc: u8, dnr: bool) -> Status {
        Status::new(status_type::GENERIC, sc, dnr)
    }

    /// Status used for commands the driver rejects before they reach the device.
    pub const fn invalid_field() -> Status {
        Status::generic(generic_status::INVALID_FIELD, true)
    }

    pub const fn aborted_by_request() -> Status {
        Status::generic(generic_status::ABORTED_BY_REQUEST, true)
    }

    pub const fn aborted_sq_deletion() -> Status {
        Status::generic(generic_status::ABORTED_SQ_DELETION, true)
    }

    pub fn is_success(&self) -> bool {
        self.sct == status_type::GENERIC && self.sc == generic_status::SUCCESS
    }

    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// Whether the device may succeed if the same command is resubmitted.
    ///
    /// Only "namespace not ready" and "format in progress" qualify, and only
    /// when the device left DNR clear.
    pub fn is_retryable(&self) -> bool {
        match (self.sct, self.sc) {
            (
                status_type::GENERIC,
                generic_status::NAMESPACE_NOT_READY | generic_status::FORMAT_IN_PROGRESS,
            ) => !self.dnr,
            _ => false,
        }
    }

    pub fn is(&self, sct: u8, sc: u8) -> bool {
        self.sct == sct && self.sc == sc
    }

    /// Encodes status bits 15:1 of completion DW3's upper half; bit 0 (phase) is left clear.
    pub fn to_raw(self) -> u16 {
        let mut raw = (self.sc as u16) << 1 | ((self.sct as u16) & 0x7) << 9;
        if self.more {
            raw |= 1 << 14;
        }
        if self.dnr {
            raw |= 1 << 15;
        }
        raw
    }

    pub fn from_raw(raw: u16) -> Status {
        Status {
            sc: ((raw >> 1) & 0xff) as u8,
            sct: ((raw >> 9) & 0x7) as u8,
            more: raw & (1 << 14) != 0,
            dnr: raw & (1 << 15) != 0,
        }
    }

    fn describe(&self) -> Option<&'static str> {
        use generic_status::*;
        if self.sct != status_type::GENERIC {
            return None;
        }
        Some(match self.sc {
            SUCCESS => "success",
            INVALID_OPCODE => "invalid opcode",
            INVALID_FIELD => "invalid field",
            COMMAND_ID_CONFLICT => "command id conflict",
            DATA_TRANSFER_ERROR => "data transfer error",
            INTERNAL_DEVICE_ERROR => "internal device error",
            ABORTED_BY_REQUEST => "aborted by request",
            ABORTED_SQ_DELETION => "aborted: sq deletion",
            INVALID_NAMESPACE_OR_FORMAT => "invalid namespace or format",
            LBA_OUT_OF_RANGE => "lba out of range",
            NAMESPACE_NOT_READY => "namespace not ready",
            RESERVATION_CONFLICT => "reservation conflict",
            FORMAT_IN_PROGRESS => "format in progress",
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(text) => write!(f, "{text} (sct={:#x} sc={:#04x}", self.sct, self.sc)?,
            None => write!(f, "sct={:#x} sc={:#04x}", self.sct, self.sc)?,
        }
        if self.dnr {
            f.write_str(" dnr")?;
        }
        if self.describe().is_some() {
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// A completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    /// Command specific result (DW0).
    pub cdw0: u32,
    pub cdw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub phase: bool,
    pub status: Status,
}

impl Completion {
    /// A completion synthesized by the driver rather than read from the ring.
    pub fn synthesized(sqid: u16, cid: u16, status: Status) -> Self {
        Self {
            sqid,
            cid,
            status,
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPLETION_SIZE] {
        let mut out = [0u8; COMPLETION_SIZE];
        out[0..4].copy_from_slice(&self.cdw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.cdw1.to_le_bytes());
        let dw2 = (self.sqid as u32) << 16 | self.sqhd as u32;
        out[8..12].copy_from_slice(&dw2.to_le_bytes());
        let status = self.status.to_raw() | self.phase as u16;
        let dw3 = (status as u32) << 16 | self.cid as u32;
        out[12..16].copy_from_slice(&dw3.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; COMPLETION_SIZE]) -> Self {
        let dw = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let dw2 = dw(8);
        let dw3 = dw(12);
        let status = (dw3 >> 16) as u16;
        Self {
            cdw0: dw(0),
            cdw1: dw(4),
            sqhd: dw2 as u16,
            sqid: (dw2 >> 16) as u16,
            cid: dw3 as u16,
            phase: status & 1 != 0,
            status: Status::from_raw(status),
        }
    }
}
