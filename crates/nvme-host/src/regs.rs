//! Controller register file (BAR0).

pub const REG_CAP: u64 = 0x00;
pub const REG_VS: u64 = 0x08;
pub const REG_INTMS: u64 = 0x0c;
pub const REG_INTMC: u64 = 0x10;
pub const REG_CC: u64 = 0x14;
pub const REG_CSTS: u64 = 0x1c;
pub const REG_NSSR: u64 = 0x20;
pub const REG_AQA: u64 = 0x24;
pub const REG_ASQ: u64 = 0x28;
pub const REG_ACQ: u64 = 0x30;
pub const REG_CMBLOC: u64 = 0x38;
pub const REG_CMBSZ: u64 = 0x3c;

pub const DOORBELL_BASE: u64 = 0x1000;

/// Offset of the submission queue tail doorbell for `qid`.
pub fn sq_tail_doorbell(qid: u16, stride: u64) -> u64 {
    DOORBELL_BASE + (2 * qid as u64) * stride
}

/// Offset of the completion queue head doorbell for `qid`.
pub fn cq_head_doorbell(qid: u16, stride: u64) -> u64 {
    DOORBELL_BASE + (2 * qid as u64 + 1) * stride
}

/// CAP: controller capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Maximum queue entries supported, zero-based.
    pub fn mqes(&self) -> u16 {
        self.0 as u16
    }

    pub fn max_queue_entries(&self) -> u32 {
        self.mqes() as u32 + 1
    }

    pub fn contiguous_queues_required(&self) -> bool {
        self.0 & (1 << 16) != 0
    }

    /// Arbitration mechanisms supported beyond round robin (bit 0 WRR, bit 1 vendor).
    pub fn ams(&self) -> u8 {
        ((self.0 >> 17) & 0x3) as u8
    }

    /// Worst-case time to flip CSTS.RDY, in 500 ms units.
    pub fn to(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn ready_timeout_ms(&self) -> u64 {
        self.to() as u64 * 500
    }

    pub fn dstrd(&self) -> u8 {
        ((self.0 >> 32) & 0xf) as u8
    }

    pub fn doorbell_stride(&self) -> u64 {
        4 << self.dstrd()
    }

    pub fn nssrs(&self) -> bool {
        self.0 & (1 << 36) != 0
    }

    pub fn nvm_command_set(&self) -> bool {
        self.0 & (1 << 37) != 0
    }

    pub fn mpsmin(&self) -> u8 {
        ((self.0 >> 48) & 0xf) as u8
    }

    pub fn mpsmax(&self) -> u8 {
        ((self.0 >> 52) & 0xf) as u8
    }

    pub fn min_page_size(&self) -> u64 {
        1 << (12 + self.mpsmin())
    }

    pub fn max_page_size(&self) -> u64 {
        1 << (12 + self.mpsmax())
    }

    pub fn cmbs(&self) -> bool {
        self.0 & (1 << 57) != 0
    }
}

/// VS: NVMe version the controller implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32);

impl Version {
    pub const V1_1: Version = Version(0x0001_0100);
    pub const V1_2: Version = Version(0x0001_0200);

    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

pub const CC_SHN_NONE: u8 = 0;
pub const CC_SHN_NORMAL: u8 = 1;
pub const CC_SHN_ABRUPT: u8 = 2;

/// CC: controller configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerConfig {
    pub enable: bool,
    pub css: u8,
    /// Memory page size as log2(bytes) - 12.
    pub mps: u8,
    pub ams: u8,
    pub shn: u8,
    /// I/O submission queue entry size, log2.
    pub iosqes: u8,
    /// I/O completion queue entry size, log2.
    pub iocqes: u8,
}

impl ControllerConfig {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            enable: raw & 1 != 0,
            css: ((raw >> 4) & 0x7) as u8,
            mps: ((raw >> 7) & 0xf) as u8,
            ams: ((raw >> 11) & 0x7) as u8,
            shn: ((raw >> 14) & 0x3) as u8,
            iosqes: ((raw >> 16) & 0xf) as u8,
            iocqes: ((raw >> 20) & 0xf) as u8,
        }
    }

    pub fn to_raw(self) -> u32 {
        self.enable as u32
            | (self.css as u32 & 0x7) << 4
            | (self.mps as u32 & 0xf) << 7
            | (self.ams as u32 & 0x7) << 11
            | (self.shn as u32 & 0x3) << 14
            | (self.iosqes as u32 & 0xf) << 16
            | (self.iocqes as u32 & 0xf) << 20
    }
}

pub const SHST_NORMAL: u8 = 0;
pub const SHST_OCCURRING: u8 = 1;
pub const SHST_COMPLETE: u8 = 2;

/// CSTS: controller status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus(pub u32);

impl ControllerStatus {
    pub fn ready(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn fatal(&self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn shst(&self) -> u8 {
        ((self.0 >> 2) & 0x3) as u8
    }
}

/// AQA with both admin queue sizes given in entries (stored zero-based).
pub fn admin_queue_attributes(sq_entries: u16, cq_entries: u16) -> u32 {
    (sq_entries as u32 - 1) & 0xfff | ((cq_entries as u32 - 1) & 0xfff) << 16
}

/// CMBSZ: controller memory buffer size and capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmbSize(pub u32);

impl CmbSize {
    pub fn sqs(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn cqs(&self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn lists(&self) -> bool {
        self.0 & (1 << 2) != 0
    }

    pub fn unit(&self) -> u64 {
        let szu = (self.0 >> 8) & 0xf;
        4096u64 << (4 * szu)
    }

    pub fn size_bytes(&self) -> u64 {
        (self.0 >> 12) as u64 * self.unit()
    }
}

/// CMBLOC: controller memory buffer location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmbLocation(pub u32);

impl CmbLocation {
    pub fn bar(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    /// Offset into the BAR in [`CmbSize::unit`] units.
    pub fn offset_units(&self) -> u64 {
        (self.0 >> 12) as u64
    }
}
