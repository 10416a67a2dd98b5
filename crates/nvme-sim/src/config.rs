use std::time::Duration;

use nvme_host::{
    LbaFormat, PciId, OACS_FIRMWARE, OACS_FORMAT_NVM, OACS_NS_MANAGEMENT, OAES_NS_ATTRIBUTE,
    ONCS_DSM, ONCS_RESERVATIONS, ONCS_WRITE_ZEROES,
};

/// Geometry of one simulated namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSpec {
    pub sectors: u64,
    /// Supported LBA formats; Format NVM may select any of them.
    pub formats: Vec<LbaFormat>,
    /// Index into `formats` currently in use.
    pub format: u8,
    /// Metadata is transferred inline after each sector.
    pub extended: bool,
    /// Protection information type, 0 for none.
    pub pi: u8,
    pub dlfeat: u8,
}

impl NamespaceSpec {
    /// A namespace of `sectors` blocks of `1 << lbads` bytes. A second format
    /// with 8 bytes of metadata and a 4 KiB format are offered as well.
    pub fn new(sectors: u64, lbads: u8) -> Self {
        Self {
            sectors,
            formats: vec![
                LbaFormat { ms: 0, lbads, rp: 0 },
                LbaFormat { ms: 8, lbads, rp: 0 },
                LbaFormat { ms: 0, lbads: 12, rp: 0 },
            ],
            format: 0,
            extended: false,
            pi: 0,
            dlfeat: 1,
        }
    }

    /// Switches to the metadata-carrying format with inline (extended) LBAs.
    pub fn with_extended_metadata(mut self) -> Self {
        self.format = 1;
        self.extended = true;
        self
    }

    pub fn lba_format(&self) -> LbaFormat {
        self.formats[self.format as usize]
    }

    /// Bytes moved per logical block.
    pub fn stride(&self) -> usize {
        let fmt = self.lba_format();
        let mut stride = 1usize << fmt.lbads;
        if self.extended {
            stride += fmt.ms as usize;
        }
        stride
    }
}

/// Static description of a simulated controller.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub pci_id: PciId,
    /// Zero-based maximum queue entries (CAP.MQES).
    pub mqes: u16,
    /// Ready timeout in 500 ms units (CAP.TO).
    pub timeout_units: u8,
    pub dstrd: u8,
    /// Arbitration mechanisms beyond round robin (CAP.AMS).
    pub ams: u8,
    pub mpsmin: u8,
    pub mpsmax: u8,
    pub version: u32,
    /// Time CSTS.RDY takes to follow CC.EN in either direction.
    pub ready_delay: Duration,
    /// CSTS.RDY never asserts after enable.
    pub never_ready: bool,
    /// The controller comes up enabled and ready, as left by firmware.
    pub start_enabled: bool,
    /// Shutdown notifications never reach "complete".
    pub shutdown_hangs: bool,
    /// Controller memory buffer size in bytes (multiple of 4 KiB), 0 for none.
    pub cmb_size: u64,
    /// I/O queue pairs the controller grants at most.
    pub max_io_queues: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub mdts: u8,
    pub oacs: u16,
    pub oncs: u16,
    pub vwc: u8,
    pub sgls: u32,
    pub aerl: u8,
    pub oaes: u32,
    pub lpa: u8,
    pub cntlid: u16,
    /// Byte 3 of the vendor specific identify area (stripe size hint).
    pub stripe_hint: u8,
    pub firmware_slots: u8,
    /// Namespace ids the controller supports (identify NN).
    pub max_namespaces: u32,
    /// Namespaces present and attached at power-on, as nsid 1, 2, ...
    pub namespaces: Vec<NamespaceSpec>,
    pub memory_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pci_id: PciId {
                vendor: 0x1d1d,
                device: 0x0001,
                subvendor: 0x1d1d,
                subdevice: 0x0001,
            },
            mqes: 1023,
            timeout_units: 20,
            dstrd: 0,
            ams: 0,
            mpsmin: 0,
            mpsmax: 4,
            version: 0x0001_0300,
            ready_delay: Duration::ZERO,
            never_ready: false,
            start_enabled: false,
            shutdown_hangs: false,
            cmb_size: 0,
            max_io_queues: 4,
            serial: "SIM0000000000000001".to_string(),
            model: "nvme-sim controller".to_string(),
            firmware: "1.0".to_string(),
            mdts: 5,
            oacs: OACS_FORMAT_NVM | OACS_FIRMWARE | OACS_NS_MANAGEMENT,
            oncs: ONCS_DSM | ONCS_WRITE_ZEROES | ONCS_RESERVATIONS,
            vwc: 1,
            sgls: 0,
            aerl: 3,
            oaes: OAES_NS_ATTRIBUTE,
            lpa: 0,
            cntlid: 1,
            stripe_hint: 0,
            firmware_slots: 2,
            max_namespaces: 4,
            namespaces: vec![NamespaceSpec::new(1 << 20, 9)],
            memory_size: 32 << 20,
        }
    }
}
