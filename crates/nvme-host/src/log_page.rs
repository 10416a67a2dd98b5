//! Supported log page and feature tables.

use crate::identify::{IdentifyController, LPA_COMMAND_EFFECTS, OAES_NS_ATTRIBUTE};
use crate::quirks::{Quirks, PCI_VENDOR_INTEL};

pub mod log_id {
    pub const ERROR: u8 = 0x01;
    pub const HEALTH: u8 = 0x02;
    pub const FIRMWARE_SLOT: u8 = 0x03;
    pub const CHANGED_NS_LIST: u8 = 0x04;
    pub const COMMAND_EFFECTS: u8 = 0x05;
    pub const RESERVATION_NOTIFICATION: u8 = 0x80;

    pub const INTEL_DIRECTORY: u8 = 0xc0;
    pub const INTEL_READ_LATENCY: u8 = 0xc1;
    pub const INTEL_WRITE_LATENCY: u8 = 0xc2;
    pub const INTEL_TEMPERATURE: u8 = 0xc5;
    pub const INTEL_SMART: u8 = 0xca;
    pub const INTEL_MARKETING: u8 = 0xdd;
}

pub mod feature_id {
    pub const ARBITRATION: u8 = 0x01;
    pub const POWER_MANAGEMENT: u8 = 0x02;
    pub const LBA_RANGE_TYPE: u8 = 0x03;
    pub const TEMPERATURE_THRESHOLD: u8 = 0x04;
    pub const ERROR_RECOVERY: u8 = 0x05;
    pub const VOLATILE_WRITE_CACHE: u8 = 0x06;
    pub const NUMBER_OF_QUEUES: u8 = 0x07;
    pub const INTERRUPT_COALESCING: u8 = 0x08;
    pub const INTERRUPT_VECTOR_CONFIGURATION: u8 = 0x09;
    pub const WRITE_ATOMICITY: u8 = 0x0a;
    pub const ASYNC_EVENT_CONFIGURATION: u8 = 0x0b;
    pub const AUTONOMOUS_POWER_STATE_TRANSITION: u8 = 0x0c;
    pub const HOST_MEM_BUFFER: u8 = 0x0d;
    pub const SOFTWARE_PROGRESS_MARKER: u8 = 0x80;
    pub const HOST_IDENTIFIER: u8 = 0x81;
    pub const HOST_RESERVE_MASK: u8 = 0x82;
    pub const HOST_RESERVE_PERSIST: u8 = 0x83;

    pub const INTEL_MAX_LBA: u8 = 0xc1;
    pub const INTEL_NATIVE_MAX_LBA: u8 = 0xc2;
    pub const INTEL_POWER_GOVERNOR_SETTING: u8 = 0xc6;
    pub const INTEL_SMBUS_ADDRESS: u8 = 0xc8;
    pub const INTEL_LED_PATTERN: u8 = 0xc9;
    pub const INTEL_RESET_TIMED_WORKLOAD_COUNTERS: u8 = 0xd5;
    pub const INTEL_LATENCY_TRACKING: u8 = 0xe2;
}

/// A set of 8-bit identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdSet([u64; 4]);

impl IdSet {
    pub fn contains(&self, id: u8) -> bool {
        self.0[id as usize / 64] & (1 << (id % 64)) != 0
    }

    pub fn insert(&mut self, id: u8) {
        self.0[id as usize / 64] |= 1 << (id % 64);
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(|&id| self.contains(id))
    }
}

impl FromIterator<u8> for IdSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = IdSet::default();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

/// Non-zero log lengths advertised by the Intel log page directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntelLogDirectory {
    pub read_latency: u8,
    pub write_latency: u8,
    pub temperature: u8,
    pub smart: u8,
    pub marketing: u8,
}

impl IntelLogDirectory {
    pub const SIZE: usize = 512;

    pub fn parse(data: &[u8]) -> Self {
        let at = |off: usize| data.get(off).copied().unwrap_or(0);
        Self {
            read_latency: at(386),
            write_latency: at(388),
            temperature: at(390),
            smart: at(392),
            marketing: at(430),
        }
    }
}

pub(crate) fn is_intel(cdata: &IdentifyController) -> bool {
    cdata.vid == PCI_VENDOR_INTEL
}

/// Whether the Intel directory page should be read at all.
pub(crate) fn wants_intel_directory(cdata: &IdentifyController, quirks: Quirks) -> bool {
    is_intel(cdata) && !quirks.contains(Quirks::NO_LOG_PAGES)
}

/// Log pages the controller is known to implement. `directory` is the Intel
/// directory when it was read successfully.
pub(crate) fn supported_log_pages(
    cdata: &IdentifyController,
    quirks: Quirks,
    directory: Option<&IntelLogDirectory>,
) -> IdSet {
    let mut set = IdSet::default();
    set.insert(log_id::ERROR);
    set.insert(log_id::HEALTH);
    set.insert(log_id::FIRMWARE_SLOT);
    if cdata.lpa & LPA_COMMAND_EFFECTS != 0 {
        set.insert(log_id::COMMAND_EFFECTS);
    }
    if cdata.oaes & OAES_NS_ATTRIBUTE != 0 {
        set.insert(log_id::CHANGED_NS_LIST);
    }

    if !wants_intel_directory(cdata, quirks) {
        return set;
    }
    set.insert(log_id::INTEL_DIRECTORY);
    let Some(dir) = directory else {
        return set;
    };
    if dir.read_latency != 0 || quirks.contains(Quirks::INTEL_READ_LATENCY) {
        set.insert(log_id::INTEL_READ_LATENCY);
    }
    if dir.write_latency != 0 || quirks.contains(Quirks::INTEL_WRITE_LATENCY) {
        set.insert(log_id::INTEL_WRITE_LATENCY);
    }
    if dir.temperature != 0 {
        set.insert(log_id::INTEL_TEMPERATURE);
    }
    if dir.smart != 0 {
        set.insert(log_id::INTEL_SMART);
    }
    if dir.marketing != 0 {
        set.insert(log_id::INTEL_MARKETING);
    }
    set
}

pub(crate) fn supported_features(cdata: &IdentifyController) -> IdSet {
    use feature_id::*;

    let mut set: IdSet = [
        ARBITRATION,
        POWER_MANAGEMENT,
        TEMPERATURE_THRESHOLD,
        ERROR_RECOVERY,
        NUMBER_OF_QUEUES,
        INTERRUPT_COALESCING,
        INTERRUPT_VECTOR_CONFIGURATION,
        WRITE_ATOMICITY,
        ASYNC_EVENT_CONFIGURATION,
    ]
    .into_iter()
    .collect();

    if cdata.volatile_write_cache() {
        set.insert(VOLATILE_WRITE_CACHE);
    }
    if cdata.apsta & 1 != 0 {
        set.insert(AUTONOMOUS_POWER_STATE_TRANSITION);
    }
    if cdata.hmpre != 0 {
        set.insert(HOST_MEM_BUFFER);
    }
    if cdata.reservations() {
        set.insert(SOFTWARE_PROGRESS_MARKER);
        set.insert(HOST_IDENTIFIER);
        set.insert(HOST_RESERVE_MASK);
        set.insert(HOST_RESERVE_PERSIST);
    }
    if is_intel(cdata) {
        for id in [
            INTEL_MAX_LBA,
            INTEL_NATIVE_MAX_LBA,
            INTEL_POWER_GOVERNOR_SETTING,
            INTEL_SMBUS_ADDRESS,
            INTEL_LED_PATTERN,
            INTEL_RESET_TIMED_WORKLOAD_COUNTERS,
            INTEL_LATENCY_TRACKING,
        ] {
            set.insert(id);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::{IDENTIFY_DATA_SIZE, ONCS_RESERVATIONS};

    fn cdata(vid: u16, lpa: u8) -> IdentifyController {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&vid.to_le_bytes());
        data[261] = lpa;
        IdentifyController::parse(&data)
    }

    #[test]
    fn id_set_bits() {
        let mut set = IdSet::default();
        set.insert(0);
        set.insert(0xc1);
        set.insert(0xff);
        assert!(set.contains(0xc1));
        assert!(!set.contains(0xc2));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 0xc1, 0xff]);
    }

    #[test]
    fn generic_controller_log_pages() {
        let set = supported_log_pages(&cdata(0x1b36, 0), Quirks::empty(), None);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let set = supported_log_pages(&cdata(0x1b36, LPA_COMMAND_EFFECTS), Quirks::empty(), None);
        assert!(set.contains(log_id::COMMAND_EFFECTS));

        let mut c = cdata(0x1b36, 0);
        c.oaes = OAES_NS_ATTRIBUTE;
        let set = supported_log_pages(&c, Quirks::empty(), None);
        assert!(set.contains(log_id::CHANGED_NS_LIST));
    }

    #[test]
    fn intel_directory_enables_vendor_pages() {
        let mut raw = vec![0u8; IntelLogDirectory::SIZE];
        raw[390] = 1;
        raw[430] = 2;
        let dir = IntelLogDirectory::parse(&raw);
        let quirks = Quirks::INTEL_READ_LATENCY;
        let set = supported_log_pages(&cdata(PCI_VENDOR_INTEL, 0), quirks, Some(&dir));
        assert!(set.contains(log_id::INTEL_DIRECTORY));
        assert!(set.contains(log_id::INTEL_READ_LATENCY));
        assert!(!set.contains(log_id::INTEL_WRITE_LATENCY));
        assert!(set.contains(log_id::INTEL_TEMPERATURE));
        assert!(!set.contains(log_id::INTEL_SMART));
        assert!(set.contains(log_id::INTEL_MARKETING));
    }

    #[test]
    fn directory_latency_entries_enable_latency_pages() {
        let mut raw = vec![0u8; IntelLogDirectory::SIZE];
        raw[386] = 1;
        raw[388] = 1;
        let dir = IntelLogDirectory::parse(&raw);
        let set = supported_log_pages(&cdata(PCI_VENDOR_INTEL, 0), Quirks::empty(), Some(&dir));
        assert!(set.contains(log_id::INTEL_READ_LATENCY));
        assert!(set.contains(log_id::INTEL_WRITE_LATENCY));

        let empty = IntelLogDirectory::default();
        let set = supported_log_pages(&cdata(PCI_VENDOR_INTEL, 0), Quirks::empty(), Some(&empty));
        assert!(!set.contains(log_id::INTEL_READ_LATENCY));
        assert!(!set.contains(log_id::INTEL_WRITE_LATENCY));
    }

    #[test]
    fn no_log_pages_quirk_skips_directory() {
        let c = cdata(PCI_VENDOR_INTEL, 0);
        assert!(!wants_intel_directory(&c, Quirks::NO_LOG_PAGES));
        let set = supported_log_pages(&c, Quirks::NO_LOG_PAGES, None);
        assert!(!set.contains(log_id::INTEL_DIRECTORY));
    }

    #[test]
    fn features_follow_identify_data() {
        let base = supported_features(&cdata(0x1b36, 0));
        assert!(base.contains(feature_id::NUMBER_OF_QUEUES));
        assert!(!base.contains(feature_id::VOLATILE_WRITE_CACHE));
        assert!(!base.contains(feature_id::INTEL_MAX_LBA));

        let mut c = cdata(PCI_VENDOR_INTEL, 0);
        c.vwc = 1;
        c.oncs |= ONCS_RESERVATIONS;
        let set = supported_features(&c);
        assert!(set.contains(feature_id::VOLATILE_WRITE_CACHE));
        assert!(set.contains(feature_id::HOST_IDENTIFIER));
        assert!(set.contains(feature_id::INTEL_LATENCY_TRACKING));
    }
}
