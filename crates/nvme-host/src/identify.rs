//! Identify data structures (CNS 0x00, 0x01, 0x02).

pub const IDENTIFY_DATA_SIZE: usize = 4096;

pub const CNS_NAMESPACE: u8 = 0x00;
pub const CNS_CONTROLLER: u8 = 0x01;
pub const CNS_ACTIVE_NAMESPACE_LIST: u8 = 0x02;

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

fn ascii_field(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// Identify Controller data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum data transfer size as a power of two of the minimum page size; 0 = unlimited.
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    /// Optional asynchronous events supported.
    pub oaes: u32,
    /// Optional admin command support.
    pub oacs: u16,
    /// Abort command limit, zero-based.
    pub acl: u8,
    /// Asynchronous event request limit, zero-based.
    pub aerl: u8,
    pub frmw: u8,
    /// Log page attributes.
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub apsta: u8,
    pub hmpre: u32,
    pub sqes: u8,
    pub cqes: u8,
    pub nn: u32,
    /// Optional NVM command support.
    pub oncs: u16,
    pub fna: u8,
    pub vwc: u8,
    pub sgls: u32,
    /// Vendor specific area (bytes 3072..4096).
    pub vs: Vec<u8>,
}

pub const OACS_FORMAT_NVM: u16 = 1 << 1;
pub const OACS_FIRMWARE: u16 = 1 << 2;
pub const OACS_NS_MANAGEMENT: u16 = 1 << 3;

pub const ONCS_COMPARE: u16 = 1 << 0;
pub const ONCS_WRITE_UNCORRECTABLE: u16 = 1 << 1;
pub const ONCS_DSM: u16 = 1 << 2;
pub const ONCS_WRITE_ZEROES: u16 = 1 << 3;
pub const ONCS_RESERVATIONS: u16 = 1 << 5;

pub const LPA_COMMAND_EFFECTS: u8 = 1 << 1;
pub const OAES_NS_ATTRIBUTE: u32 = 1 << 8;

impl IdentifyController {
    pub fn parse(data: &[u8]) -> Self {
        assert!(data.len() >= IDENTIFY_DATA_SIZE);
        Self {
            vid: read_u16(data, 0),
            ssvid: read_u16(data, 2),
            serial: ascii_field(&data[4..24]),
            model: ascii_field(&data[24..64]),
            firmware: ascii_field(&data[64..72]),
            mdts: data[77],
            cntlid: read_u16(data, 78),
            ver: read_u32(data, 80),
            oaes: read_u32(data, 92),
            oacs: read_u16(data, 256),
            acl: data[258],
            aerl: data[259],
            frmw: data[260],
            lpa: data[261],
            elpe: data[262],
            npss: data[263],
            apsta: data[265],
            hmpre: read_u32(data, 272),
            sqes: data[512],
            cqes: data[513],
            nn: read_u32(data, 516),
            oncs: read_u16(data, 520),
            fna: data[524],
            vwc: data[525],
            sgls: read_u32(data, 536),
            vs: data[3072..4096].to_vec(),
        }
    }

    pub fn sgl_supported(&self) -> bool {
        self.sgls & 0x3 != 0
    }

    pub fn volatile_write_cache(&self) -> bool {
        self.vwc & 1 != 0
    }

    pub fn reservations(&self) -> bool {
        self.oncs & ONCS_RESERVATIONS != 0
    }
}

/// LBA format descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LbaFormat {
    /// Metadata bytes per LBA.
    pub ms: u16,
    /// LBA data size, log2.
    pub lbads: u8,
    pub rp: u8,
}

/// Identify Namespace data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyNamespace {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats, zero-based.
    pub nlbaf: u8,
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    pub rescap: u8,
    pub dlfeat: u8,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    pub lbaf: [LbaFormat; 16],
}

impl IdentifyNamespace {
    pub fn parse(data: &[u8]) -> Self {
        assert!(data.len() >= IDENTIFY_DATA_SIZE);
        let mut lbaf = [LbaFormat::default(); 16];
        for (i, fmt) in lbaf.iter_mut().enumerate() {
            let off = 128 + i * 4;
            *fmt = LbaFormat {
                ms: read_u16(data, off),
                lbads: data[off + 2],
                rp: data[off + 3] & 0x3,
            };
        }
        Self {
            nsze: read_u64(data, 0),
            ncap: read_u64(data, 8),
            nuse: read_u64(data, 16),
            nsfeat: data[24],
            nlbaf: data[25],
            flbas: data[26],
            mc: data[27],
            dpc: data[28],
            dps: data[29],
            nmic: data[30],
            rescap: data[31],
            dlfeat: data[33],
            nguid: data[104..120].try_into().unwrap(),
            eui64: data[120..128].try_into().unwrap(),
            lbaf,
        }
    }

    /// Serializes the fields used as a namespace-management create template.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..8].copy_from_slice(&self.nsze.to_le_bytes());
        data[8..16].copy_from_slice(&self.ncap.to_le_bytes());
        data[16..24].copy_from_slice(&self.nuse.to_le_bytes());
        data[24] = self.nsfeat;
        data[25] = self.nlbaf;
        data[26] = self.flbas;
        data[27] = self.mc;
        data[28] = self.dpc;
        data[29] = self.dps;
        data[30] = self.nmic;
        data[31] = self.rescap;
        data[33] = self.dlfeat;
        data[104..120].copy_from_slice(&self.nguid);
        data[120..128].copy_from_slice(&self.eui64);
        for (i, fmt) in self.lbaf.iter().enumerate() {
            let off = 128 + i * 4;
            data[off..off + 2].copy_from_slice(&fmt.ms.to_le_bytes());
            data[off + 2] = fmt.lbads;
            data[off + 3] = fmt.rp;
        }
        data
    }

    /// A namespace with zero size is allocated but not active.
    pub fn is_active(&self) -> bool {
        self.nsze != 0
    }

    pub fn current_format(&self) -> LbaFormat {
        self.lbaf[(self.flbas & 0xf) as usize]
    }

    /// Metadata is transferred at the end of each LBA.
    pub fn extended_lba(&self) -> bool {
        self.flbas & (1 << 4) != 0
    }

    /// Protection information type (0 = none).
    pub fn pi_type(&self) -> u8 {
        self.dps & 0x7
    }

    pub fn deallocated_reads_zero(&self) -> bool {
        self.dlfeat & 0x7 == 1
    }
}

/// Parses an active namespace id list, stopping at the first zero entry.
pub fn parse_namespace_list(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .take_while(|&id| id != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ascii_padded(dst: &mut [u8], s: &str) {
        dst.fill(b' ');
        dst[..s.len()].copy_from_slice(s.as_bytes());
    }

    #[test]
    fn parses_controller_fields() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&0x8086u16.to_le_bytes());
        write_ascii_padded(&mut data[4..24], "SN123");
        write_ascii_padded(&mut data[24..64], "Model X");
        write_ascii_padded(&mut data[64..72], "1.0");
        data[77] = 5;
        data[259] = 3;
        data[516..520].copy_from_slice(&4u32.to_le_bytes());
        data[536..540].copy_from_slice(&1u32.to_le_bytes());
        data[3072 + 3] = 2;

        let id = IdentifyController::parse(&data);
        assert_eq!(id.vid, 0x8086);
        assert_eq!(id.serial, "SN123");
        assert_eq!(id.model, "Model X");
        assert_eq!(id.firmware, "1.0");
        assert_eq!(id.mdts, 5);
        assert_eq!(id.aerl, 3);
        assert_eq!(id.nn, 4);
        assert!(id.sgl_supported());
        assert_eq!(id.vs[3], 2);
    }

    #[test]
    fn namespace_format_selection() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..8].copy_from_slice(&1000u64.to_le_bytes());
        data[26] = 0x11; // format 1, extended
        data[29] = 1;
        data[128 + 4..128 + 6].copy_from_slice(&8u16.to_le_bytes());
        data[128 + 6] = 12;

        let ns = IdentifyNamespace::parse(&data);
        assert!(ns.is_active());
        assert!(ns.extended_lba());
        assert_eq!(ns.pi_type(), 1);
        assert_eq!(ns.current_format(), LbaFormat { ms: 8, lbads: 12, rp: 0 });
        assert_eq!(IdentifyNamespace::parse(&ns.to_bytes()), ns);
    }

    #[test]
    fn namespace_list_stops_at_zero() {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        for (i, id) in [1u32, 3, 7].iter().enumerate() {
            data[i * 4..i * 4 + 4].copy_from_slice(&id.to_le_bytes());
        }
        assert_eq!(parse_namespace_list(&data), vec![1, 3, 7]);
    }
}
