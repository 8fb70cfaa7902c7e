use crate::error::{Result, SceError, Stage};
use serde::{Deserialize, Serialize};

/// "SCE\0"
pub const SCE_MAGIC: u32 = 0x5343_4500;
pub const SCE_VERSION: u32 = 2;

/// Size of the trailing ECDSA signature block: r[21] s[21] reserved[6]
pub const SIGNATURE_SIZE: usize = 0x30;

/// Smallest metadata block: info (0x40) plus metadata header (0x20)
const MIN_METADATA_LEN: u64 = 0x60;

/// Outer container variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ContainerType {
    #[default]
    #[serde(rename = "SELF")]
    LoadableImage,
    #[serde(rename = "RVK")]
    RevokeList,
    #[serde(rename = "PKG")]
    Package,
    #[serde(rename = "SPP")]
    SecurePayload,
}

impl ContainerType {
    pub fn to_u16(self) -> u16 {
        match self {
            ContainerType::LoadableImage => 1,
            ContainerType::RevokeList => 2,
            ContainerType::Package => 3,
            ContainerType::SecurePayload => 4,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ContainerType::LoadableImage),
            2 => Some(ContainerType::RevokeList),
            3 => Some(ContainerType::Package),
            4 => Some(ContainerType::SecurePayload),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ContainerType::LoadableImage => "SELF",
            ContainerType::RevokeList => "RVK",
            ContainerType::Package => "PKG",
            ContainerType::SecurePayload => "SPP",
        }
    }
}

impl std::str::FromStr for ContainerType {
    type Err = SceError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SELF" => Ok(Self::LoadableImage),
            "RVK" => Ok(Self::RevokeList),
            "PKG" => Ok(Self::Package),
            "SPP" => Ok(Self::SecurePayload),
            _ => Err(SceError::InvalidArgument(format!("container type: {}", s))),
        }
    }
}

/// Loadable image subtype, selects the key family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelfType {
    Lv0,
    Lv1,
    Lv2,
    #[default]
    App,
    Iso,
    Ldr,
    Unk7,
    Npdrm,
}

impl SelfType {
    pub fn to_u32(self) -> u32 {
        match self {
            SelfType::Lv0 => 1,
            SelfType::Lv1 => 2,
            SelfType::Lv2 => 3,
            SelfType::App => 4,
            SelfType::Iso => 5,
            SelfType::Ldr => 6,
            SelfType::Unk7 => 7,
            SelfType::Npdrm => 8,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(SelfType::Lv0),
            2 => Some(SelfType::Lv1),
            3 => Some(SelfType::Lv2),
            4 => Some(SelfType::App),
            5 => Some(SelfType::Iso),
            6 => Some(SelfType::Ldr),
            7 => Some(SelfType::Unk7),
            8 => Some(SelfType::Npdrm),
            _ => None,
        }
    }
}

impl std::str::FromStr for SelfType {
    type Err = SceError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "LV0" => Ok(Self::Lv0),
            "LV1" => Ok(Self::Lv1),
            "LV2" => Ok(Self::Lv2),
            "APP" => Ok(Self::App),
            "ISO" => Ok(Self::Iso),
            "LDR" => Ok(Self::Ldr),
            "UNK7" => Ok(Self::Unk7),
            "NPDRM" => Ok(Self::Npdrm),
            _ => Err(SceError::InvalidArgument(format!("self type: {}", s))),
        }
    }
}

/// DRM license type carried in the license block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LicenseType {
    Network,
    Local,
    #[default]
    Free,
}

impl LicenseType {
    pub fn to_u32(self) -> u32 {
        match self {
            LicenseType::Network => 1,
            LicenseType::Local => 2,
            LicenseType::Free => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(LicenseType::Network),
            2 => Some(LicenseType::Local),
            3 => Some(LicenseType::Free),
            _ => None,
        }
    }
}

impl std::str::FromStr for LicenseType {
    type Err = SceError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "NETWORK" => Ok(Self::Network),
            "LOCAL" => Ok(Self::Local),
            "FREE" => Ok(Self::Free),
            _ => Err(SceError::InvalidArgument(format!("license type: {}", s))),
        }
    }
}

/// DRM application type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NpAppType {
    Sprx,
    #[default]
    Exec,
    Usprx,
    Uexec,
}

impl NpAppType {
    pub fn to_u32(self) -> u32 {
        match self {
            NpAppType::Sprx => 0,
            NpAppType::Exec => 1,
            NpAppType::Usprx => 0x20,
            NpAppType::Uexec => 0x21,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NpAppType::Sprx),
            1 => Some(NpAppType::Exec),
            0x20 => Some(NpAppType::Usprx),
            0x21 => Some(NpAppType::Uexec),
            _ => None,
        }
    }
}

impl std::str::FromStr for NpAppType {
    type Err = SceError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SPRX" => Ok(Self::Sprx),
            "EXEC" => Ok(Self::Exec),
            "USPRX" => Ok(Self::Usprx),
            "UEXEC" => Ok(Self::Uexec),
            _ => Err(SceError::InvalidArgument(format!("application type: {}", s))),
        }
    }
}

/// Inputs for laying out a new container header
#[derive(Debug, Clone, Copy)]
pub struct HeaderAttributes {
    pub container_type: ContainerType,
    pub key_revision: u16,
    /// Bytes between the outer header and the metadata info, 16-byte aligned
    pub extended_len: u32,
    /// Signature plus any license block after the payload
    pub trailer_len: u64,
}

/// Outer container header
/// Layout: [magic: 4][version: 4][key_revision: 2][type: 2][metadata_offset: 4]
///         [header_len: 8][total_len: 8], big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u32,
    pub key_revision: u16,
    pub container_type: ContainerType,
    /// Offset of the metadata info, relative to the end of this header
    pub metadata_offset: u32,
    /// Everything up to the first section payload byte
    pub header_len: u64,
    pub total_len: u64,
}

impl ContainerHeader {
    pub const SIZE: usize = 0x20;

    pub fn build(attrs: &HeaderAttributes, metadata_len: u64, payload_len: u64) -> Self {
        let header_len = align16(Self::SIZE as u64 + attrs.extended_len as u64 + metadata_len);
        Self {
            version: SCE_VERSION,
            key_revision: attrs.key_revision,
            container_type: attrs.container_type,
            metadata_offset: attrs.extended_len,
            header_len,
            total_len: header_len + payload_len + attrs.trailer_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&SCE_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..10].copy_from_slice(&self.key_revision.to_be_bytes());
        buf[10..12].copy_from_slice(&self.container_type.to_u16().to_be_bytes());
        buf[12..16].copy_from_slice(&self.metadata_offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.header_len.to_be_bytes());
        buf[24..32].copy_from_slice(&self.total_len.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(SceError::format(
                Stage::Header,
                format!("need {} bytes, got {}", Self::SIZE, bytes.len()),
            ));
        }

        let magic = read_u32(bytes, 0);
        if magic != SCE_MAGIC {
            return Err(SceError::format(
                Stage::Header,
                format!("bad magic 0x{:08x}", magic),
            ));
        }

        let version = read_u32(bytes, 4);
        if version != SCE_VERSION {
            return Err(SceError::format(
                Stage::Header,
                format!("unsupported version {}", version),
            ));
        }

        let raw_type = read_u16(bytes, 10);
        let container_type = ContainerType::from_u16(raw_type).ok_or_else(|| {
            SceError::format(Stage::Header, format!("unknown container type {}", raw_type))
        })?;

        Ok(Self {
            version,
            key_revision: read_u16(bytes, 8),
            container_type,
            metadata_offset: read_u32(bytes, 12),
            header_len: read_u64(bytes, 16),
            total_len: read_u64(bytes, 24),
        })
    }

    /// Parse and bounds-check the header, returning it with the still
    /// encrypted metadata block.
    pub fn parse(input: &[u8]) -> Result<(Self, &[u8])> {
        let header = Self::from_bytes(input)?;

        if header.total_len != input.len() as u64 {
            return Err(SceError::format(
                Stage::Header,
                format!(
                    "declared total length {} but container is {} bytes",
                    header.total_len,
                    input.len()
                ),
            ));
        }

        let metadata_start = header.metadata_start() as u64;
        if header.header_len < metadata_start + MIN_METADATA_LEN {
            return Err(SceError::format(
                Stage::Header,
                format!(
                    "header length {} leaves no room for metadata at {}",
                    header.header_len, metadata_start
                ),
            ));
        }
        let fits = header
            .header_len
            .checked_add(SIGNATURE_SIZE as u64)
            .is_some_and(|end| end <= header.total_len);
        if !fits {
            return Err(SceError::format(
                Stage::Header,
                format!(
                    "header length {} exceeds total length {}",
                    header.header_len, header.total_len
                ),
            ));
        }

        let metadata = &input[header.metadata_start()..header.header_len as usize];
        Ok((header, metadata))
    }

    /// Absolute offset of the metadata info
    pub fn metadata_start(&self) -> usize {
        Self::SIZE + self.metadata_offset as usize
    }

    /// Bytes covered by the main signature when `trailer_len` bytes follow the payload
    pub fn signed_len(&self, trailer_len: u64) -> Result<usize> {
        self.total_len
            .checked_sub(trailer_len)
            .filter(|len| *len >= self.header_len)
            .map(|len| len as usize)
            .ok_or_else(|| {
                SceError::format(
                    Stage::Header,
                    format!(
                        "trailer of {} bytes does not fit after header ({} of {})",
                        trailer_len, self.header_len, self.total_len
                    ),
                )
            })
    }
}

pub(crate) fn align16(value: u64) -> u64 {
    (value + 0xF) & !0xF
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_be_bytes(buf)
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ContainerHeader {
        let attrs = HeaderAttributes {
            container_type: ContainerType::LoadableImage,
            key_revision: 0x1c,
            extended_len: 0x100,
            trailer_len: SIGNATURE_SIZE as u64,
        };
        ContainerHeader::build(&attrs, 0x40 + 0x20 + 0x30 + 0x80, 0x200)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        let parsed = ContainerHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"SCE\0");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..10], &[0x00, 0x1c]);
        assert_eq!(&bytes[10..12], &[0x00, 0x01]);
        assert_eq!(&bytes[12..16], &[0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_build_lengths() {
        let header = sample_header();
        assert_eq!(header.metadata_start(), 0x120);
        assert_eq!(header.header_len % 16, 0);
        assert_eq!(header.header_len, 0x120 + 0x130);
        assert_eq!(header.total_len, header.header_len + 0x200 + 0x30);
        assert_eq!(header.signed_len(0x30).unwrap() as u64, header.header_len + 0x200);
    }

    #[test]
    fn test_parse_returns_metadata_block() {
        let header = sample_header();
        let mut container = vec![0u8; header.total_len as usize];
        container[..ContainerHeader::SIZE].copy_from_slice(&header.to_bytes());
        container[header.metadata_start()] = 0xAA;

        let (parsed, metadata) = ContainerHeader::parse(&container).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(metadata.len(), 0x130);
        assert_eq!(metadata[0], 0xAA);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = sample_header().to_bytes();
        bytes[0] = b'X';
        let err = ContainerHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, SceError::Format { stage: Stage::Header, .. }));
    }

    #[test]
    fn test_parse_rejects_truncated_container() {
        let header = sample_header();
        let mut container = vec![0u8; header.total_len as usize - 1];
        container[..ContainerHeader::SIZE].copy_from_slice(&header.to_bytes());
        assert!(ContainerHeader::parse(&container).is_err());
    }

    #[test]
    fn test_parse_rejects_header_past_total() {
        let mut header = sample_header();
        header.header_len = header.total_len;
        let mut container = vec![0u8; header.total_len as usize];
        container[..ContainerHeader::SIZE].copy_from_slice(&header.to_bytes());
        assert!(ContainerHeader::parse(&container).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_header_len() {
        let mut header = sample_header();
        header.header_len = u64::MAX - 0x10;
        let mut container = vec![0u8; header.total_len as usize];
        container[..ContainerHeader::SIZE].copy_from_slice(&header.to_bytes());
        let err = ContainerHeader::parse(&container).unwrap_err();
        assert!(matches!(err, SceError::Format { stage: Stage::Header, .. }));
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert!(ContainerHeader::parse(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("self".parse::<ContainerType>().unwrap(), ContainerType::LoadableImage);
        assert_eq!("NPDRM".parse::<SelfType>().unwrap(), SelfType::Npdrm);
        assert_eq!("local".parse::<LicenseType>().unwrap(), LicenseType::Local);
        assert_eq!("uexec".parse::<NpAppType>().unwrap(), NpAppType::Uexec);
        assert!("bogus".parse::<SelfType>().is_err());
    }

    #[test]
    fn test_enum_wire_values() {
        for t in [SelfType::Lv0, SelfType::App, SelfType::Npdrm] {
            assert_eq!(SelfType::from_u32(t.to_u32()), Some(t));
        }
        assert_eq!(NpAppType::Usprx.to_u32(), 0x20);
        assert_eq!(LicenseType::from_u32(3), Some(LicenseType::Free));
        assert_eq!(ContainerType::from_u16(5), None);
    }
}
