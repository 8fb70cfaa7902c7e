//! Extended header of a loadable image container, stored in plaintext
//! between the outer header and the metadata info.
//!
//! ```text
//! 0x20  self header      0x50
//! 0x70  app info         0x20
//! 0x90  ELF header       0x40 / 0x34
//!       program headers  (16-byte aligned)
//!       segment infos    0x20 per program header  (restated segment table)
//!       version info     0x10
//!       control infos    chained, type/size/next prefixed
//! ```

use crate::error::{Result, SceError, Stage};
use crate::header::{align16, read_u32, read_u64, ContainerHeader, SelfType};
use crate::image::elf::{ehdr_size, parse_ehdr, parse_phdrs};

pub const SELF_HEADER_SIZE: usize = 0x50;
pub const APP_INFO_SIZE: usize = 0x20;
pub const SEGMENT_INFO_SIZE: usize = 0x20;
pub const VERSION_INFO_SIZE: usize = 0x10;
pub const CONTROL_FLAGS_SIZE: usize = 0x20;
pub const ELF_DIGEST_SIZE: usize = 0x14;

/// Program headers representable in the 64-bit permissions word, 3 bits each
pub const MAX_PROGRAM_HEADERS: usize = 21;

const SELF_HEADER_TYPE: u64 = 3;
const CONTROL_INFO_PREFIX: usize = 0x10;
const CONTROL_INFO_FLAGS: u32 = 1;
const CONTROL_INFO_DIGEST: u32 = 2;
const DIGEST_PAYLOAD_SIZE: usize = 2 * ELF_DIGEST_SIZE + 8;

const SEGMENT_PLAIN: u32 = 1;
const SEGMENT_ENCRYPTED: u32 = 2;
const SEGMENT_UNCOMPRESSED: u32 = 1;
const SEGMENT_COMPRESSED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppInfo {
    pub auth_id: u64,
    pub vendor_id: u32,
    pub self_type: SelfType,
    pub version: u64,
}

impl AppInfo {
    fn to_bytes(self) -> [u8; APP_INFO_SIZE] {
        let mut buf = [0u8; APP_INFO_SIZE];
        buf[0..8].copy_from_slice(&self.auth_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.vendor_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.self_type.to_u32().to_be_bytes());
        buf[16..24].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw_type = read_u32(bytes, 12);
        let self_type = SelfType::from_u32(raw_type).ok_or_else(|| {
            SceError::format(Stage::Executable, format!("unknown image type {}", raw_type))
        })?;
        Ok(Self {
            auth_id: read_u64(bytes, 0),
            vendor_id: read_u32(bytes, 8),
            self_type,
            version: read_u64(bytes, 16),
        })
    }
}

/// Restated location of one program header's payload inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentInfo {
    pub offset: u64,
    pub size: u64,
    pub compressed: bool,
    pub encrypted: bool,
}

impl SegmentInfo {
    fn to_bytes(self) -> [u8; SEGMENT_INFO_SIZE] {
        let mut buf = [0u8; SEGMENT_INFO_SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.size.to_be_bytes());
        let compressed = if self.compressed { SEGMENT_COMPRESSED } else { SEGMENT_UNCOMPRESSED };
        buf[16..20].copy_from_slice(&compressed.to_be_bytes());
        let encrypted = if self.encrypted { SEGMENT_ENCRYPTED } else { SEGMENT_PLAIN };
        buf[28..32].copy_from_slice(&encrypted.to_be_bytes());
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            offset: read_u64(bytes, 0),
            size: read_u64(bytes, 8),
            compressed: read_u32(bytes, 16) == SEGMENT_COMPRESSED,
            encrypted: read_u32(bytes, 28) == SEGMENT_ENCRYPTED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlInfo {
    Flags([u8; CONTROL_FLAGS_SIZE]),
    Digest {
        constant: [u8; ELF_DIGEST_SIZE],
        elf_digest: [u8; ELF_DIGEST_SIZE],
        fw_version: u64,
    },
    Unknown {
        kind: u32,
        data: Vec<u8>,
    },
}

impl ControlInfo {
    fn kind(&self) -> u32 {
        match self {
            ControlInfo::Flags(_) => CONTROL_INFO_FLAGS,
            ControlInfo::Digest { .. } => CONTROL_INFO_DIGEST,
            ControlInfo::Unknown { kind, .. } => *kind,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            ControlInfo::Flags(flags) => flags.to_vec(),
            ControlInfo::Digest {
                constant,
                elf_digest,
                fw_version,
            } => {
                let mut out = Vec::with_capacity(DIGEST_PAYLOAD_SIZE);
                out.extend_from_slice(constant);
                out.extend_from_slice(elf_digest);
                out.extend_from_slice(&fw_version.to_be_bytes());
                out
            }
            ControlInfo::Unknown { data, .. } => data.clone(),
        }
    }

    fn encoded_len(&self) -> usize {
        CONTROL_INFO_PREFIX
            + match self {
                ControlInfo::Flags(_) => CONTROL_FLAGS_SIZE,
                ControlInfo::Digest { .. } => DIGEST_PAYLOAD_SIZE,
                ControlInfo::Unknown { data, .. } => data.len(),
            }
    }

    fn parse_all(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut infos = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + CONTROL_INFO_PREFIX > bytes.len() {
                return Err(SceError::format(Stage::Executable, "truncated control info"));
            }
            let kind = read_u32(bytes, pos);
            let size = read_u32(bytes, pos + 4) as usize;
            let more = read_u64(bytes, pos + 8) != 0;
            if size < CONTROL_INFO_PREFIX || pos + size > bytes.len() {
                return Err(SceError::format(
                    Stage::Executable,
                    format!("control info type {} has bad size {}", kind, size),
                ));
            }
            let payload = &bytes[pos + CONTROL_INFO_PREFIX..pos + size];
            infos.push(match kind {
                CONTROL_INFO_FLAGS if payload.len() == CONTROL_FLAGS_SIZE => {
                    let mut flags = [0u8; CONTROL_FLAGS_SIZE];
                    flags.copy_from_slice(payload);
                    ControlInfo::Flags(flags)
                }
                CONTROL_INFO_DIGEST if payload.len() == DIGEST_PAYLOAD_SIZE => {
                    let mut constant = [0u8; ELF_DIGEST_SIZE];
                    let mut elf_digest = [0u8; ELF_DIGEST_SIZE];
                    constant.copy_from_slice(&payload[..ELF_DIGEST_SIZE]);
                    elf_digest.copy_from_slice(&payload[ELF_DIGEST_SIZE..2 * ELF_DIGEST_SIZE]);
                    ControlInfo::Digest {
                        constant,
                        elf_digest,
                        fw_version: read_u64(payload, 2 * ELF_DIGEST_SIZE),
                    }
                }
                _ => ControlInfo::Unknown {
                    kind,
                    data: payload.to_vec(),
                },
            });
            pos += size;
            if !more {
                break;
            }
        }
        Ok(infos)
    }
}

/// Plaintext attributes the secure loader reads before touching metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub app_info: AppInfo,
    pub ehdr: Vec<u8>,
    pub phdr_table: Vec<u8>,
    /// One entry per program header
    pub segment_infos: Vec<SegmentInfo>,
    pub permissions: u64,
    /// Absolute offset of the carried ELF section header table, 0 if absent
    pub shdr_offset: u64,
    pub version_present: bool,
    pub control_infos: Vec<ControlInfo>,
}

struct Offsets {
    phdr: usize,
    segment_info: usize,
    version: usize,
    control_info: usize,
    control_info_size: usize,
    end: usize,
}

impl ImageHeader {
    const BASE: usize = ContainerHeader::SIZE;
    const APP_INFO_OFFSET: usize = Self::BASE + SELF_HEADER_SIZE;
    const ELF_OFFSET: usize = Self::APP_INFO_OFFSET + APP_INFO_SIZE;

    fn offsets(&self) -> Offsets {
        let phdr = align16((Self::ELF_OFFSET + self.ehdr.len()) as u64) as usize;
        let segment_info = align16((phdr + self.phdr_table.len()) as u64) as usize;
        let version = segment_info + self.segment_infos.len() * SEGMENT_INFO_SIZE;
        let control_info = version + VERSION_INFO_SIZE;
        let control_info_size = self.control_infos.iter().map(|c| c.encoded_len()).sum();
        let end = align16((control_info + control_info_size) as u64) as usize;
        Offsets {
            phdr,
            segment_info,
            version,
            control_info,
            control_info_size,
            end,
        }
    }

    /// Bytes this header occupies after the outer header, 16-byte aligned
    pub fn encoded_len(&self) -> usize {
        self.offsets().end - Self::BASE
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let off = self.offsets();
        let mut out = vec![0u8; off.end - Self::BASE];
        let at = |absolute: usize| absolute - Self::BASE;

        let fields: [u64; 10] = [
            SELF_HEADER_TYPE,
            Self::APP_INFO_OFFSET as u64,
            Self::ELF_OFFSET as u64,
            off.phdr as u64,
            self.shdr_offset,
            off.segment_info as u64,
            off.version as u64,
            off.control_info as u64,
            off.control_info_size as u64,
            self.permissions,
        ];
        for (i, value) in fields.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&value.to_be_bytes());
        }

        let app = at(Self::APP_INFO_OFFSET);
        out[app..app + APP_INFO_SIZE].copy_from_slice(&self.app_info.to_bytes());
        let elf = at(Self::ELF_OFFSET);
        out[elf..elf + self.ehdr.len()].copy_from_slice(&self.ehdr);
        let ph = at(off.phdr);
        out[ph..ph + self.phdr_table.len()].copy_from_slice(&self.phdr_table);

        for (i, info) in self.segment_infos.iter().enumerate() {
            let start = at(off.segment_info) + i * SEGMENT_INFO_SIZE;
            out[start..start + SEGMENT_INFO_SIZE].copy_from_slice(&info.to_bytes());
        }

        let version = at(off.version);
        out[version..version + 4].copy_from_slice(&1u32.to_be_bytes());
        out[version + 4..version + 8].copy_from_slice(&u32::from(self.version_present).to_be_bytes());
        out[version + 8..version + 12].copy_from_slice(&(VERSION_INFO_SIZE as u32).to_be_bytes());

        let mut pos = at(off.control_info);
        let count = self.control_infos.len();
        for (i, info) in self.control_infos.iter().enumerate() {
            let len = info.encoded_len();
            out[pos..pos + 4].copy_from_slice(&info.kind().to_be_bytes());
            out[pos + 4..pos + 8].copy_from_slice(&(len as u32).to_be_bytes());
            out[pos + 8..pos + 16].copy_from_slice(&u64::from(i + 1 < count).to_be_bytes());
            out[pos + CONTROL_INFO_PREFIX..pos + len].copy_from_slice(&info.payload());
            pos += len;
        }
        out
    }

    /// Parse the extended header out of a container whose outer header
    /// has already been validated
    pub fn parse(container: &[u8], header: &ContainerHeader) -> Result<Self> {
        let region_end = header.metadata_start();
        if region_end < Self::ELF_OFFSET || region_end > container.len() {
            return Err(SceError::format(
                Stage::Executable,
                format!("extended header region ends at 0x{:x}", region_end),
            ));
        }
        let region = &container[..region_end];
        let field = |i: usize| read_u64(region, Self::BASE + i * 8);

        if field(0) != SELF_HEADER_TYPE {
            return Err(SceError::format(
                Stage::Executable,
                format!("unexpected extended header type {}", field(0)),
            ));
        }

        let within = |offset: u64, len: u64, what: &str| -> Result<usize> {
            let outside = offset
                .checked_add(len)
                .map_or(true, |end| end > region_end as u64);
            if outside {
                return Err(SceError::format(
                    Stage::Executable,
                    format!("{} at 0x{:x}+0x{:x} outside the extended header", what, offset, len),
                ));
            }
            Ok(offset as usize)
        };

        let app = within(field(1), APP_INFO_SIZE as u64, "app info")?;
        let app_info = AppInfo::from_bytes(&region[app..app + APP_INFO_SIZE])?;

        // Class byte decides how much ELF header to take.
        let elf = within(field(2), 0x10, "ELF ident")?;
        let class = match region[elf + 4] {
            1 => crate::image::elf::ElfClass::Elf32,
            2 => crate::image::elf::ElfClass::Elf64,
            other => {
                return Err(SceError::format(
                    Stage::Executable,
                    format!("unknown ELF class {}", other),
                ))
            }
        };
        let elf = within(field(2), ehdr_size(class) as u64, "ELF header")?;
        let ehdr = region[elf..elf + ehdr_size(class)].to_vec();
        let (elf_header, ctx, _) = parse_ehdr(&ehdr)?;

        let phnum = elf_header.e_phnum as usize;
        if phnum > MAX_PROGRAM_HEADERS {
            return Err(SceError::format(
                Stage::Executable,
                format!("{} program headers exceed the format capacity", phnum),
            ));
        }
        let phdr_len = phnum * elf_header.e_phentsize as usize;
        let ph = within(field(3), phdr_len as u64, "program headers")?;
        let phdr_table = region[ph..ph + phdr_len].to_vec();
        parse_phdrs(&phdr_table, phnum, ctx)?;

        let si = within(field(5), (phnum * SEGMENT_INFO_SIZE) as u64, "segment infos")?;
        let segment_infos = (0..phnum)
            .map(|i| SegmentInfo::from_bytes(&region[si + i * SEGMENT_INFO_SIZE..]))
            .collect();

        let version = within(field(6), VERSION_INFO_SIZE as u64, "version info")?;
        let version_present = read_u32(region, version + 4) != 0;

        let ci_size = field(8);
        let ci = within(field(7), ci_size, "control infos")?;
        let control_infos = ControlInfo::parse_all(&region[ci..ci + ci_size as usize])?;

        Ok(Self {
            app_info,
            ehdr,
            phdr_table,
            segment_infos,
            permissions: field(9),
            shdr_offset: field(4),
            version_present,
            control_infos,
        })
    }

    pub fn control_flags(&self) -> Option<&[u8; CONTROL_FLAGS_SIZE]> {
        self.control_infos.iter().find_map(|c| match c {
            ControlInfo::Flags(flags) => Some(flags),
            _ => None,
        })
    }

    pub fn elf_digest(&self) -> Option<(&[u8; ELF_DIGEST_SIZE], u64)> {
        self.control_infos.iter().find_map(|c| match c {
            ControlInfo::Digest {
                elf_digest,
                fw_version,
                ..
            } => Some((elf_digest, *fw_version)),
            _ => None,
        })
    }
}

/// Pack per-segment permission masks, 3 bits each
pub fn permissions_word(masks: impl IntoIterator<Item = u8>) -> u64 {
    masks
        .into_iter()
        .enumerate()
        .fold(0u64, |acc, (i, mask)| acc | (u64::from(mask & 0x7) << (3 * i)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderAttributes;
    use crate::image::elf::ExecutableImage;
    use crate::testkit;

    fn sample_header() -> ImageHeader {
        let image = ExecutableImage::parse(&testkit::sample_elf()).unwrap();
        ImageHeader {
            app_info: AppInfo {
                auth_id: 0x1010_0000_0100_0003,
                vendor_id: 0x0100_0002,
                self_type: SelfType::App,
                version: 0x0001_0000_0000_0000,
            },
            ehdr: image.ehdr.clone(),
            phdr_table: image.phdr_table.clone(),
            segment_infos: vec![
                SegmentInfo {
                    offset: 0x800,
                    size: 0x1800,
                    compressed: false,
                    encrypted: true,
                },
                SegmentInfo {
                    offset: 0x2000,
                    size: 0x90,
                    compressed: true,
                    encrypted: true,
                },
            ],
            permissions: permissions_word(image.segments.iter().map(|s| s.permissions())),
            shdr_offset: 0x2100,
            version_present: true,
            control_infos: vec![
                ControlInfo::Flags([0u8; CONTROL_FLAGS_SIZE]),
                ControlInfo::Digest {
                    constant: [0x62; ELF_DIGEST_SIZE],
                    elf_digest: [0x17; ELF_DIGEST_SIZE],
                    fw_version: 0x0003_0041_0000_0000,
                },
            ],
        }
    }

    fn embed(header: &ImageHeader) -> (Vec<u8>, ContainerHeader) {
        let attrs = HeaderAttributes {
            container_type: crate::header::ContainerType::LoadableImage,
            key_revision: 0,
            extended_len: header.encoded_len() as u32,
            trailer_len: 0x30,
        };
        let outer = ContainerHeader::build(&attrs, 0x100, 0);
        let mut bytes = outer.to_bytes().to_vec();
        bytes.extend_from_slice(&header.to_bytes());
        bytes.resize(outer.total_len as usize, 0);
        (bytes, outer)
    }

    #[test]
    fn test_image_header_roundtrip() {
        let header = sample_header();
        let (bytes, outer) = embed(&header);
        let parsed = ImageHeader::parse(&bytes, &outer).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_encoded_len_is_aligned() {
        let header = sample_header();
        assert_eq!(header.encoded_len() % 16, 0);
        assert_eq!(header.to_bytes().len(), header.encoded_len());
    }

    #[test]
    fn test_permissions_word() {
        assert_eq!(permissions_word([5u8, 6]), 5 | (6 << 3));
        assert_eq!(permissions_word(std::iter::repeat(7u8).take(21)), (1u64 << 63) - 1);
    }

    #[test]
    fn test_accessors() {
        let header = sample_header();
        assert_eq!(header.control_flags(), Some(&[0u8; CONTROL_FLAGS_SIZE]));
        let (digest, fw) = header.elf_digest().unwrap();
        assert_eq!(digest, &[0x17; ELF_DIGEST_SIZE]);
        assert_eq!(fw, 0x0003_0041_0000_0000);
    }

    #[test]
    fn test_bad_header_type_rejected() {
        let header = sample_header();
        let (mut bytes, outer) = embed(&header);
        bytes[0x27] = 9;
        assert!(matches!(
            ImageHeader::parse(&bytes, &outer),
            Err(SceError::Format { stage: Stage::Executable, .. })
        ));
    }

    #[test]
    fn test_wrapping_control_info_size_rejected() {
        let header = sample_header();
        let (mut bytes, outer) = embed(&header);
        let at = ImageHeader::BASE + 8 * 8;
        bytes[at..at + 8].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(
            ImageHeader::parse(&bytes, &outer),
            Err(SceError::Format { stage: Stage::Executable, .. })
        ));

        let (mut bytes, outer) = embed(&header);
        let at = ImageHeader::BASE + 7 * 8;
        bytes[at..at + 8].copy_from_slice(&(u64::MAX - 4).to_be_bytes());
        assert!(matches!(
            ImageHeader::parse(&bytes, &outer),
            Err(SceError::Format { stage: Stage::Executable, .. })
        ));
    }
}
