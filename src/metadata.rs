//! Metadata crypto engine.
//!
//! Two nested encryption levels protect the metadata block:
//!
//! ```text
//! [metadata info 0x40]  AES-256-CBC under the keyset erk/riv
//! [metadata header 0x20][section headers n*0x30][key slots k*0x10][optional headers]
//!                       AES-128-CTR under the key/iv carried in the metadata info
//! ```
//!
//! The metadata info's zero pads double as the authentication check: a wrong
//! keyset key decrypts them to noise.

use crate::error::{CryptoError, Result, SceError, Stage};
use crate::header::{read_u32, read_u64};
use crate::keyset::KeyEntry;
use crate::pipeline::cipher;
use crate::pipeline::mac::{self, SECTION_DIGEST_SIZE, SECTION_HMAC_KEY_SIZE};
use crate::signature::ALGORITHM_ECDSA_SHA1;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const METADATA_INFO_SIZE: usize = 0x40;
pub const METADATA_HEADER_SIZE: usize = 0x20;
pub const SECTION_HEADER_SIZE: usize = 0x30;
pub const KEY_SLOT_SIZE: usize = 0x10;

/// Key slots per section: digest (2), HMAC key (4), AES key, AES IV
pub const KEY_SLOTS_PER_SECTION: u32 = 8;
const DIGEST_SLOTS: u32 = 2;
const HMAC_KEY_SLOTS: u32 = 4;

pub const OPT_HEADER_CAPABILITY_FLAGS: u32 = 1;
pub const OPT_HEADER_INDIVIDUALS_SEED: u32 = 2;
pub const CAPABILITY_FLAGS_SIZE: usize = 0x20;
pub const INDIVIDUALS_SEED_SIZE: usize = 0x100;
const OPT_HEADER_PREFIX: usize = 0x10;

const HASHED_YES: u32 = 2;
const HASHED_NO: u32 = 1;
const ENCRYPTED_YES: u32 = 3;
const ENCRYPTED_NO: u32 = 1;
const COMPRESSED_YES: u32 = 2;
const COMPRESSED_NO: u32 = 1;
const NO_KEY: u32 = 0xFFFF_FFFF;

pub type KeySlot = [u8; KEY_SLOT_SIZE];

/// How fresh metadata and section keys are produced on encode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyMaterialPolicy {
    /// HMAC-derived from the keyset key and the container's own attributes;
    /// identical inputs give identical containers
    #[default]
    Derived,
    /// Operating system randomness
    Random,
}

impl std::str::FromStr for KeyMaterialPolicy {
    type Err = SceError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "derived" | "deterministic" => Ok(Self::Derived),
            "random" => Ok(Self::Random),
            _ => Err(SceError::InvalidArgument(format!("key material policy: {}", s))),
        }
    }
}

/// Level-2 key and IV, itself protected by level 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataInfo {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl MetadataInfo {
    /// Layout: [key: 16][zero: 16][iv: 16][zero: 16]
    pub fn to_bytes(&self) -> [u8; METADATA_INFO_SIZE] {
        let mut buf = [0u8; METADATA_INFO_SIZE];
        buf[0x00..0x10].copy_from_slice(&self.key);
        buf[0x20..0x30].copy_from_slice(&self.iv);
        buf
    }

    /// Parse a decrypted info block; non-zero pads mean the key was wrong
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != METADATA_INFO_SIZE {
            return Err(SceError::format(
                Stage::MetadataInfo,
                format!("need {} bytes, got {}", METADATA_INFO_SIZE, bytes.len()),
            ));
        }
        let pads_clear = bytes[0x10..0x20].iter().chain(&bytes[0x30..0x40]).all(|b| *b == 0);
        if !pads_clear {
            return Err(CryptoError::AuthenticationFailed {
                stage: Stage::MetadataInfo,
            }
            .into());
        }
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&bytes[0x00..0x10]);
        iv.copy_from_slice(&bytes[0x20..0x30]);
        Ok(Self { key, iv })
    }

    /// Fresh level-2 material. `seed` binds derived material to the
    /// container being built.
    pub fn generate(policy: KeyMaterialPolicy, entry: &KeyEntry, seed: &[u8]) -> Self {
        let mut info = Self {
            key: [0u8; 16],
            iv: [0u8; 16],
        };
        match policy {
            KeyMaterialPolicy::Derived => {
                let okm = mac::derive(&entry.erk, "metadata-info", &[entry.riv.as_slice(), seed]);
                info.key.copy_from_slice(&okm[..16]);
                info.iv.copy_from_slice(&okm[16..]);
            }
            KeyMaterialPolicy::Random => {
                OsRng.fill_bytes(&mut info.key);
                OsRng.fill_bytes(&mut info.iv);
            }
        }
        info
    }
}

/// Level 1: seal the info under the keyset erk/riv
pub fn seal_info(info: &MetadataInfo, entry: &KeyEntry) -> Result<[u8; METADATA_INFO_SIZE]> {
    let ct = cipher::aes256_cbc_encrypt(&entry.erk, &entry.riv, &info.to_bytes())?;
    let mut out = [0u8; METADATA_INFO_SIZE];
    out.copy_from_slice(&ct);
    Ok(out)
}

/// Level 1: open the info with the keyset erk/riv
pub fn open_info(ciphertext: &[u8], entry: &KeyEntry) -> Result<MetadataInfo> {
    if ciphertext.len() < METADATA_INFO_SIZE {
        return Err(SceError::format(Stage::MetadataInfo, "truncated metadata info"));
    }
    let plain = cipher::aes256_cbc_decrypt(
        &entry.erk,
        &entry.riv,
        &ciphertext[..METADATA_INFO_SIZE],
    )?;
    MetadataInfo::from_bytes(&plain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Length of the signed range
    pub sig_input_length: u64,
    pub signature_algorithm: u32,
    pub section_count: u32,
    pub key_count: u32,
    pub opt_header_size: u32,
}

impl MetadataHeader {
    pub fn to_bytes(&self) -> [u8; METADATA_HEADER_SIZE] {
        let mut buf = [0u8; METADATA_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.sig_input_length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.signature_algorithm.to_be_bytes());
        buf[12..16].copy_from_slice(&self.section_count.to_be_bytes());
        buf[16..20].copy_from_slice(&self.key_count.to_be_bytes());
        buf[20..24].copy_from_slice(&self.opt_header_size.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            sig_input_length: read_u64(bytes, 0),
            signature_algorithm: read_u32(bytes, 8),
            section_count: read_u32(bytes, 12),
            key_count: read_u32(bytes, 16),
            opt_header_size: read_u32(bytes, 20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionType {
    SectionHeaders,
    Segment,
    Version,
}

impl SectionType {
    pub fn to_u32(self) -> u32 {
        match self {
            SectionType::SectionHeaders => 1,
            SectionType::Segment => 2,
            SectionType::Version => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(SectionType::SectionHeaders),
            2 => Some(SectionType::Segment),
            3 => Some(SectionType::Version),
            _ => None,
        }
    }
}

/// One independently protected payload region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// Absolute offset of the stored bytes in the container
    pub offset: u64,
    /// Stored length, after compression
    pub data_size: u64,
    /// Length before compression; not on the wire, filled in by whoever
    /// knows it (the restated segment table or the decompressor)
    pub uncompressed_len: u64,
    pub section_type: SectionType,
    /// Program header index for segments, chunk number for raw payloads
    pub index: u32,
    pub hashed: bool,
    pub digest_index: u32,
    pub encrypted: bool,
    pub key_index: u32,
    pub iv_index: u32,
    pub compressed: bool,
    /// Integrity digest, kept in the key table
    pub digest: [u8; SECTION_DIGEST_SIZE],
}

impl SectionDescriptor {
    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut buf = [0u8; SECTION_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.data_size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.section_type.to_u32().to_be_bytes());
        buf[20..24].copy_from_slice(&self.index.to_be_bytes());
        buf[24..28].copy_from_slice(&flag(self.hashed, HASHED_YES, HASHED_NO).to_be_bytes());
        buf[28..32].copy_from_slice(&self.digest_index.to_be_bytes());
        buf[32..36]
            .copy_from_slice(&flag(self.encrypted, ENCRYPTED_YES, ENCRYPTED_NO).to_be_bytes());
        let (key_index, iv_index) = if self.encrypted {
            (self.key_index, self.iv_index)
        } else {
            (NO_KEY, NO_KEY)
        };
        buf[36..40].copy_from_slice(&key_index.to_be_bytes());
        buf[40..44].copy_from_slice(&iv_index.to_be_bytes());
        buf[44..48]
            .copy_from_slice(&flag(self.compressed, COMPRESSED_YES, COMPRESSED_NO).to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw_type = read_u32(bytes, 16);
        let section_type = SectionType::from_u32(raw_type).ok_or_else(|| {
            SceError::format(Stage::Metadata, format!("unknown section type {}", raw_type))
        })?;
        Ok(Self {
            offset: read_u64(bytes, 0),
            data_size: read_u64(bytes, 8),
            uncompressed_len: 0,
            section_type,
            index: read_u32(bytes, 20),
            hashed: read_u32(bytes, 24) == HASHED_YES,
            digest_index: read_u32(bytes, 28),
            encrypted: read_u32(bytes, 32) == ENCRYPTED_YES,
            key_index: read_u32(bytes, 36),
            iv_index: read_u32(bytes, 40),
            compressed: read_u32(bytes, 44) == COMPRESSED_YES,
            digest: [0u8; SECTION_DIGEST_SIZE],
        })
    }

    /// `None` when offset plus size does not fit in 64 bits
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.data_size)
    }
}

fn flag(value: bool, yes: u32, no: u32) -> u32 {
    if value {
        yes
    } else {
        no
    }
}

/// Key material for one section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionKeys {
    pub hmac_key: [u8; SECTION_HMAC_KEY_SIZE],
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl SectionKeys {
    /// Fresh keys for the section at `position`, independent of every other
    /// section so sections can be processed in any order.
    pub fn generate(policy: KeyMaterialPolicy, info: &MetadataInfo, position: u32) -> Self {
        let mut keys = Self {
            hmac_key: [0u8; SECTION_HMAC_KEY_SIZE],
            key: [0u8; 16],
            iv: [0u8; 16],
        };
        match policy {
            KeyMaterialPolicy::Derived => {
                let pos = position.to_be_bytes();
                let lo = mac::derive(&info.key, "section-hmac-lo", &[&pos[..], &info.iv[..]]);
                let hi = mac::derive(&info.key, "section-hmac-hi", &[&pos[..], &info.iv[..]]);
                keys.hmac_key[..32].copy_from_slice(&lo);
                keys.hmac_key[32..].copy_from_slice(&hi);
                let key = mac::derive(&info.key, "section-key", &[&pos[..], &info.iv[..]]);
                keys.key.copy_from_slice(&key[..16]);
                let iv = mac::derive(&info.iv, "section-iv", &[&pos[..], &info.key[..]]);
                keys.iv.copy_from_slice(&iv[..16]);
            }
            KeyMaterialPolicy::Random => {
                OsRng.fill_bytes(&mut keys.hmac_key);
                OsRng.fill_bytes(&mut keys.key);
                OsRng.fill_bytes(&mut keys.iv);
            }
        }
        keys
    }
}

/// Control blocks carried inside the encrypted metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionalHeader {
    CapabilityFlags([u8; CAPABILITY_FLAGS_SIZE]),
    IndividualsSeed(Vec<u8>),
    Unknown { kind: u32, data: Vec<u8> },
}

impl OptionalHeader {
    pub fn kind(&self) -> u32 {
        match self {
            OptionalHeader::CapabilityFlags(_) => OPT_HEADER_CAPABILITY_FLAGS,
            OptionalHeader::IndividualsSeed(_) => OPT_HEADER_INDIVIDUALS_SEED,
            OptionalHeader::Unknown { kind, .. } => *kind,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            OptionalHeader::CapabilityFlags(flags) => flags.as_slice(),
            OptionalHeader::IndividualsSeed(seed) => seed.as_slice(),
            OptionalHeader::Unknown { data, .. } => data.as_slice(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        OPT_HEADER_PREFIX + self.payload().len()
    }

    /// Layout: [type: 4][size: 4][next: 8][payload]
    fn write(&self, out: &mut Vec<u8>, more: bool) {
        out.extend_from_slice(&self.kind().to_be_bytes());
        out.extend_from_slice(&(self.encoded_len() as u32).to_be_bytes());
        out.extend_from_slice(&u64::from(more).to_be_bytes());
        out.extend_from_slice(self.payload());
    }

    fn parse_all(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut headers = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + OPT_HEADER_PREFIX > bytes.len() {
                return Err(SceError::format(Stage::Metadata, "truncated optional header"));
            }
            let kind = read_u32(bytes, pos);
            let size = read_u32(bytes, pos + 4) as usize;
            let more = read_u64(bytes, pos + 8) != 0;
            if size < OPT_HEADER_PREFIX || pos + size > bytes.len() {
                return Err(SceError::format(
                    Stage::Metadata,
                    format!("optional header type {} has bad size {}", kind, size),
                ));
            }
            let payload = &bytes[pos + OPT_HEADER_PREFIX..pos + size];
            headers.push(match kind {
                OPT_HEADER_CAPABILITY_FLAGS if payload.len() == CAPABILITY_FLAGS_SIZE => {
                    let mut flags = [0u8; CAPABILITY_FLAGS_SIZE];
                    flags.copy_from_slice(payload);
                    OptionalHeader::CapabilityFlags(flags)
                }
                OPT_HEADER_INDIVIDUALS_SEED => OptionalHeader::IndividualsSeed(payload.to_vec()),
                _ => OptionalHeader::Unknown {
                    kind,
                    data: payload.to_vec(),
                },
            });
            pos += size;
            if !more {
                break;
            }
        }
        Ok(headers)
    }
}

/// Decrypted metadata block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub info: MetadataInfo,
    pub header: MetadataHeader,
    pub sections: Vec<SectionDescriptor>,
    pub keys: Vec<KeySlot>,
    pub optional_headers: Vec<OptionalHeader>,
}

impl Metadata {
    /// Assemble metadata for sealed sections. Key slots are laid out eight
    /// per section in descriptor order; `descriptors[i]` pairs with `keys[i]`.
    pub fn assemble(
        info: MetadataInfo,
        mut descriptors: Vec<SectionDescriptor>,
        keys: &[SectionKeys],
        optional_headers: Vec<OptionalHeader>,
    ) -> Self {
        let mut slots = Vec::with_capacity(descriptors.len() * KEY_SLOTS_PER_SECTION as usize);
        for (position, (descriptor, section_keys)) in descriptors.iter_mut().zip(keys).enumerate() {
            let base = position as u32 * KEY_SLOTS_PER_SECTION;
            descriptor.digest_index = base;
            descriptor.key_index = base + DIGEST_SLOTS + HMAC_KEY_SLOTS;
            descriptor.iv_index = descriptor.key_index + 1;

            let mut digest_slots = [0u8; DIGEST_SLOTS as usize * KEY_SLOT_SIZE];
            digest_slots[..SECTION_DIGEST_SIZE].copy_from_slice(&descriptor.digest);
            push_slots(&mut slots, &digest_slots);
            push_slots(&mut slots, &section_keys.hmac_key);
            slots.push(section_keys.key);
            slots.push(section_keys.iv);
        }

        let opt_header_size = optional_headers.iter().map(|h| h.encoded_len()).sum::<usize>();
        let header = MetadataHeader {
            sig_input_length: 0,
            signature_algorithm: ALGORITHM_ECDSA_SHA1,
            section_count: descriptors.len() as u32,
            key_count: slots.len() as u32,
            opt_header_size: opt_header_size as u32,
        };

        Self {
            info,
            header,
            sections: descriptors,
            keys: slots,
            optional_headers,
        }
    }

    /// Length of info plus body
    pub fn encoded_len(&self) -> usize {
        METADATA_INFO_SIZE + self.body_len()
    }

    fn body_len(&self) -> usize {
        METADATA_HEADER_SIZE
            + self.sections.len() * SECTION_HEADER_SIZE
            + self.keys.len() * KEY_SLOT_SIZE
            + self.header.opt_header_size as usize
    }

    /// Plaintext level-2 body
    pub fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body_len());
        out.extend_from_slice(&self.header.to_bytes());
        for section in &self.sections {
            out.extend_from_slice(&section.to_bytes());
        }
        for slot in &self.keys {
            out.extend_from_slice(slot);
        }
        let count = self.optional_headers.len();
        for (i, header) in self.optional_headers.iter().enumerate() {
            header.write(&mut out, i + 1 < count);
        }
        out
    }

    /// Parse a decrypted level-2 body and attach the digests from the key table
    pub fn parse_body(info: MetadataInfo, body: &[u8]) -> Result<Self> {
        if body.len() < METADATA_HEADER_SIZE {
            return Err(SceError::format(Stage::Metadata, "truncated metadata header"));
        }
        let header = MetadataHeader::from_bytes(body);
        if header.signature_algorithm != ALGORITHM_ECDSA_SHA1 {
            return Err(SceError::format(
                Stage::Metadata,
                format!("unknown signature algorithm {}", header.signature_algorithm),
            ));
        }

        let sections_len = header.section_count as usize * SECTION_HEADER_SIZE;
        let keys_len = header.key_count as usize * KEY_SLOT_SIZE;
        let needed = METADATA_HEADER_SIZE as u64
            + sections_len as u64
            + keys_len as u64
            + header.opt_header_size as u64;
        if needed > body.len() as u64 {
            return Err(SceError::format(
                Stage::Metadata,
                format!(
                    "{} sections, {} keys and {} optional bytes exceed the {}-byte block",
                    header.section_count,
                    header.key_count,
                    header.opt_header_size,
                    body.len()
                ),
            ));
        }

        let mut pos = METADATA_HEADER_SIZE;
        let mut sections = Vec::with_capacity(header.section_count as usize);
        for _ in 0..header.section_count {
            sections.push(SectionDescriptor::from_bytes(&body[pos..pos + SECTION_HEADER_SIZE])?);
            pos += SECTION_HEADER_SIZE;
        }

        let keys: Vec<KeySlot> = body[pos..pos + keys_len]
            .chunks_exact(KEY_SLOT_SIZE)
            .map(|chunk| {
                let mut slot = [0u8; KEY_SLOT_SIZE];
                slot.copy_from_slice(chunk);
                slot
            })
            .collect();
        pos += keys_len;

        let optional_headers =
            OptionalHeader::parse_all(&body[pos..pos + header.opt_header_size as usize])?;

        let mut metadata = Self {
            info,
            header,
            sections,
            keys,
            optional_headers,
        };
        for i in 0..metadata.sections.len() {
            metadata.check_key_indices(&metadata.sections[i])?;
            if metadata.sections[i].hashed {
                let digest = metadata.digest_for(&metadata.sections[i]);
                metadata.sections[i].digest = digest;
            }
        }
        Ok(metadata)
    }

    fn check_key_indices(&self, section: &SectionDescriptor) -> Result<()> {
        let count = self.keys.len() as u64;
        let in_range = |first: u32, slots: u32| first as u64 + slots as u64 <= count;
        if section.hashed && !in_range(section.digest_index, DIGEST_SLOTS + HMAC_KEY_SLOTS) {
            return Err(SceError::format(
                Stage::Metadata,
                format!("section {} digest index {} out of range", section.index, section.digest_index),
            ));
        }
        if section.encrypted && !(in_range(section.key_index, 1) && in_range(section.iv_index, 1)) {
            return Err(SceError::format(
                Stage::Metadata,
                format!(
                    "section {} key/iv index {}/{} out of range",
                    section.index, section.key_index, section.iv_index
                ),
            ));
        }
        Ok(())
    }

    fn digest_for(&self, section: &SectionDescriptor) -> [u8; SECTION_DIGEST_SIZE] {
        let start = section.digest_index as usize;
        let mut digest = [0u8; SECTION_DIGEST_SIZE];
        digest[..16].copy_from_slice(&self.keys[start]);
        digest[16..].copy_from_slice(&self.keys[start + 1][..4]);
        digest
    }

    /// Key material for a parsed section
    pub fn section_keys(&self, section: &SectionDescriptor) -> Result<SectionKeys> {
        self.check_key_indices(section)?;
        let mut keys = SectionKeys {
            hmac_key: [0u8; SECTION_HMAC_KEY_SIZE],
            key: [0u8; 16],
            iv: [0u8; 16],
        };
        if section.hashed {
            let first = (section.digest_index + DIGEST_SLOTS) as usize;
            for (i, slot) in self.keys[first..first + HMAC_KEY_SLOTS as usize].iter().enumerate() {
                keys.hmac_key[i * KEY_SLOT_SIZE..(i + 1) * KEY_SLOT_SIZE].copy_from_slice(slot);
            }
        }
        if section.encrypted {
            keys.key = self.keys[section.key_index as usize];
            keys.iv = self.keys[section.iv_index as usize];
        }
        Ok(keys)
    }

    pub fn capability_flags(&self) -> Option<&[u8; CAPABILITY_FLAGS_SIZE]> {
        self.optional_headers.iter().find_map(|h| match h {
            OptionalHeader::CapabilityFlags(flags) => Some(flags),
            _ => None,
        })
    }

    pub fn individuals_seed(&self) -> Option<&[u8]> {
        self.optional_headers.iter().find_map(|h| match h {
            OptionalHeader::IndividualsSeed(seed) => Some(seed.as_slice()),
            _ => None,
        })
    }

    /// Every section must sit inside `[start, end)` and no two may overlap
    pub fn check_layout(&self, start: u64, end: u64) -> Result<()> {
        let mut ranges = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            match section.end() {
                Some(section_end) if section.offset >= start && section_end <= end => {
                    ranges.push((section.offset, section_end, section.index))
                }
                _ => {
                    return Err(SceError::format(
                        Stage::Section,
                        format!(
                            "section {} at 0x{:x}+0x{:x} outside the payload region",
                            section.index, section.offset, section.data_size
                        ),
                    ))
                }
            }
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            let ((_, prev_end, prev), (next_start, _, next)) = (pair[0], pair[1]);
            if next_start < prev_end {
                return Err(SceError::format(
                    Stage::Metadata,
                    format!("sections {} and {} overlap at 0x{:x}", prev, next, next_start),
                ));
            }
        }
        Ok(())
    }
}

fn push_slots(slots: &mut Vec<KeySlot>, bytes: &[u8]) {
    for chunk in bytes.chunks_exact(KEY_SLOT_SIZE) {
        let mut slot = [0u8; KEY_SLOT_SIZE];
        slot.copy_from_slice(chunk);
        slots.push(slot);
    }
}

/// Level-2 encryption of the body; the info is returned sealed by level 1
pub fn encrypt_metadata(metadata: &Metadata, entry: &KeyEntry) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(metadata.encoded_len());
    out.extend_from_slice(&seal_info(&metadata.info, entry)?);
    out.extend_from_slice(&encrypt_body(metadata)?);
    Ok(out)
}

/// Level-2 ciphertext of the body alone
pub fn encrypt_body(metadata: &Metadata) -> Result<Vec<u8>> {
    cipher::aes128_ctr(&metadata.info.key, &metadata.info.iv, &metadata.body_bytes())
}

/// Decrypt a metadata block (info followed by body) with the keyset entry
pub fn decrypt_metadata(block: &[u8], entry: &KeyEntry) -> Result<Metadata> {
    let info = open_info(block, entry)?;
    decrypt_metadata_with_info(block, info)
}

/// Decrypt the body with an already opened (or caller supplied) info
pub fn decrypt_metadata_with_info(block: &[u8], info: MetadataInfo) -> Result<Metadata> {
    if block.len() < METADATA_INFO_SIZE + METADATA_HEADER_SIZE {
        return Err(SceError::format(Stage::Metadata, "metadata block too short"));
    }
    let body = cipher::aes128_ctr(&info.key, &info.iv, &block[METADATA_INFO_SIZE..])?;
    Metadata::parse_body(info, &body)
}
