//! Fixtures shared by unit and integration tests: a secp160r1 curve set, a
//! complete keyset and small big-endian ELF64 images.

use crate::curve::{Curve, LOADER_CURVE_COUNT, VSH_CURVE_COUNT};
use crate::header::{ContainerType, SelfType};
use crate::keyset::{
    KeyContext, KeyType, KeysetRecord, KeysetSource, Registry, NP_CI, NP_KLIC_FREE, NP_KLIC_KEY,
    NP_SIG, NP_TID, PRIVATE_KEY_SIZE,
};
use crate::signature;
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::path::Path;

pub const LOADER_CURVE_ID: u8 = 0x14;
pub const VSH_CURVE_ID: u8 = 2;

pub const TEST_KLICENSEE: [u8; 16] = [
    0x72, 0xF9, 0x90, 0x78, 0x8F, 0x9C, 0xFF, 0x74, 0x57, 0x25, 0xF0, 0x8E, 0x4C, 0x12, 0x83,
    0x87,
];

pub const TEST_CONTENT_ID: &str = "UP0001-TEST00000_00-0000111122223333";

pub fn secp160r1() -> Curve {
    Curve {
        p: big("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF7FFFFFFF"),
        a: big("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF7FFFFFFC"),
        b: big("1C97BEFC54BD7A8B65ACF89F81D4D4ADC565FA45"),
        n: big("0100000000000000000001F4C8F927AED3CA752257"),
        gx: big("4A96B5688EF573284664698968C38BB913CBFC82"),
        gy: big("23A628553168947D59DCC912042351377AC5FB32"),
    }
}

fn big(hex: &str) -> BigUint {
    BigUint::parse_bytes(hex.as_bytes(), 16).expect("valid curve constant")
}

fn material(label: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

/// 160-bit scalar, always below the secp160r1 order
pub fn private_key(label: &str) -> [u8; PRIVATE_KEY_SIZE] {
    let mut key = [0u8; PRIVATE_KEY_SIZE];
    key[1..].copy_from_slice(&material(label, 20));
    key[1] |= 0x01;
    key
}

fn signing_record(
    name: &str,
    key_type: KeyType,
    revision: Option<u16>,
    self_type: Option<SelfType>,
    curve_id: u8,
) -> KeysetRecord {
    let private = private_key(name);
    let public = signature::public_key(&secp160r1(), &private).expect("fixture key on curve");
    KeysetRecord {
        name: name.into(),
        key_type,
        revision,
        self_type,
        app_type: None,
        vendor_id: None,
        auth_id: None,
        version_min: None,
        version_max: None,
        erk: hex::encode(material(&format!("{}-erk", name), 32)),
        riv: Some(hex::encode(material(&format!("{}-riv", name), 16))),
        public: Some(hex::encode(public)),
        private: Some(hex::encode(private)),
        ctype: curve_id,
    }
}

fn np_record(name: &str) -> KeysetRecord {
    KeysetRecord {
        name: name.into(),
        key_type: KeyType::Other,
        revision: None,
        self_type: None,
        app_type: None,
        vendor_id: None,
        auth_id: None,
        version_min: None,
        version_max: None,
        erk: hex::encode(material(name, 16)),
        riv: None,
        public: None,
        private: None,
        ctype: 0,
    }
}

pub fn keyset_records() -> Vec<KeysetRecord> {
    let app = Some(SelfType::App);
    let mut np_sig = signing_record(NP_SIG, KeyType::Other, None, None, VSH_CURVE_ID);
    np_sig.riv = None;
    np_sig.erk = hex::encode(material(NP_SIG, 16));

    vec![
        signing_record("app-rev0", KeyType::LoadableImage, Some(0), app, LOADER_CURVE_ID),
        signing_record("app-rev1", KeyType::LoadableImage, Some(1), app, LOADER_CURVE_ID),
        signing_record("app-any", KeyType::LoadableImage, None, app, LOADER_CURVE_ID),
        signing_record(
            "npdrm-any",
            KeyType::LoadableImage,
            None,
            Some(SelfType::Npdrm),
            LOADER_CURVE_ID,
        ),
        signing_record(
            "ldr-any",
            KeyType::LoadableImage,
            None,
            Some(SelfType::Ldr),
            LOADER_CURVE_ID,
        ),
        signing_record("rvk-rev0", KeyType::Rvk, Some(0), None, LOADER_CURVE_ID),
        signing_record("pkg-rev0", KeyType::Pkg, Some(0), None, LOADER_CURVE_ID),
        signing_record("spp-rev0", KeyType::Spp, Some(0), None, LOADER_CURVE_ID),
        np_record(NP_KLIC_FREE),
        np_record(NP_KLIC_KEY),
        np_record(NP_CI),
        np_record(NP_TID),
        np_sig,
    ]
}

pub fn loader_curve_table() -> Vec<u8> {
    secp160r1().to_record().repeat(LOADER_CURVE_COUNT)
}

pub fn vsh_curve_table() -> Vec<u8> {
    secp160r1().to_record().repeat(VSH_CURVE_COUNT)
}

pub fn keyset_source(records: &[KeysetRecord]) -> KeysetSource {
    KeysetSource {
        keys: serde_json::to_vec_pretty(records).expect("records serialize"),
        loader_curves: Some(loader_curve_table()),
        vsh_curves: Some(vsh_curve_table()),
    }
}

pub fn registry_from_records(records: &[KeysetRecord]) -> Registry {
    Registry::load(&keyset_source(records)).expect("fixture keyset loads")
}

pub fn registry() -> Registry {
    registry_from_records(&keyset_records())
}

/// Lay out `keys`, `ldr_curves` and `vsh_curves` in a data directory
pub fn write_data_dir(dir: &Path) -> std::io::Result<()> {
    let source = keyset_source(&keyset_records());
    std::fs::write(dir.join(KeysetSource::KEYS_FILE), &source.keys)?;
    std::fs::write(dir.join(KeysetSource::LOADER_CURVES_FILE), loader_curve_table())?;
    std::fs::write(dir.join(KeysetSource::VSH_CURVES_FILE), vsh_curve_table())?;
    Ok(())
}

pub fn app_context() -> KeyContext {
    KeyContext {
        container_type: ContainerType::LoadableImage,
        key_revision: 0,
        self_type: Some(SelfType::App),
        fw_version: Some(0x0003_0041_0000_0000),
        ..Default::default()
    }
}

/// One program header for `build_elf64`
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub p_type: u32,
    pub vaddr: u64,
    pub flags: u32,
    pub data: Vec<u8>,
    /// Extra zero-filled memory beyond the file image
    pub bss: u64,
}

impl SegmentSpec {
    pub fn load(vaddr: u64, flags: u32, data: Vec<u8>) -> Self {
        Self {
            p_type: PT_LOAD,
            vaddr,
            flags,
            data,
            bss: 0,
        }
    }
}

/// Big-endian PPC64 executable with the given program headers. Segment
/// payloads are packed 16-byte aligned after the program header table.
pub fn build_elf64(entry: u64, segments: &[SegmentSpec], with_section_headers: bool) -> Vec<u8> {
    const EHDR: usize = 0x40;
    const PHDR: usize = 0x38;
    const SHDR: usize = 0x40;

    let mut offsets = Vec::with_capacity(segments.len());
    let mut cursor = align16(EHDR + PHDR * segments.len());
    for segment in segments {
        offsets.push(cursor);
        cursor = align16(cursor + segment.data.len());
    }
    let shoff = if with_section_headers { cursor } else { 0 };
    let shnum: u16 = if with_section_headers { 2 } else { 0 };

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 2, 1, 0x66]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&21u16.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&entry.to_be_bytes());
    out.extend_from_slice(&(EHDR as u64).to_be_bytes());
    out.extend_from_slice(&(shoff as u64).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&(EHDR as u16).to_be_bytes());
    out.extend_from_slice(&(PHDR as u16).to_be_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_be_bytes());
    out.extend_from_slice(&(SHDR as u16).to_be_bytes());
    out.extend_from_slice(&shnum.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());

    for (segment, offset) in segments.iter().zip(&offsets) {
        let filesz = segment.data.len() as u64;
        out.extend_from_slice(&segment.p_type.to_be_bytes());
        out.extend_from_slice(&segment.flags.to_be_bytes());
        out.extend_from_slice(&(*offset as u64).to_be_bytes());
        out.extend_from_slice(&segment.vaddr.to_be_bytes());
        out.extend_from_slice(&segment.vaddr.to_be_bytes());
        out.extend_from_slice(&filesz.to_be_bytes());
        out.extend_from_slice(&(filesz + segment.bss).to_be_bytes());
        out.extend_from_slice(&0x10u64.to_be_bytes());
    }

    for (segment, offset) in segments.iter().zip(&offsets) {
        out.resize(*offset, 0);
        out.extend_from_slice(&segment.data);
    }

    if with_section_headers {
        out.resize(shoff, 0);
        out.extend_from_slice(&[0u8; SHDR]);
        let mut progbits = [0u8; SHDR];
        progbits[4..8].copy_from_slice(&1u32.to_be_bytes());
        if let (Some(first), Some(offset)) = (segments.first(), offsets.first()) {
            progbits[16..24].copy_from_slice(&first.vaddr.to_be_bytes());
            progbits[24..32].copy_from_slice(&(*offset as u64).to_be_bytes());
            progbits[32..40].copy_from_slice(&(first.data.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(&progbits);
    }

    out
}

/// Two loadable segments: patterned text and a compressible data segment
pub fn sample_elf() -> Vec<u8> {
    let text: Vec<u8> = (0..0x1800u32).map(|i| (i.wrapping_mul(31) ^ (i >> 3)) as u8).collect();
    let data = b"initialised data ".repeat(64);
    build_elf64(
        0x10200,
        &[
            SegmentSpec::load(0x10000, PF_R | PF_X, text),
            SegmentSpec::load(0x20000, PF_R | PF_W, data),
        ],
        true,
    )
}

fn align16(value: usize) -> usize {
    (value + 0xF) & !0xF
}
