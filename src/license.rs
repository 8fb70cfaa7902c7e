//! DRM license layer for NPDRM loadable images.
//!
//! The license block follows the main signature and carries its own
//! signature, made with the `NP_sig` key over the main signature and the
//! block body. It binds a content id and filename to an externally supplied
//! license key (the klicensee):
//!
//! ```text
//! filename_hash = CMAC(NP_tid, content_id || real_filename)
//! bound_key     = CMAC(klicensee ^ NP_ci, block[0x00..0x60])
//! np_key        = AES-128-ECB-decrypt(NP_klic_key, klicensee)
//! ```
//!
//! `np_key` adds a third encryption level (AES-128-CBC, zero IV) over the
//! already sealed metadata info.

use crate::error::{IntegrityError, LicenseError, Result, SceError, Stage};
use crate::header::{read_u32, read_u64, LicenseType, NpAppType, SIGNATURE_SIZE};
use crate::keyset::{KeyEntry, Registry, NP_CI, NP_KLIC_FREE, NP_KLIC_KEY, NP_SIG, NP_TID};
use crate::metadata::METADATA_INFO_SIZE;
use crate::pipeline::cipher;
use crate::signature::{self, Signature};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

pub const LICENSE_BLOCK_SIZE: usize = 0xC0;
/// License block plus its signature
pub const LICENSE_TRAILER_SIZE: usize = LICENSE_BLOCK_SIZE + SIGNATURE_SIZE;
pub const CONTENT_ID_SIZE: usize = 0x30;
pub const REAL_FILENAME_SIZE: usize = 0x40;
pub const KLICENSEE_SIZE: usize = 16;

const LICENSE_MAGIC: [u8; 4] = *b"NPD\0";
const LICENSE_VERSION: u32 = 3;
const BOUND_RANGE: usize = 0x60;

pub type Klicensee = [u8; KLICENSEE_SIZE];

/// Caller-chosen license attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseParams {
    pub license_type: LicenseType,
    pub app_type: NpAppType,
    pub content_id: String,
    /// Name the content is installed under; defaults to the output filename
    pub real_filename: String,
    #[serde(default)]
    pub limited_start: u64,
    #[serde(default)]
    pub limited_end: u64,
}

impl Default for LicenseParams {
    fn default() -> Self {
        Self {
            license_type: LicenseType::Free,
            app_type: NpAppType::Exec,
            content_id: String::new(),
            real_filename: "EBOOT.BIN".into(),
            limited_start: 0,
            limited_end: 0,
        }
    }
}

impl LicenseParams {
    pub fn validate(&self) -> Result<()> {
        if self.content_id.is_empty() {
            return Err(LicenseError::InvalidParameter("content id is empty".into()).into());
        }
        if self.content_id.len() > CONTENT_ID_SIZE {
            return Err(LicenseError::InvalidParameter(format!(
                "content id is {} bytes, at most {}",
                self.content_id.len(),
                CONTENT_ID_SIZE
            ))
            .into());
        }
        if self.real_filename.is_empty() || self.real_filename.len() > REAL_FILENAME_SIZE {
            return Err(LicenseError::InvalidParameter(format!(
                "real filename must be 1..={} bytes",
                REAL_FILENAME_SIZE
            ))
            .into());
        }
        Ok(())
    }
}

/// License attributes recovered by decode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseInfo {
    pub license_type: LicenseType,
    pub app_type: NpAppType,
    pub content_id: String,
    pub real_filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseBlock {
    pub license_type: LicenseType,
    pub app_type: NpAppType,
    pub content_id: [u8; CONTENT_ID_SIZE],
    pub digest: [u8; 16],
    pub filename_hash: [u8; 16],
    pub bound_key: [u8; 16],
    pub limited_start: u64,
    pub limited_end: u64,
    pub real_filename: [u8; REAL_FILENAME_SIZE],
}

fn fixed<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn trimmed(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

impl LicenseBlock {
    pub fn to_bytes(&self) -> [u8; LICENSE_BLOCK_SIZE] {
        let mut buf = [0u8; LICENSE_BLOCK_SIZE];
        buf[0x00..0x04].copy_from_slice(&LICENSE_MAGIC);
        buf[0x04..0x08].copy_from_slice(&LICENSE_VERSION.to_be_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.license_type.to_u32().to_be_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.app_type.to_u32().to_be_bytes());
        buf[0x10..0x40].copy_from_slice(&self.content_id);
        buf[0x40..0x50].copy_from_slice(&self.digest);
        buf[0x50..0x60].copy_from_slice(&self.filename_hash);
        buf[0x60..0x70].copy_from_slice(&self.bound_key);
        buf[0x70..0x78].copy_from_slice(&self.limited_start.to_be_bytes());
        buf[0x78..0x80].copy_from_slice(&self.limited_end.to_be_bytes());
        buf[0x80..0xC0].copy_from_slice(&self.real_filename);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LICENSE_BLOCK_SIZE {
            return Err(SceError::format(
                Stage::License,
                format!("need {} bytes, got {}", LICENSE_BLOCK_SIZE, bytes.len()),
            ));
        }
        if bytes[0..4] != LICENSE_MAGIC {
            return Err(SceError::format(Stage::License, "bad license magic"));
        }
        let version = read_u32(bytes, 0x04);
        if version != LICENSE_VERSION {
            return Err(SceError::format(
                Stage::License,
                format!("unsupported license version {}", version),
            ));
        }
        let raw_license = read_u32(bytes, 0x08);
        let license_type = LicenseType::from_u32(raw_license).ok_or_else(|| {
            SceError::format(Stage::License, format!("unknown license type {}", raw_license))
        })?;
        let raw_app = read_u32(bytes, 0x0C);
        let app_type = NpAppType::from_u32(raw_app).ok_or_else(|| {
            SceError::format(Stage::License, format!("unknown application type 0x{:x}", raw_app))
        })?;

        let mut block = Self {
            license_type,
            app_type,
            content_id: [0u8; CONTENT_ID_SIZE],
            digest: [0u8; 16],
            filename_hash: [0u8; 16],
            bound_key: [0u8; 16],
            limited_start: read_u64(bytes, 0x70),
            limited_end: read_u64(bytes, 0x78),
            real_filename: [0u8; REAL_FILENAME_SIZE],
        };
        block.content_id.copy_from_slice(&bytes[0x10..0x40]);
        block.digest.copy_from_slice(&bytes[0x40..0x50]);
        block.filename_hash.copy_from_slice(&bytes[0x50..0x60]);
        block.bound_key.copy_from_slice(&bytes[0x60..0x70]);
        block.real_filename.copy_from_slice(&bytes[0x80..0xC0]);
        Ok(block)
    }

    pub fn content_id(&self) -> String {
        String::from_utf8_lossy(trimmed(&self.content_id)).into_owned()
    }

    pub fn real_filename(&self) -> String {
        String::from_utf8_lossy(trimmed(&self.real_filename)).into_owned()
    }

    pub fn info(&self) -> LicenseInfo {
        LicenseInfo {
            license_type: self.license_type,
            app_type: self.app_type,
            content_id: self.content_id(),
            real_filename: self.real_filename(),
        }
    }
}

/// Auxiliary NP keys, resolved once from the registry
#[derive(Debug, Clone)]
pub struct LicenseWrapper {
    klic_free: Option<Klicensee>,
    klic_key: [u8; 16],
    ci: [u8; 16],
    tid: [u8; 16],
    sig: KeyEntry,
}

impl LicenseWrapper {
    pub fn from_registry(registry: &Registry) -> Result<Self> {
        Ok(Self {
            klic_free: registry.named(NP_KLIC_FREE).and_then(|e| e.key128()).ok(),
            klic_key: registry.named(NP_KLIC_KEY)?.key128()?,
            ci: registry.named(NP_CI)?.key128()?,
            tid: registry.named(NP_TID)?.key128()?,
            sig: registry.named(NP_SIG)?,
        })
    }

    /// License key for `license_type`. Free content falls back to the
    /// registry's shared key; the other types need the caller's.
    pub fn klicensee(&self, license_type: LicenseType, supplied: Option<Klicensee>) -> Result<Klicensee> {
        match (supplied, license_type) {
            (Some(key), _) => Ok(key),
            (None, LicenseType::Free) => self
                .klic_free
                .ok_or_else(|| SceError::KeyNotFound(NP_KLIC_FREE.to_string())),
            (None, other) => Err(LicenseError::MissingLicenseKey(format!("{:?}", other)).into()),
        }
    }

    fn filename_hash(&self, content_id: &[u8], real_filename: &[u8]) -> Result<[u8; 16]> {
        cipher::cmac_aes128(&self.tid, &[content_id, trimmed(real_filename)])
    }

    /// klicensee ^ NP_ci
    fn binding_key(&self, klicensee: &Klicensee) -> [u8; 16] {
        let mut key = [0u8; 16];
        for (out, (k, c)) in key.iter_mut().zip(klicensee.iter().zip(self.ci.iter())) {
            *out = k ^ c;
        }
        key
    }

    fn bound_key(&self, klicensee: &Klicensee, block: &LicenseBlock) -> Result<[u8; 16]> {
        cipher::cmac_aes128(&self.binding_key(klicensee), &[&block.to_bytes()[..BOUND_RANGE]])
    }

    /// Build a license block binding `params` to `klicensee`. `payload`
    /// feeds the block's content digest.
    pub fn wrap(&self, params: &LicenseParams, klicensee: &Klicensee, payload: &[u8]) -> Result<LicenseBlock> {
        params.validate()?;
        let digest = Sha1::digest(payload);
        let mut block = LicenseBlock {
            license_type: params.license_type,
            app_type: params.app_type,
            content_id: fixed(&params.content_id),
            digest: [0u8; 16],
            filename_hash: [0u8; 16],
            bound_key: [0u8; 16],
            limited_start: params.limited_start,
            limited_end: params.limited_end,
            real_filename: fixed(&params.real_filename),
        };
        block.digest.copy_from_slice(&digest[..16]);
        block.filename_hash = self.filename_hash(&block.content_id, &block.real_filename)?;
        block.bound_key = self.bound_key(klicensee, &block)?;
        debug!(content_id = %params.content_id, license_type = ?params.license_type, "license wrapped");
        Ok(block)
    }

    /// Check the block against `klicensee` and return the content id
    pub fn unwrap(&self, block: &LicenseBlock, klicensee: &Klicensee) -> Result<String> {
        let filename_parts = [&block.content_id[..], trimmed(&block.real_filename)];
        if !cipher::cmac_aes128_verify(&self.tid, &filename_parts, &block.filename_hash)? {
            return Err(LicenseError::FilenameMismatch.into());
        }
        let bound = block.to_bytes();
        if !cipher::cmac_aes128_verify(
            &self.binding_key(klicensee),
            &[&bound[..BOUND_RANGE]],
            &block.bound_key,
        )? {
            return Err(LicenseError::KeyMismatch.into());
        }
        Ok(block.content_id())
    }

    fn np_key(&self, klicensee: &Klicensee) -> Result<[u8; 16]> {
        cipher::aes128_ecb_decrypt_block(&self.klic_key, klicensee)
    }

    /// Third level over an already sealed metadata info
    pub fn seal_info(&self, sealed: &[u8], klicensee: &Klicensee) -> Result<Vec<u8>> {
        check_info_len(sealed)?;
        cipher::aes128_cbc_encrypt(&self.np_key(klicensee)?, &[0u8; 16], sealed)
    }

    pub fn open_info(&self, wrapped: &[u8], klicensee: &Klicensee) -> Result<Vec<u8>> {
        check_info_len(wrapped)?;
        cipher::aes128_cbc_decrypt(&self.np_key(klicensee)?, &[0u8; 16], &wrapped[..METADATA_INFO_SIZE])
    }

    /// Sign the license block, chained to the main signature
    pub fn sign(&self, main_signature: &[u8], block: &LicenseBlock) -> Result<Signature> {
        signature::sign(&signed_range(main_signature, block), &self.sig)
    }

    pub fn verify(&self, main_signature: &[u8], block: &LicenseBlock, sig: &Signature) -> Result<()> {
        if signature::verify(&signed_range(main_signature, block), sig, &self.sig)? {
            Ok(())
        } else {
            Err(IntegrityError::LicenseSignatureInvalid.into())
        }
    }

    pub fn curve_id(&self) -> u8 {
        self.sig.curve_id
    }
}

fn check_info_len(bytes: &[u8]) -> Result<()> {
    if bytes.len() < METADATA_INFO_SIZE {
        return Err(SceError::format(Stage::MetadataInfo, "truncated metadata info"));
    }
    Ok(())
}

fn signed_range(main_signature: &[u8], block: &LicenseBlock) -> Vec<u8> {
    let mut range = Vec::with_capacity(main_signature.len() + LICENSE_BLOCK_SIZE);
    range.extend_from_slice(main_signature);
    range.extend_from_slice(&block.to_bytes());
    range
}
