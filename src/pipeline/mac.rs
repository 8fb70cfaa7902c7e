use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

pub const SECTION_DIGEST_SIZE: usize = 20;
pub const SECTION_HMAC_KEY_SIZE: usize = 64;

/// HMAC-SHA1 integrity digest over a stored section payload
pub fn section_digest(key: &[u8], data: &[u8]) -> [u8; SECTION_DIGEST_SIZE] {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of a section digest
pub fn verify_section_digest(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.verify_slice(expected).is_ok()
}

/// Domain-separated HMAC-SHA256 used to derive reproducible key material
pub fn derive(key: &[u8], label: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(label.as_bytes());
    mac.update(&[0u8]);
    for part in parts {
        mac.update(&(part.len() as u64).to_be_bytes());
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}
