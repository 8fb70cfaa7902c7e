//! ECDSA over SHA-1 on the 160-bit curves of the keyset registry.

use crate::curve::{inv_mod, write_be, Curve};
use crate::error::{CryptoError, Result, SceError, Stage};
use crate::header::SIGNATURE_SIZE;
use crate::keyset::{KeyEntry, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
use digest::Digest;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM_ECDSA_SHA1: u32 = 1;

/// Width of r and s on the wire
pub const SCALAR_SIZE: usize = 21;

const MAX_NONCE_ATTEMPTS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: u32,
    /// Curve the signature was made on; not stored on the wire, it comes
    /// from the key entry
    pub curve_id: u8,
    pub r: [u8; SCALAR_SIZE],
    pub s: [u8; SCALAR_SIZE],
}

impl Signature {
    /// Layout: [r: 21][s: 21][reserved: 6]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        let mut buf = [0u8; SIGNATURE_SIZE];
        buf[0..21].copy_from_slice(&self.r);
        buf[21..42].copy_from_slice(&self.s);
        buf
    }

    pub fn from_bytes(bytes: &[u8], curve_id: u8) -> Result<Self> {
        if bytes.len() < SIGNATURE_SIZE {
            return Err(SceError::format(
                Stage::Signature,
                format!("need {} bytes, got {}", SIGNATURE_SIZE, bytes.len()),
            ));
        }
        let mut r = [0u8; SCALAR_SIZE];
        let mut s = [0u8; SCALAR_SIZE];
        r.copy_from_slice(&bytes[0..21]);
        s.copy_from_slice(&bytes[21..42]);
        Ok(Self {
            algorithm: ALGORITHM_ECDSA_SHA1,
            curve_id,
            r,
            s,
        })
    }
}

/// Derive the 40-byte public key (x || y) for a private scalar
pub fn public_key(curve: &Curve, private: &[u8; PRIVATE_KEY_SIZE]) -> Result<[u8; PUBLIC_KEY_SIZE]> {
    let d = BigUint::from_bytes_be(private);
    if d.is_zero() || d >= curve.n {
        return Err(CryptoError::Cipher("private key out of range".into()).into());
    }
    let (x, y) = curve
        .mul(&d, &curve.generator())
        .ok_or_else(|| CryptoError::Cipher("public key is the point at infinity".into()))?;
    let mut out = [0u8; PUBLIC_KEY_SIZE];
    write_be(&mut out[0..20], &x);
    write_be(&mut out[20..40], &y);
    Ok(out)
}

/// Sign the byte range with the entry's private key
pub fn sign(range: &[u8], entry: &KeyEntry) -> Result<Signature> {
    let (curve, private) = match (&entry.curve, &entry.private) {
        (Some(curve), Some(private)) => (curve, private),
        _ => {
            return Err(SceError::KeyNotFound(format!(
                "{} has no private key or curve for signing",
                entry.name
            )))
        }
    };

    let d = BigUint::from_bytes_be(private);
    if d.is_zero() || d >= curve.n {
        return Err(CryptoError::Cipher(format!("{}: private key out of range", entry.name)).into());
    }

    let digest = Sha1::digest(range);
    let e = BigUint::from_bytes_be(&digest) % &curve.n;
    let n_minus_one = &curve.n - BigUint::one();

    for attempt in 0..MAX_NONCE_ATTEMPTS {
        let k = nonce(private, &digest, attempt, &n_minus_one);
        let (rx, _) = match curve.mul(&k, &curve.generator()) {
            Some(point) => point,
            None => continue,
        };
        let r = rx % &curve.n;
        if r.is_zero() {
            continue;
        }
        let s = (inv_mod(&k, &curve.n) * ((&e + &r * &d) % &curve.n)) % &curve.n;
        if s.is_zero() {
            continue;
        }

        let mut sig = Signature {
            algorithm: ALGORITHM_ECDSA_SHA1,
            curve_id: entry.curve_id,
            r: [0u8; SCALAR_SIZE],
            s: [0u8; SCALAR_SIZE],
        };
        write_be(&mut sig.r, &r);
        write_be(&mut sig.s, &s);
        return Ok(sig);
    }

    Err(CryptoError::Cipher("no usable nonce".into()).into())
}

/// Check a signature over the byte range. Fails only when the entry cannot
/// verify at all; a bad signature is `Ok(false)`.
pub fn verify(range: &[u8], signature: &Signature, entry: &KeyEntry) -> Result<bool> {
    let (curve, public) = match (&entry.curve, &entry.public) {
        (Some(curve), Some(public)) => (curve, public),
        _ => {
            return Err(SceError::KeyNotFound(format!(
                "{} has no public key or curve for verification",
                entry.name
            )))
        }
    };
    if signature.algorithm != ALGORITHM_ECDSA_SHA1 {
        return Ok(false);
    }

    let r = BigUint::from_bytes_be(&signature.r);
    let s = BigUint::from_bytes_be(&signature.s);
    if r.is_zero() || s.is_zero() || r >= curve.n || s >= curve.n {
        return Ok(false);
    }

    let q = Some((
        BigUint::from_bytes_be(&public[0..20]),
        BigUint::from_bytes_be(&public[20..40]),
    ));
    if !curve.is_on_curve(&q) {
        return Ok(false);
    }

    let e = BigUint::from_bytes_be(&Sha1::digest(range)) % &curve.n;
    let w = inv_mod(&s, &curve.n);
    let u1 = (&e * &w) % &curve.n;
    let u2 = (&r * &w) % &curve.n;

    let point = curve.add(
        &curve.mul(&u1, &curve.generator()),
        &curve.mul(&u2, &q),
    );
    Ok(match point {
        Some((x, _)) => x % &curve.n == r,
        None => false,
    })
}

/// Deterministic nonce in [1, n-1] from the private key and message digest
fn nonce(private: &[u8], digest: &[u8], attempt: u32, n_minus_one: &BigUint) -> BigUint {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(private)
        .expect("HMAC can take key of any size");
    mac.update(digest);
    mac.update(&attempt.to_be_bytes());
    let bytes = mac.finalize().into_bytes();
    BigUint::from_bytes_be(&bytes) % n_minus_one + BigUint::one()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    fn signer() -> KeyEntry {
        testkit::registry().named(crate::keyset::NP_SIG).unwrap()
    }

    #[test]
    fn test_sign_verify() {
        let entry = signer();
        let message = b"header || metadata || payload";
        let sig = sign(message, &entry).unwrap();
        assert!(verify(message, &sig, &entry).unwrap());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let entry = signer();
        let a = sign(b"same bytes", &entry).unwrap();
        let b = sign(b"same bytes", &entry).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bit_flip_fails_verification() {
        let entry = signer();
        let mut message = vec![0x5Au8; 256];
        let sig = sign(&message, &entry).unwrap();
        for i in [0usize, 17, 128, 255] {
            message[i] ^= 0x01;
            assert!(!verify(&message, &sig, &entry).unwrap(), "flip at {}", i);
            message[i] ^= 0x01;
        }
        assert!(verify(&message, &sig, &entry).unwrap());
    }

    #[test]
    fn test_zeroed_signature_rejected() {
        let entry = signer();
        let sig = Signature::from_bytes(&[0u8; SIGNATURE_SIZE], entry.curve_id).unwrap();
        assert!(!verify(b"anything", &sig, &entry).unwrap());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let registry = testkit::registry();
        let entry = signer();
        let other = registry.named(crate::keyset::NP_KLIC_FREE).unwrap();
        let sig = sign(b"payload", &entry).unwrap();
        assert!(verify(b"payload", &sig, &other).is_err());

        let mut forged = entry.clone();
        forged.public = registry
            .resolve_for_signing(&testkit::app_context())
            .unwrap()
            .public;
        assert!(!verify(b"payload", &sig, &forged).unwrap());
    }

    #[test]
    fn test_signature_wire_layout() {
        let entry = signer();
        let sig = sign(b"layout", &entry).unwrap();
        let bytes = sig.to_bytes();
        assert_eq!(&bytes[42..], &[0u8; 6]);
        assert_eq!(Signature::from_bytes(&bytes, entry.curve_id).unwrap(), sig);
    }

    #[test]
    fn test_public_key_matches_registry() {
        let entry = signer();
        let derived = public_key(entry.curve.as_ref().unwrap(), entry.private.as_ref().unwrap()).unwrap();
        assert_eq!(Some(derived), entry.public);
    }
}
