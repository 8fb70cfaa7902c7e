use crate::error::{CryptoError, Result};
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use ctr::cipher::StreamCipher;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const BLOCK_SIZE: usize = 16;

fn setup_error(what: &str, e: impl std::fmt::Debug) -> CryptoError {
    CryptoError::Cipher(format!("{}: {:?}", what, e))
}

fn check_blocks(what: &str, data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Cipher(format!(
            "{}: {} bytes is not a whole number of blocks",
            what,
            data.len()
        ))
        .into());
    }
    Ok(())
}

/// AES-256-CBC without padding
pub fn aes256_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_blocks("aes-256-cbc", data)?;
    let mut buf = data.to_vec();
    let len = buf.len();
    cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(|e| setup_error("aes-256-cbc", e))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| setup_error("aes-256-cbc", e))?;
    Ok(buf)
}

pub fn aes256_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_blocks("aes-256-cbc", data)?;
    let mut buf = data.to_vec();
    cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
        .map_err(|e| setup_error("aes-256-cbc", e))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| setup_error("aes-256-cbc", e))?;
    Ok(buf)
}

/// AES-128-CBC without padding
pub fn aes128_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_blocks("aes-128-cbc", data)?;
    let mut buf = data.to_vec();
    let len = buf.len();
    cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|e| setup_error("aes-128-cbc", e))?
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| setup_error("aes-128-cbc", e))?;
    Ok(buf)
}

pub fn aes128_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_blocks("aes-128-cbc", data)?;
    let mut buf = data.to_vec();
    cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|e| setup_error("aes-128-cbc", e))?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| setup_error("aes-128-cbc", e))?;
    Ok(buf)
}

/// AES-128-CTR with a 128-bit big-endian counter; encryption and decryption
/// are the same operation.
pub fn aes128_ctr(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    let mut cipher =
        Aes128Ctr::new_from_slices(key, iv).map_err(|e| setup_error("aes-128-ctr", e))?;
    cipher.apply_keystream(&mut buf);
    Ok(buf)
}

pub fn aes128_ecb_encrypt_block(key: &[u8], block: &[u8; BLOCK_SIZE]) -> Result<[u8; BLOCK_SIZE]> {
    let cipher = Aes128::new_from_slice(key).map_err(|e| setup_error("aes-128-ecb", e))?;
    let mut buf = aes::Block::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    Ok(buf.into())
}

pub fn aes128_ecb_decrypt_block(key: &[u8], block: &[u8; BLOCK_SIZE]) -> Result<[u8; BLOCK_SIZE]> {
    let cipher = Aes128::new_from_slice(key).map_err(|e| setup_error("aes-128-ecb", e))?;
    let mut buf = aes::Block::clone_from_slice(block);
    cipher.decrypt_block(&mut buf);
    Ok(buf.into())
}

/// AES-128 CMAC (OMAC1)
pub fn cmac_aes128(key: &[u8], parts: &[&[u8]]) -> Result<[u8; BLOCK_SIZE]> {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|e| setup_error("aes-cmac", e))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time CMAC comparison
pub fn cmac_aes128_verify(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> Result<bool> {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|e| setup_error("aes-cmac", e))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.verify_slice(expected).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbc256_roundtrip() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        let data = [0x33u8; 64];
        let ct = aes256_cbc_encrypt(&key, &iv, &data).unwrap();
        assert_ne!(&ct[..], &data[..]);
        assert_eq!(aes256_cbc_decrypt(&key, &iv, &ct).unwrap(), data);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        assert!(aes128_cbc_encrypt(&[0u8; 16], &[0u8; 16], &[0u8; 17]).is_err());
    }

    #[test]
    fn test_cbc_rejects_bad_key_length() {
        assert!(aes256_cbc_encrypt(&[0u8; 16], &[0u8; 16], &[0u8; 16]).is_err());
    }

    #[test]
    fn test_ctr_is_involution() {
        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];
        let data = b"odd length payload, not block aligned";
        let ct = aes128_ctr(&key, &iv, data).unwrap();
        assert_eq!(ct.len(), data.len());
        assert_eq!(aes128_ctr(&key, &iv, &ct).unwrap(), data.to_vec());
    }

    #[test]
    fn test_aes128_known_answer() {
        // FIPS-197 appendix C.1
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let mut block = [0u8; 16];
        block.copy_from_slice(&hex::decode("00112233445566778899aabbccddeeff").unwrap());
        let ct = aes128_ecb_encrypt_block(&key, &block).unwrap();
        assert_eq!(hex::encode(ct), "69c4e0d86a7b0430d8cdb78070b4c55a");
        assert_eq!(aes128_ecb_decrypt_block(&key, &ct).unwrap(), block);
    }

    #[test]
    fn test_cmac_known_answer() {
        // RFC 4493 example 2
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let tag = cmac_aes128(&key, &[&msg[..]]).unwrap();
        assert_eq!(hex::encode(tag), "070a16b46b4d4144f79bdd9dd04a287c");
        assert!(cmac_aes128_verify(&key, &[&msg[..8], &msg[8..]], &tag).unwrap());
        assert!(!cmac_aes128_verify(&key, &[&msg[..]], &[0u8; 16]).unwrap());
    }
}
