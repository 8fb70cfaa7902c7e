use crate::error::{CryptoError, Result, SceError, Stage};
use crate::metadata::{Metadata, SectionDescriptor, SectionKeys, SectionType};
use crate::pipeline::cipher;
use crate::pipeline::compress::{self, MAX_SECTION_SIZE};
use crate::pipeline::mac::{self, SECTION_DIGEST_SIZE};
use rayon::prelude::*;
use tracing::debug;

/// One section's plaintext and the keys it is sealed with
#[derive(Debug, Clone)]
pub struct SectionJob<'a> {
    pub section_type: SectionType,
    /// Program header index or chunk number
    pub index: u32,
    pub data: &'a [u8],
    pub encrypt: bool,
    pub compress: bool,
    pub keys: SectionKeys,
}

/// Output of `encrypt_section`; the descriptor offset is assigned later when
/// the payload is placed in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSection {
    pub descriptor: SectionDescriptor,
    pub payload: Vec<u8>,
}

/// Compress (when it helps), digest, then encrypt one section
pub fn encrypt_section(job: &SectionJob) -> Result<SealedSection> {
    let compressed = if job.compress {
        compress::compress_if_smaller(job.data)?
    } else {
        None
    };
    let is_compressed = compressed.is_some();
    let stored = compressed.unwrap_or_else(|| job.data.to_vec());

    let digest = mac::section_digest(&job.keys.hmac_key, &stored);
    let payload = if job.encrypt {
        cipher::aes128_ctr(&job.keys.key, &job.keys.iv, &stored)?
    } else {
        stored
    };

    Ok(SealedSection {
        descriptor: SectionDescriptor {
            offset: 0,
            data_size: payload.len() as u64,
            uncompressed_len: job.data.len() as u64,
            section_type: job.section_type,
            index: job.index,
            hashed: true,
            digest_index: 0,
            encrypted: job.encrypt,
            key_index: 0,
            iv_index: 0,
            compressed: is_compressed,
            digest,
        },
        payload,
    })
}

/// Decrypt, verify, then inflate one section. A non-zero
/// `descriptor.uncompressed_len` is enforced as the exact output length.
pub fn decrypt_section(
    stored: &[u8],
    descriptor: &SectionDescriptor,
    keys: &SectionKeys,
) -> Result<Vec<u8>> {
    if stored.len() as u64 != descriptor.data_size {
        return Err(SceError::format(
            Stage::Section,
            format!(
                "section {} holds {} bytes, descriptor says {}",
                descriptor.index,
                stored.len(),
                descriptor.data_size
            ),
        ));
    }

    let plain = if descriptor.encrypted {
        cipher::aes128_ctr(&keys.key, &keys.iv, stored)?
    } else {
        stored.to_vec()
    };

    if descriptor.hashed
        && !mac::verify_section_digest(&keys.hmac_key, &plain, &descriptor.digest[..SECTION_DIGEST_SIZE])
    {
        return Err(CryptoError::DigestMismatch {
            section: descriptor.index,
        }
        .into());
    }

    let expected = descriptor.uncompressed_len;
    let output = if descriptor.compressed {
        let limit = if expected > 0 { expected } else { MAX_SECTION_SIZE };
        compress::decompress(&plain, limit)?
    } else {
        plain
    };

    if expected > 0 && output.len() as u64 != expected {
        return Err(SceError::format(
            Stage::Section,
            format!(
                "section {} decoded to {} bytes, expected {}",
                descriptor.index,
                output.len(),
                expected
            ),
        ));
    }
    Ok(output)
}

/// Runs section work on a bounded worker pool. Results are always joined
/// back in descriptor order.
#[derive(Debug, Clone, Default)]
pub struct SectionProcessor {
    threads: Option<usize>,
}

impl SectionProcessor {
    /// `None` uses the global rayon pool
    pub fn new(threads: Option<usize>) -> Self {
        Self { threads }
    }

    pub fn seal_all(&self, jobs: &[SectionJob]) -> Result<Vec<SealedSection>> {
        debug!(sections = jobs.len(), threads = ?self.threads, "sealing sections");
        self.install(|| jobs.par_iter().map(encrypt_section).collect())?
    }

    /// Decrypt every section described by `metadata` out of `container`
    pub fn open_all(&self, container: &[u8], metadata: &Metadata) -> Result<Vec<Vec<u8>>> {
        debug!(sections = metadata.sections.len(), threads = ?self.threads, "opening sections");
        self.install(|| {
            metadata
                .sections
                .par_iter()
                .map(|descriptor| {
                    let end = descriptor
                        .end()
                        .filter(|end| *end <= container.len() as u64)
                        .ok_or_else(|| {
                            SceError::format(
                                Stage::Section,
                                format!("section {} ends past the container", descriptor.index),
                            )
                        })?;
                    let stored = &container[descriptor.offset as usize..end as usize];
                    let keys = metadata.section_keys(descriptor)?;
                    decrypt_section(stored, descriptor, &keys)
                })
                .collect()
        })?
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> Result<R> {
        match self.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| SceError::InvalidArgument(format!("worker pool: {}", e)))?;
                Ok(pool.install(op))
            }
            None => Ok(op()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{KeyMaterialPolicy, MetadataInfo};

    fn keys(position: u32) -> SectionKeys {
        let info = MetadataInfo {
            key: [0x42; 16],
            iv: [0x24; 16],
        };
        SectionKeys::generate(KeyMaterialPolicy::Derived, &info, position)
    }

    fn job(data: &[u8], position: u32, compress: bool) -> SectionJob<'_> {
        SectionJob {
            section_type: SectionType::Segment,
            index: position,
            data,
            encrypt: true,
            compress,
            keys: keys(position),
        }
    }

    #[test]
    fn test_section_roundtrip() {
        let data = b"segment payload bytes".repeat(7);
        let sealed = encrypt_section(&job(&data, 0, false)).unwrap();
        assert_ne!(sealed.payload, data);
        assert!(!sealed.descriptor.compressed);
        let opened = decrypt_section(&sealed.payload, &sealed.descriptor, &keys(0)).unwrap();
        assert_eq!(opened, data);
    }

    #[test]
    fn test_compression_only_when_smaller() {
        let compressible = vec![0xAAu8; 4096];
        let sealed = encrypt_section(&job(&compressible, 0, true)).unwrap();
        assert!(sealed.descriptor.compressed);
        assert!(sealed.payload.len() < compressible.len());
        let opened = decrypt_section(&sealed.payload, &sealed.descriptor, &keys(0)).unwrap();
        assert_eq!(opened, compressible);

        let tiny = [0x01u8, 0x02, 0x03];
        let sealed = encrypt_section(&job(&tiny, 1, true)).unwrap();
        assert!(!sealed.descriptor.compressed);
        assert_eq!(sealed.payload.len(), tiny.len());
    }

    #[test]
    fn test_plain_section_keeps_bytes() {
        let data = b"note segment".to_vec();
        let mut plain_job = job(&data, 3, false);
        plain_job.encrypt = false;
        let sealed = encrypt_section(&plain_job).unwrap();
        assert_eq!(sealed.payload, data);
        assert!(decrypt_section(&sealed.payload, &sealed.descriptor, &keys(3)).is_ok());
    }

    #[test]
    fn test_tampered_section_fails_digest() {
        let data = vec![0x11u8; 256];
        let mut sealed = encrypt_section(&job(&data, 2, false)).unwrap();
        sealed.payload[100] ^= 0x04;
        let err = decrypt_section(&sealed.payload, &sealed.descriptor, &keys(2)).unwrap_err();
        assert!(matches!(
            err,
            SceError::Crypto(CryptoError::DigestMismatch { section: 2 })
        ));
    }

    #[test]
    fn test_wrong_section_keys_fail_digest() {
        let data = vec![0x11u8; 64];
        let sealed = encrypt_section(&job(&data, 0, false)).unwrap();
        assert!(decrypt_section(&sealed.payload, &sealed.descriptor, &keys(1)).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let data = vec![0x33u8; 64];
        let mut sealed = encrypt_section(&job(&data, 0, false)).unwrap();
        sealed.descriptor.uncompressed_len = 65;
        assert!(matches!(
            decrypt_section(&sealed.payload, &sealed.descriptor, &keys(0)),
            Err(SceError::Format { stage: Stage::Section, .. })
        ));
    }

    #[test]
    fn test_processing_order_does_not_matter() {
        let payloads: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 300 + i as usize * 17]).collect();
        let jobs: Vec<SectionJob> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| job(p, i as u32, true))
            .collect();

        let parallel = SectionProcessor::new(Some(3)).seal_all(&jobs).unwrap();
        let mut reversed: Vec<SealedSection> = jobs
            .iter()
            .rev()
            .map(|j| encrypt_section(j).unwrap())
            .collect();
        reversed.reverse();
        assert_eq!(parallel, reversed);

        let single = SectionProcessor::new(Some(1)).seal_all(&jobs).unwrap();
        assert_eq!(parallel, single);
    }
}
