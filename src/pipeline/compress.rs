use crate::error::{Result, SceError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Upper bound for a section whose inflated size is not recorded anywhere
pub const MAX_SECTION_SIZE: u64 = 256 * 1024 * 1024;

/// zlib-compress a section payload
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| SceError::Compression(format!("zlib: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SceError::Compression(format!("zlib: {}", e)))
}

/// Inflate a section payload, refusing to produce more than `limit` bytes
pub fn decompress(data: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    ZlibDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut output)
        .map_err(|e| SceError::Compression(format!("zlib: {}", e)))?;
    if output.len() as u64 > limit {
        return Err(SceError::Compression(format!(
            "inflated section exceeds {} bytes",
            limit
        )));
    }
    Ok(output)
}

/// Compress only when it actually shrinks the payload
pub fn compress_if_smaller(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let compressed = compress(data)?;
    Ok(if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    })
}
