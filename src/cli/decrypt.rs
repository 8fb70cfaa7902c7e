use crate::codec::Codec;
use crate::config::{DataPaths, DecodeOverrides};
use crate::error::Result;
use crate::keyset::Registry;
use std::path::Path;
use tracing::info;

/// Options for the decrypt command
#[derive(Debug, Clone, Default)]
pub struct DecryptOptions {
    pub overrides: DecodeOverrides,
}

/// Decrypt a container and write the executable or raw payload.
/// Returns the number of bytes written.
pub fn decrypt_file(
    input_path: &Path,
    output_path: &Path,
    paths: &DataPaths,
    options: &DecryptOptions,
) -> Result<usize> {
    let registry = Registry::from_dir(&paths.data_dir)?;
    let container = std::fs::read(input_path)?;

    let decoded = Codec::new(&registry).decode(&container, &options.overrides)?;
    let payload = decoded.payload.bytes();
    std::fs::write(output_path, payload)?;

    info!(
        input = %input_path.display(),
        output = %output_path.display(),
        bytes = payload.len(),
        "decrypted"
    );
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::encrypt::{encrypt_file, EncryptOptions};
    use crate::error::{IntegrityError, SceError};
    use crate::testkit;
    use tempfile::tempdir;

    #[test]
    fn test_decrypt_roundtrip() {
        let dir = tempdir().unwrap();
        testkit::write_data_dir(dir.path()).unwrap();
        let paths = DataPaths {
            data_dir: dir.path().to_path_buf(),
        };
        let elf_path = dir.path().join("app.elf");
        let self_path = dir.path().join("app.self");
        let out_path = dir.path().join("app.out.elf");
        std::fs::write(&elf_path, testkit::sample_elf()).unwrap();

        encrypt_file(&elf_path, &self_path, &paths, &EncryptOptions::default()).unwrap();
        let written = decrypt_file(&self_path, &out_path, &paths, &DecryptOptions::default()).unwrap();

        let restored = std::fs::read(&out_path).unwrap();
        assert_eq!(written, restored.len());
        assert_eq!(restored, testkit::sample_elf());
    }

    #[test]
    fn test_decrypt_corrupted_file() {
        let dir = tempdir().unwrap();
        testkit::write_data_dir(dir.path()).unwrap();
        let paths = DataPaths {
            data_dir: dir.path().to_path_buf(),
        };
        let elf_path = dir.path().join("app.elf");
        let self_path = dir.path().join("app.self");
        std::fs::write(&elf_path, testkit::sample_elf()).unwrap();
        encrypt_file(&elf_path, &self_path, &paths, &EncryptOptions::default()).unwrap();

        let mut bytes = std::fs::read(&self_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last - 0x20] ^= 0x40;
        std::fs::write(&self_path, &bytes).unwrap();

        let out_path = dir.path().join("out.elf");
        let err = decrypt_file(&self_path, &out_path, &paths, &DecryptOptions::default()).unwrap_err();
        assert!(matches!(err, SceError::Integrity(IntegrityError::SignatureInvalid)));
        assert!(!out_path.exists());
    }
}
