use crate::codec::{inspect, Codec};
use crate::config::{DataPaths, DecodeOverrides};
use crate::error::Result;
use crate::keyset::Registry;
use std::path::Path;
use tracing::debug;

/// Display information about a container.
///
/// The plaintext summary needs no keys. When the data directory holds a
/// usable keyset, the container is also fully decoded and the report
/// appended; otherwise the reason is noted instead.
pub fn show_info(path: &Path, paths: &DataPaths, overrides: &DecodeOverrides, raw: bool) -> Result<String> {
    let container = std::fs::read(path)?;
    let summary = inspect(&container)?;

    let mut output = format!("File: {}\n\n", path.display());
    output.push_str(&summary.to_string());
    output.push('\n');

    let decoded = Registry::from_dir(&paths.data_dir)
        .and_then(|registry| Codec::new(&registry).decode(&container, overrides));
    match decoded {
        Ok(decoded) => output.push_str(&decoded.report.with_raw(raw).to_string()),
        Err(e) => {
            debug!(error = %e, "full report unavailable");
            output.push_str(&format!("Could not decrypt: {}\n", e));
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::encrypt::{encrypt_file, EncryptOptions};
    use crate::testkit;
    use tempfile::tempdir;

    fn encrypted_sample(dir: &Path) -> (DataPaths, std::path::PathBuf) {
        testkit::write_data_dir(dir).unwrap();
        let paths = DataPaths {
            data_dir: dir.to_path_buf(),
        };
        let elf_path = dir.join("app.elf");
        let self_path = dir.join("app.self");
        std::fs::write(&elf_path, testkit::sample_elf()).unwrap();
        encrypt_file(&elf_path, &self_path, &paths, &EncryptOptions::default()).unwrap();
        (paths, self_path)
    }

    #[test]
    fn test_show_info() {
        let dir = tempdir().unwrap();
        let (paths, self_path) = encrypted_sample(dir.path());

        let info = show_info(&self_path, &paths, &DecodeOverrides::default(), false).unwrap();
        assert!(info.contains("SCE Container Summary"));
        assert!(info.contains("SCE Container Information"));
        assert!(info.contains("Status: OK"));
        assert!(!info.contains("Info key:"));
    }

    #[test]
    fn test_show_info_raw() {
        let dir = tempdir().unwrap();
        let (paths, self_path) = encrypted_sample(dir.path());

        let info = show_info(&self_path, &paths, &DecodeOverrides::default(), true).unwrap();
        assert!(info.contains("Info key:"));
        assert!(info.contains("Key slots:"));
    }

    #[test]
    fn test_show_info_without_keys() {
        let dir = tempdir().unwrap();
        let (_, self_path) = encrypted_sample(dir.path());
        let empty = tempdir().unwrap();
        let paths = DataPaths {
            data_dir: empty.path().to_path_buf(),
        };

        let info = show_info(&self_path, &paths, &DecodeOverrides::default(), false).unwrap();
        assert!(info.contains("SCE Container Summary"));
        assert!(info.contains("Could not decrypt"));
    }

    #[test]
    fn test_show_info_not_a_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"definitely not a container").unwrap();
        let paths = DataPaths {
            data_dir: dir.path().to_path_buf(),
        };
        assert!(show_info(&path, &paths, &DecodeOverrides::default(), false).is_err());
    }
}
