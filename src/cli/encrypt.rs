use crate::codec::{inspect, Codec};
use crate::config::{DataPaths, EncodeAttributes, KeyMaterialPolicy, KeyOverrides};
use crate::error::Result;
use crate::header::{ContainerType, LicenseType, NpAppType, SelfType};
use crate::image::extended::CONTROL_FLAGS_SIZE;
use crate::keyset::Registry;
use crate::license::LicenseParams;
use crate::metadata::CAPABILITY_FLAGS_SIZE;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Options for the encrypt command. Every `None` falls back to the
/// template container when one is given, then to the defaults.
#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    pub template: Option<PathBuf>,
    pub container_type: Option<ContainerType>,
    pub key_revision: Option<u16>,
    pub self_type: Option<SelfType>,
    pub auth_id: Option<u64>,
    pub vendor_id: Option<u32>,
    pub app_version: Option<u64>,
    pub fw_version: Option<u64>,
    pub compress: Option<bool>,
    pub skip_sections: Option<bool>,
    pub add_section_headers: Option<bool>,
    pub control_flags: Option<[u8; CONTROL_FLAGS_SIZE]>,
    pub capability_flags: Option<[u8; CAPABILITY_FLAGS_SIZE]>,
    pub individuals_seed: Option<Vec<u8>>,
    pub key_policy: Option<KeyMaterialPolicy>,
    pub license_type: Option<LicenseType>,
    pub app_type: Option<NpAppType>,
    pub content_id: Option<String>,
    pub real_filename: Option<String>,
    pub threads: Option<usize>,
    pub keys: KeyOverrides,
}

impl EncryptOptions {
    /// Merge template, explicit options and defaults into codec attributes
    pub fn attributes(&self, output_path: &Path) -> Result<EncodeAttributes> {
        let mut attrs = match &self.template {
            Some(path) => {
                let summary = inspect(&std::fs::read(path)?)?;
                debug!(template = %path.display(), "using template container");
                EncodeAttributes::from_template(&summary)
            }
            None => EncodeAttributes::default(),
        };

        if let Some(v) = self.container_type {
            attrs.container_type = v;
        }
        if let Some(v) = self.key_revision {
            attrs.key_revision = v;
        }
        if let Some(v) = self.self_type {
            attrs.self_type = v;
        }
        if let Some(v) = self.auth_id {
            attrs.auth_id = v;
        }
        if let Some(v) = self.vendor_id {
            attrs.vendor_id = v;
        }
        if let Some(v) = self.app_version {
            attrs.app_version = v;
        }
        if let Some(v) = self.fw_version {
            attrs.fw_version = v;
        }
        if let Some(v) = self.compress {
            attrs.compress = v;
        }
        if let Some(v) = self.skip_sections {
            attrs.skip_sections = v;
        }
        if let Some(v) = self.add_section_headers {
            attrs.add_section_headers = v;
        }
        if let Some(v) = self.control_flags {
            attrs.control_flags = v;
        }
        if self.capability_flags.is_some() {
            attrs.capability_flags = self.capability_flags;
        }
        if self.individuals_seed.is_some() {
            attrs.individuals_seed = self.individuals_seed.clone();
        }
        if let Some(v) = self.key_policy {
            attrs.key_policy = v;
        }
        attrs.threads = self.threads;

        attrs.license = if attrs.is_npdrm() {
            let mut params = attrs.license.take().unwrap_or_default();
            if let Some(v) = self.license_type {
                params.license_type = v;
            }
            if let Some(v) = self.app_type {
                params.app_type = v;
            }
            if let Some(v) = &self.content_id {
                params.content_id = v.clone();
            }
            params.real_filename = match &self.real_filename {
                Some(name) => name.clone(),
                None => default_real_filename(output_path, &params),
            };
            Some(params)
        } else {
            None
        };

        attrs.validate()?;
        Ok(attrs)
    }
}

fn default_real_filename(output_path: &Path, params: &LicenseParams) -> String {
    output_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| params.real_filename.clone())
}

/// Encrypt an executable or raw payload into a container.
/// Returns the container size in bytes.
pub fn encrypt_file(
    input_path: &Path,
    output_path: &Path,
    paths: &DataPaths,
    options: &EncryptOptions,
) -> Result<usize> {
    let attrs = options.attributes(output_path)?;
    let registry = Registry::from_dir(&paths.data_dir)?;
    let input = std::fs::read(input_path)?;

    let container = Codec::new(&registry).encode(&input, &attrs, &options.keys)?;
    std::fs::write(output_path, &container)?;

    info!(
        input = %input_path.display(),
        output = %output_path.display(),
        container_type = attrs.container_type.name(),
        bytes = container.len(),
        "encrypted"
    );
    Ok(container.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::decrypt::{decrypt_file, DecryptOptions};
    use crate::config::DecodeOverrides;
    use crate::testkit;
    use tempfile::tempdir;

    fn data_paths(dir: &Path) -> DataPaths {
        testkit::write_data_dir(dir).unwrap();
        DataPaths {
            data_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_attributes_defaults() {
        let attrs = EncryptOptions::default()
            .attributes(Path::new("out.self"))
            .unwrap();
        assert_eq!(attrs, EncodeAttributes::default());
    }

    #[test]
    fn test_attributes_npdrm_filename() {
        let options = EncryptOptions {
            self_type: Some(SelfType::Npdrm),
            content_id: Some(testkit::TEST_CONTENT_ID.into()),
            ..Default::default()
        };
        let attrs = options.attributes(Path::new("/tmp/game/EBOOT.BIN")).unwrap();
        let license = attrs.license.unwrap();
        assert_eq!(license.real_filename, "EBOOT.BIN");
        assert_eq!(license.license_type, LicenseType::Free);

        let named = EncryptOptions {
            real_filename: Some("GAME.SELF".into()),
            ..options
        };
        let attrs = named.attributes(Path::new("/tmp/out.bin")).unwrap();
        assert_eq!(attrs.license.unwrap().real_filename, "GAME.SELF");
    }

    #[test]
    fn test_attributes_npdrm_needs_content_id() {
        let options = EncryptOptions {
            self_type: Some(SelfType::Npdrm),
            ..Default::default()
        };
        assert!(options.attributes(Path::new("EBOOT.BIN")).is_err());
    }

    #[test]
    fn test_attributes_from_template() {
        let dir = tempdir().unwrap();
        let paths = data_paths(dir.path());
        let elf_path = dir.path().join("app.elf");
        let template = dir.path().join("template.self");
        std::fs::write(&elf_path, testkit::sample_elf()).unwrap();

        let first = EncryptOptions {
            auth_id: Some(0x1010_0000_0100_0001),
            vendor_id: Some(0x0100_0003),
            ..Default::default()
        };
        encrypt_file(&elf_path, &template, &paths, &first).unwrap();

        let options = EncryptOptions {
            template: Some(template),
            vendor_id: Some(0x0100_0009),
            ..Default::default()
        };
        let attrs = options.attributes(Path::new("next.self")).unwrap();
        assert_eq!(attrs.auth_id, 0x1010_0000_0100_0001);
        assert_eq!(attrs.vendor_id, 0x0100_0009);
    }

    #[test]
    fn test_encrypt_raw_container() {
        let dir = tempdir().unwrap();
        let paths = data_paths(dir.path());
        let input = dir.path().join("list.bin");
        let container = dir.path().join("list.rvk");
        let restored = dir.path().join("list.out");
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&input, &payload).unwrap();

        let options = EncryptOptions {
            container_type: Some(ContainerType::RevokeList),
            ..Default::default()
        };
        encrypt_file(&input, &container, &paths, &options).unwrap();
        decrypt_file(&container, &restored, &paths, &DecryptOptions::default()).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), payload);
    }

    #[test]
    fn test_encrypt_npdrm_with_klicensee() {
        let dir = tempdir().unwrap();
        let paths = data_paths(dir.path());
        let elf_path = dir.path().join("app.elf");
        let self_path = dir.path().join("EBOOT.BIN");
        let restored = dir.path().join("app.out");
        std::fs::write(&elf_path, testkit::sample_elf()).unwrap();

        let options = EncryptOptions {
            self_type: Some(SelfType::Npdrm),
            license_type: Some(LicenseType::Local),
            content_id: Some(testkit::TEST_CONTENT_ID.into()),
            keys: KeyOverrides {
                klicensee: Some(testkit::TEST_KLICENSEE),
                ..Default::default()
            },
            ..Default::default()
        };
        encrypt_file(&elf_path, &self_path, &paths, &options).unwrap();

        assert!(decrypt_file(&self_path, &restored, &paths, &DecryptOptions::default()).is_err());

        let decrypt = DecryptOptions {
            overrides: DecodeOverrides {
                klicensee: Some(testkit::TEST_KLICENSEE),
                ..Default::default()
            },
        };
        decrypt_file(&self_path, &restored, &paths, &decrypt).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), testkit::sample_elf());
    }
}
