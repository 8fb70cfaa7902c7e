//! Explicit configuration values handed to the codec. Nothing here is
//! process-global; the CLI builds these from its options.

use crate::codec::ContainerSummary;
use crate::error::{Result, SceError};
use crate::header::{ContainerType, SelfType};
use crate::image::extended::CONTROL_FLAGS_SIZE;
use crate::image::TransformOptions;
use crate::license::{Klicensee, LicenseParams, KLICENSEE_SIZE};
use crate::metadata::{CAPABILITY_FLAGS_SIZE, INDIVIDUALS_SEED_SIZE, METADATA_INFO_SIZE};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use crate::metadata::KeyMaterialPolicy;

/// Environment variable naming the data directory
pub const DATA_PATH_ENV: &str = "PS3";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_AUTH_ID: u64 = 0x1010_0000_0100_0003;
pub const DEFAULT_VENDOR_ID: u32 = 0x0100_0002;
pub const DEFAULT_APP_VERSION: u64 = 0x0001_0000_0000_0000;
pub const DEFAULT_FW_VERSION: u64 = 0x0003_0041_0000_0000;

/// Everything `encode` needs to know about the container it builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeAttributes {
    pub container_type: ContainerType,
    pub key_revision: u16,
    pub self_type: SelfType,
    pub auth_id: u64,
    pub vendor_id: u32,
    pub app_version: u64,
    pub fw_version: u64,
    pub compress: bool,
    pub skip_sections: bool,
    pub add_section_headers: bool,
    pub control_flags: [u8; CONTROL_FLAGS_SIZE],
    pub capability_flags: Option<[u8; CAPABILITY_FLAGS_SIZE]>,
    pub individuals_seed: Option<Vec<u8>>,
    pub key_policy: KeyMaterialPolicy,
    /// Section size for raw containers
    pub chunk_size: usize,
    /// Required for NPDRM images
    pub license: Option<LicenseParams>,
    /// Worker threads for section processing, `None` for the rayon default
    pub threads: Option<usize>,
}

impl Default for EncodeAttributes {
    fn default() -> Self {
        Self {
            container_type: ContainerType::LoadableImage,
            key_revision: 0,
            self_type: SelfType::App,
            auth_id: DEFAULT_AUTH_ID,
            vendor_id: DEFAULT_VENDOR_ID,
            app_version: DEFAULT_APP_VERSION,
            fw_version: DEFAULT_FW_VERSION,
            compress: false,
            skip_sections: true,
            add_section_headers: true,
            control_flags: [0u8; CONTROL_FLAGS_SIZE],
            capability_flags: None,
            individuals_seed: None,
            key_policy: KeyMaterialPolicy::Derived,
            chunk_size: DEFAULT_CHUNK_SIZE,
            license: None,
            threads: None,
        }
    }
}

impl EncodeAttributes {
    /// Seed attributes from an existing container's plaintext header
    pub fn from_template(summary: &ContainerSummary) -> Self {
        let mut attrs = Self {
            container_type: summary.container_type,
            key_revision: summary.key_revision,
            ..Default::default()
        };
        if let Some(app) = &summary.app_info {
            attrs.self_type = app.self_type;
            attrs.auth_id = app.auth_id;
            attrs.vendor_id = app.vendor_id;
            attrs.app_version = app.version;
        }
        if let Some(fw_version) = summary.fw_version {
            attrs.fw_version = fw_version;
        }
        if let Some(flags) = summary.control_flags {
            attrs.control_flags = flags;
        }
        if let Some(license) = &summary.license {
            attrs.license = Some(LicenseParams {
                license_type: license.license_type,
                app_type: license.app_type,
                content_id: license.content_id.clone(),
                real_filename: license.real_filename.clone(),
                ..Default::default()
            });
        }
        debug!(container_type = summary.container_type.name(), "attributes seeded from template");
        attrs
    }

    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            skip_sections: self.skip_sections,
            add_section_headers: self.add_section_headers,
            compress: self.compress,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SceError::InvalidArgument("chunk size must be positive".into()));
        }
        if let Some(seed) = &self.individuals_seed {
            if seed.len() != INDIVIDUALS_SEED_SIZE {
                return Err(SceError::InvalidArgument(format!(
                    "individuals seed must be {} bytes, got {}",
                    INDIVIDUALS_SEED_SIZE,
                    seed.len()
                )));
            }
        }
        if self.container_type == ContainerType::LoadableImage && self.self_type == SelfType::Npdrm {
            match &self.license {
                Some(params) => params.validate()?,
                None => {
                    return Err(SceError::InvalidArgument(
                        "NPDRM images need license parameters".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn is_npdrm(&self) -> bool {
        self.container_type == ContainerType::LoadableImage && self.self_type == SelfType::Npdrm
    }
}

/// Key material supplied by the caller for encode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOverrides {
    /// 48 or 110 raw bytes, see `Registry::override_entry`
    pub keyset: Option<Vec<u8>>,
    /// Plaintext metadata info to use instead of generating one
    pub meta_info: Option<[u8; METADATA_INFO_SIZE]>,
    pub klicensee: Option<Klicensee>,
}

/// Key material supplied by the caller for decode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOverrides {
    pub keyset: Option<Vec<u8>>,
    /// Plaintext metadata info; skips the keyset and license levels
    pub meta_info: Option<[u8; METADATA_INFO_SIZE]>,
    pub klicensee: Option<Klicensee>,
    pub threads: Option<usize>,
}

/// Where keysets and curve tables are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub data_dir: PathBuf,
}

impl DataPaths {
    /// Explicit path, else `$PS3` when it names a directory, else `./data`
    pub fn resolve(explicit: Option<&Path>) -> Self {
        Self::resolve_with(explicit, std::env::var_os(DATA_PATH_ENV).map(PathBuf::from))
    }

    fn resolve_with(explicit: Option<&Path>, env: Option<PathBuf>) -> Self {
        let data_dir = match (explicit, env) {
            (Some(path), _) => path.to_path_buf(),
            (None, Some(path)) if path.is_dir() => path,
            _ => PathBuf::from(DEFAULT_DATA_DIR),
        };
        Self { data_dir }
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

pub fn parse_hex_u64(s: &str) -> Result<u64> {
    u64::from_str_radix(strip_hex_prefix(s.trim()), 16)
        .map_err(|e| SceError::InvalidArgument(format!("{}: {}", s, e)))
}

pub fn parse_hex_u32(s: &str) -> Result<u32> {
    u32::from_str_radix(strip_hex_prefix(s.trim()), 16)
        .map_err(|e| SceError::InvalidArgument(format!("{}: {}", s, e)))
}

/// Hex string, or decimal when it has no prefix and only digits
pub fn parse_u16(s: &str) -> Result<u16> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| SceError::InvalidArgument(format!("{}: {}", s, e)))
}

pub fn parse_hex_vec(s: &str) -> Result<Vec<u8>> {
    hex::decode(strip_hex_prefix(s.trim()))
        .map_err(|e| SceError::InvalidArgument(format!("hex value: {}", e)))
}

pub fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = parse_hex_vec(s)?;
    bytes.as_slice().try_into().map_err(|_| {
        SceError::InvalidArgument(format!("expected {} hex bytes, got {}", N, bytes.len()))
    })
}

pub fn parse_klicensee(s: &str) -> Result<Klicensee> {
    parse_hex_array::<KLICENSEE_SIZE>(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::LicenseInfo;
    use crate::header::{LicenseType, NpAppType};
    use crate::image::AppInfo;

    #[test]
    fn test_defaults() {
        let attrs = EncodeAttributes::default();
        assert_eq!(attrs.container_type, ContainerType::LoadableImage);
        assert_eq!(attrs.self_type, SelfType::App);
        assert!(attrs.skip_sections);
        assert!(attrs.add_section_headers);
        assert!(!attrs.compress);
        assert_eq!(attrs.key_policy, KeyMaterialPolicy::Derived);
        assert_eq!(attrs.chunk_size, 64 * 1024);
        assert!(attrs.validate().is_ok());
    }

    #[test]
    fn test_npdrm_requires_license() {
        let mut attrs = EncodeAttributes {
            self_type: SelfType::Npdrm,
            ..Default::default()
        };
        assert!(attrs.validate().is_err());
        attrs.license = Some(LicenseParams {
            content_id: "UP0001-TEST00000_00-0000111122223333".into(),
            ..Default::default()
        });
        assert!(attrs.validate().is_ok());
    }

    #[test]
    fn test_from_template() {
        let summary = ContainerSummary {
            container_type: ContainerType::LoadableImage,
            key_revision: 0x1c,
            header_len: 0x400,
            total_len: 0x2000,
            app_info: Some(AppInfo {
                auth_id: 0x1010_0000_0100_0001,
                vendor_id: 0x0100_0003,
                self_type: SelfType::Npdrm,
                version: 0x0002_0000_0000_0000,
            }),
            segment_count: 2,
            fw_version: Some(0x0003_0055_0000_0000),
            control_flags: Some([7u8; CONTROL_FLAGS_SIZE]),
            license: Some(LicenseInfo {
                license_type: LicenseType::Local,
                app_type: NpAppType::Uexec,
                content_id: "CID".into(),
                real_filename: "EBOOT.BIN".into(),
            }),
        };
        let attrs = EncodeAttributes::from_template(&summary);
        assert_eq!(attrs.key_revision, 0x1c);
        assert_eq!(attrs.self_type, SelfType::Npdrm);
        assert_eq!(attrs.auth_id, 0x1010_0000_0100_0001);
        assert_eq!(attrs.fw_version, 0x0003_0055_0000_0000);
        assert_eq!(attrs.control_flags, [7u8; CONTROL_FLAGS_SIZE]);
        let license = attrs.license.unwrap();
        assert_eq!(license.app_type, NpAppType::Uexec);
        assert_eq!(license.content_id, "CID");
    }

    #[test]
    fn test_data_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = DataPaths::resolve_with(Some(Path::new("/keys")), Some(dir.path().into()));
        assert_eq!(explicit.data_dir, PathBuf::from("/keys"));

        let from_env = DataPaths::resolve_with(None, Some(dir.path().into()));
        assert_eq!(from_env.data_dir, dir.path());

        let missing = DataPaths::resolve_with(None, Some(dir.path().join("absent")));
        assert_eq!(missing.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn test_hex_parsing() {
        assert_eq!(parse_hex_u64("0x1010000001000003").unwrap(), 0x1010_0000_0100_0003);
        assert_eq!(parse_hex_u32("01000002").unwrap(), 0x0100_0002);
        assert_eq!(parse_u16("0x1c").unwrap(), 0x1c);
        assert_eq!(parse_u16("28").unwrap(), 28);
        assert_eq!(parse_hex_array::<2>("abcd").unwrap(), [0xab, 0xcd]);
        assert!(parse_hex_array::<2>("abcdef").is_err());
        assert!(parse_klicensee("00").is_err());
        assert!(parse_hex_u64("zz").is_err());
    }
}
