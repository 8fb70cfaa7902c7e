//! Keyset registry: provisioned key records plus curve tables, loaded once
//! and then used as a pure lookup.
//!
//! The keys document is a JSON array of records. Every constraint field is
//! optional; an absent field matches any context.
//!
//! ```json
//! [
//!   {
//!     "name": "appldr-0x1c",
//!     "type": "SELF",
//!     "revision": 28,
//!     "self_type": "APP",
//!     "version_min": "0003004100000000",
//!     "erk": "...64 hex...",
//!     "riv": "...32 hex...",
//!     "pub": "...80 hex...",
//!     "priv": "...42 hex...",
//!     "ctype": 20
//!   }
//! ]
//! ```

use crate::curve::{self, Curve, LOADER_CURVE_COUNT, VSH_CURVE_COUNT};
use crate::error::{Result, SceError};
use crate::header::{ContainerType, NpAppType, SelfType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

pub const ERK_SIZE: usize = 32;
pub const RIV_SIZE: usize = 16;
pub const PUBLIC_KEY_SIZE: usize = 40;
pub const PRIVATE_KEY_SIZE: usize = 21;

/// Auxiliary keys used by the license wrapper
pub const NP_KLIC_FREE: &str = "NP_klic_free";
pub const NP_KLIC_KEY: &str = "NP_klic_key";
pub const NP_CI: &str = "NP_ci";
pub const NP_TID: &str = "NP_tid";
pub const NP_SIG: &str = "NP_sig";

/// Override layout: [erk: 32][riv: 16] or [erk: 32][riv: 16][pub: 40][priv: 21][ctype: 1]
pub const OVERRIDE_SHORT_SIZE: usize = ERK_SIZE + RIV_SIZE;
pub const OVERRIDE_FULL_SIZE: usize =
    ERK_SIZE + RIV_SIZE + PUBLIC_KEY_SIZE + PRIVATE_KEY_SIZE + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    #[serde(rename = "SELF")]
    LoadableImage,
    Rvk,
    Pkg,
    Spp,
    Other,
}

impl KeyType {
    pub fn for_container(container_type: ContainerType) -> Self {
        match container_type {
            ContainerType::LoadableImage => KeyType::LoadableImage,
            ContainerType::RevokeList => KeyType::Rvk,
            ContainerType::Package => KeyType::Pkg,
            ContainerType::SecurePayload => KeyType::Spp,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyType::LoadableImage => "SELF",
            KeyType::Rvk => "RVK",
            KeyType::Pkg => "PKG",
            KeyType::Spp => "SPP",
            KeyType::Other => "OTHER",
        }
    }
}

/// Attributes a container presents when asking for its key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyContext {
    pub container_type: ContainerType,
    pub key_revision: u16,
    pub self_type: Option<SelfType>,
    pub app_type: Option<NpAppType>,
    pub vendor_id: Option<u32>,
    pub auth_id: Option<u64>,
    pub fw_version: Option<u64>,
}

impl fmt::Display for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} revision 0x{:04x}",
            self.container_type.name(),
            self.key_revision
        )?;
        if let Some(self_type) = self.self_type {
            write!(f, " type {:?}", self_type)?;
        }
        if let Some(version) = self.fw_version {
            write!(f, " version {:016x}", version)?;
        }
        Ok(())
    }
}

/// Raw record as it appears in the keys document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_type: Option<SelfType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<NpAppType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u32>,
    /// Hex u64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<String>,
    /// Hex u64, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_min: Option<String>,
    /// Hex u64, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_max: Option<String>,
    pub erk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub riv: Option<String>,
    #[serde(default, rename = "pub", skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
    #[serde(default, rename = "priv", skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    #[serde(default)]
    pub ctype: u8,
}

/// Validated record with decoded key material
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub name: String,
    pub key_type: KeyType,
    pub revision: Option<u16>,
    pub self_type: Option<SelfType>,
    pub app_type: Option<NpAppType>,
    pub vendor_id: Option<u32>,
    pub auth_id: Option<u64>,
    pub version_min: Option<u64>,
    pub version_max: Option<u64>,
    pub erk: Vec<u8>,
    pub riv: Vec<u8>,
    pub public: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub private: Option<[u8; PRIVATE_KEY_SIZE]>,
    pub curve_id: u8,
}

impl KeyRecord {
    fn from_raw(raw: KeysetRecord) -> Result<Self> {
        let container_key = raw.key_type != KeyType::Other;
        let erk = decode_hex(&raw.name, "erk", &raw.erk)?;
        let riv = match &raw.riv {
            Some(riv) => decode_hex(&raw.name, "riv", riv)?,
            None => Vec::new(),
        };

        if container_key {
            expect_len(&raw.name, "erk", &erk, ERK_SIZE)?;
            expect_len(&raw.name, "riv", &riv, RIV_SIZE)?;
        } else if erk.is_empty() {
            return Err(SceError::Load(format!("{}: erk must not be empty", raw.name)));
        }

        let public = raw
            .public
            .as_deref()
            .map(|hex| decode_fixed::<PUBLIC_KEY_SIZE>(&raw.name, "pub", hex))
            .transpose()?;
        let private = raw
            .private
            .as_deref()
            .map(|hex| decode_fixed::<PRIVATE_KEY_SIZE>(&raw.name, "priv", hex))
            .transpose()?;

        Ok(Self {
            auth_id: parse_hex_u64(&raw.name, "auth_id", raw.auth_id.as_deref())?,
            version_min: parse_hex_u64(&raw.name, "version_min", raw.version_min.as_deref())?,
            version_max: parse_hex_u64(&raw.name, "version_max", raw.version_max.as_deref())?,
            name: raw.name,
            key_type: raw.key_type,
            revision: raw.revision,
            self_type: raw.self_type,
            app_type: raw.app_type,
            vendor_id: raw.vendor_id,
            erk,
            riv,
            public,
            private,
            curve_id: raw.ctype,
        })
    }

    /// All present constraints satisfied by `ctx`
    pub fn matches(&self, ctx: &KeyContext) -> bool {
        if self.key_type != KeyType::for_container(ctx.container_type) {
            return false;
        }
        if self.revision.is_some_and(|rev| rev != ctx.key_revision) {
            return false;
        }
        if self.self_type.is_some() && self.self_type != ctx.self_type {
            return false;
        }
        if self.app_type.is_some() && self.app_type != ctx.app_type {
            return false;
        }
        if self.vendor_id.is_some() && self.vendor_id != ctx.vendor_id {
            return false;
        }
        if self.auth_id.is_some() && self.auth_id != ctx.auth_id {
            return false;
        }
        if self.version_min.is_some() || self.version_max.is_some() {
            let version = match ctx.fw_version {
                Some(v) => v,
                None => return false,
            };
            if self.version_min.is_some_and(|min| version < min) {
                return false;
            }
            if self.version_max.is_some_and(|max| version > max) {
                return false;
            }
        }
        true
    }
}

/// One resolved key: symmetric material plus the signing identity
#[derive(Debug, Clone)]
pub struct KeyEntry {
    pub name: String,
    pub key_type: KeyType,
    pub erk: Vec<u8>,
    pub riv: Vec<u8>,
    pub public: Option<[u8; PUBLIC_KEY_SIZE]>,
    pub private: Option<[u8; PRIVATE_KEY_SIZE]>,
    pub curve_id: u8,
    pub curve: Option<Curve>,
}

impl KeyEntry {
    pub fn can_verify(&self) -> bool {
        self.public.is_some() && self.curve.is_some()
    }

    pub fn can_sign(&self) -> bool {
        self.can_verify() && self.private.is_some()
    }

    /// First 16 bytes of the symmetric key, for the AES-128 auxiliary keys
    pub fn key128(&self) -> Result<[u8; 16]> {
        let mut key = [0u8; 16];
        if self.erk.len() < 16 {
            return Err(SceError::KeyNotFound(format!(
                "{} holds {} key bytes, need 16",
                self.name,
                self.erk.len()
            )));
        }
        key.copy_from_slice(&self.erk[..16]);
        Ok(key)
    }
}

/// Raw sources for a registry load
#[derive(Debug, Clone, Default)]
pub struct KeysetSource {
    pub keys: Vec<u8>,
    pub loader_curves: Option<Vec<u8>>,
    pub vsh_curves: Option<Vec<u8>>,
}

impl KeysetSource {
    pub const KEYS_FILE: &'static str = "keys";
    pub const LOADER_CURVES_FILE: &'static str = "ldr_curves";
    pub const VSH_CURVES_FILE: &'static str = "vsh_curves";

    /// Read `keys`, `ldr_curves` and `vsh_curves` from a data directory.
    /// Only the keys document is mandatory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let keys_path = dir.join(Self::KEYS_FILE);
        let keys = std::fs::read(&keys_path).map_err(|e| {
            SceError::Load(format!("could not read {}: {}", keys_path.display(), e))
        })?;

        Ok(Self {
            keys,
            loader_curves: read_optional(&dir.join(Self::LOADER_CURVES_FILE)),
            vsh_curves: read_optional(&dir.join(Self::VSH_CURVES_FILE)),
        })
    }
}

fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "curve table not loaded");
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: Vec<KeyRecord>,
    loader_curves: Vec<Curve>,
    vsh_curves: Vec<Curve>,
}

impl Registry {
    pub fn load(source: &KeysetSource) -> Result<Self> {
        let raw: Vec<KeysetRecord> = serde_json::from_slice(&source.keys)
            .map_err(|e| SceError::Load(format!("keys document: {}", e)))?;
        let records = raw
            .into_iter()
            .map(KeyRecord::from_raw)
            .collect::<Result<Vec<_>>>()?;

        let loader_curves = match &source.loader_curves {
            Some(bytes) => curve::parse_table(bytes, LOADER_CURVE_COUNT, "loader")?,
            None => Vec::new(),
        };
        let vsh_curves = match &source.vsh_curves {
            Some(bytes) => curve::parse_table(bytes, VSH_CURVE_COUNT, "vsh")?,
            None => Vec::new(),
        };

        info!(
            keys = records.len(),
            loader_curves = loader_curves.len(),
            vsh_curves = vsh_curves.len(),
            "keyset loaded"
        );

        Ok(Self {
            records,
            loader_curves,
            vsh_curves,
        })
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        Self::load(&KeysetSource::from_dir(dir)?)
    }

    pub fn records(&self) -> &[KeyRecord] {
        &self.records
    }

    pub fn has_loader_curves(&self) -> bool {
        !self.loader_curves.is_empty()
    }

    pub fn has_vsh_curves(&self) -> bool {
        !self.vsh_curves.is_empty()
    }

    /// First matching record able to verify signatures
    pub fn resolve(&self, ctx: &KeyContext) -> Result<KeyEntry> {
        self.resolve_with(ctx, KeyEntry::can_verify)
    }

    /// First matching record that also carries a private key
    pub fn resolve_for_signing(&self, ctx: &KeyContext) -> Result<KeyEntry> {
        self.resolve_with(ctx, KeyEntry::can_sign)
    }

    fn resolve_with(&self, ctx: &KeyContext, usable: fn(&KeyEntry) -> bool) -> Result<KeyEntry> {
        let entry = self
            .records
            .iter()
            .filter(|record| record.matches(ctx))
            .map(|record| self.entry_for(record))
            .find(usable)
            .ok_or_else(|| SceError::KeyNotFound(ctx.to_string()))?;
        debug!(key = %entry.name, context = %ctx, "key entry selected");
        Ok(entry)
    }

    /// Auxiliary key by record name
    pub fn named(&self, name: &str) -> Result<KeyEntry> {
        self.records
            .iter()
            .find(|record| record.name == name)
            .map(|record| self.entry_for(record))
            .ok_or_else(|| SceError::KeyNotFound(name.to_string()))
    }

    /// Build an entry from raw override bytes, bypassing lookup. A short
    /// override borrows the signing identity from the registry when one
    /// matches `ctx`.
    pub fn override_entry(&self, ctx: &KeyContext, bytes: &[u8]) -> Result<KeyEntry> {
        let (erk, rest) = split_override(bytes)?;
        let riv = rest[..RIV_SIZE].to_vec();

        if bytes.len() == OVERRIDE_SHORT_SIZE {
            let borrowed = self.resolve(ctx).ok();
            return Ok(KeyEntry {
                name: "override".into(),
                key_type: KeyType::for_container(ctx.container_type),
                erk,
                riv,
                public: borrowed.as_ref().and_then(|e| e.public),
                private: borrowed.as_ref().and_then(|e| e.private),
                curve_id: borrowed.as_ref().map(|e| e.curve_id).unwrap_or(0),
                curve: borrowed.and_then(|e| e.curve),
            });
        }

        let mut public = [0u8; PUBLIC_KEY_SIZE];
        public.copy_from_slice(&rest[RIV_SIZE..RIV_SIZE + PUBLIC_KEY_SIZE]);
        let mut private = [0u8; PRIVATE_KEY_SIZE];
        let priv_start = RIV_SIZE + PUBLIC_KEY_SIZE;
        private.copy_from_slice(&rest[priv_start..priv_start + PRIVATE_KEY_SIZE]);
        let curve_id = rest[priv_start + PRIVATE_KEY_SIZE];

        Ok(KeyEntry {
            name: "override".into(),
            key_type: KeyType::for_container(ctx.container_type),
            erk,
            riv,
            public: Some(public),
            private: Some(private),
            curve_id,
            curve: self.loader_curves.get(curve_id as usize).cloned(),
        })
    }

    fn entry_for(&self, record: &KeyRecord) -> KeyEntry {
        let curves = match record.key_type {
            KeyType::Other => &self.vsh_curves,
            _ => &self.loader_curves,
        };
        KeyEntry {
            name: record.name.clone(),
            key_type: record.key_type,
            erk: record.erk.clone(),
            riv: record.riv.clone(),
            public: record.public,
            private: record.private,
            curve_id: record.curve_id,
            curve: curves.get(record.curve_id as usize).cloned(),
        }
    }
}

fn split_override(bytes: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    if bytes.len() != OVERRIDE_SHORT_SIZE && bytes.len() != OVERRIDE_FULL_SIZE {
        return Err(SceError::InvalidArgument(format!(
            "keyset override must be {} or {} bytes, got {}",
            OVERRIDE_SHORT_SIZE,
            OVERRIDE_FULL_SIZE,
            bytes.len()
        )));
    }
    Ok((bytes[..ERK_SIZE].to_vec(), &bytes[ERK_SIZE..]))
}

fn decode_hex(name: &str, field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim())
        .map_err(|e| SceError::Load(format!("{}: {} is not valid hex: {}", name, field, e)))
}

fn expect_len(name: &str, field: &str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(SceError::Load(format!(
            "{}: {} must be {} bytes, got {}",
            name,
            field,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

fn decode_fixed<const N: usize>(name: &str, field: &str, value: &str) -> Result<[u8; N]> {
    let bytes = decode_hex(name, field, value)?;
    expect_len(name, field, &bytes, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_hex_u64(name: &str, field: &str, value: Option<&str>) -> Result<Option<u64>> {
    value
        .map(|v| {
            u64::from_str_radix(v.trim().trim_start_matches("0x"), 16)
                .map_err(|e| SceError::Load(format!("{}: {}: {}", name, field, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    fn app_context(revision: u16) -> KeyContext {
        KeyContext {
            container_type: ContainerType::LoadableImage,
            key_revision: revision,
            self_type: Some(SelfType::App),
            fw_version: Some(0x0003_0041_0000_0000),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_and_resolve() {
        let registry = testkit::registry();
        let entry = registry.resolve(&app_context(0)).unwrap();
        assert_eq!(entry.name, "app-rev0");
        assert_eq!(entry.erk.len(), ERK_SIZE);
        assert!(entry.can_sign());
    }

    #[test]
    fn test_resolve_is_repeatable() {
        let registry = testkit::registry();
        let a = registry.resolve(&app_context(1)).unwrap();
        let b = registry.resolve(&app_context(1)).unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(a.erk, b.erk);
    }

    #[test]
    fn test_first_match_wins() {
        let registry = testkit::registry();
        // Both the revision-specific and the wildcard record match; the earlier one wins.
        let entry = registry.resolve(&app_context(1)).unwrap();
        assert_eq!(entry.name, "app-rev1");
    }

    #[test]
    fn test_resolve_unknown_revision_falls_to_wildcard() {
        let registry = testkit::registry();
        let entry = registry.resolve(&app_context(0x42)).unwrap();
        assert_eq!(entry.name, "app-any");
    }

    #[test]
    fn test_key_not_found() {
        let registry = testkit::registry();
        let ctx = KeyContext {
            container_type: ContainerType::SecurePayload,
            key_revision: 7,
            ..Default::default()
        };
        assert!(matches!(registry.resolve(&ctx), Err(SceError::KeyNotFound(_))));
    }

    #[test]
    fn test_signing_requires_private_key() {
        let mut records = testkit::keyset_records();
        for record in &mut records {
            record.private = None;
        }
        let registry = testkit::registry_from_records(&records);
        assert!(registry.resolve(&app_context(0)).is_ok());
        assert!(matches!(
            registry.resolve_for_signing(&app_context(0)),
            Err(SceError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_record_without_curve_is_skipped() {
        let mut records = testkit::keyset_records();
        records[0].ctype = 200;
        let registry = testkit::registry_from_records(&records);
        // app-rev0 has no usable curve, so the wildcard entry answers instead.
        let entry = registry.resolve(&app_context(0)).unwrap();
        assert_eq!(entry.name, "app-any");
    }

    #[test]
    fn test_version_range() {
        let mut record = testkit::keyset_records().remove(0);
        record.version_min = Some("0003005000000000".into());
        let registry = testkit::registry_from_records(&[record]);
        assert!(registry.resolve(&app_context(0)).is_err());

        let mut ctx = app_context(0);
        ctx.fw_version = Some(0x0003_0055_0000_0000);
        assert!(registry.resolve(&ctx).is_ok());

        ctx.fw_version = None;
        assert!(registry.resolve(&ctx).is_err());
    }

    #[test]
    fn test_load_rejects_bad_field_size() {
        let mut records = testkit::keyset_records();
        records[0].erk = "00112233".into();
        let source = testkit::keyset_source(&records);
        assert!(matches!(Registry::load(&source), Err(SceError::Load(_))));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let source = KeysetSource {
            keys: b"{ not json".to_vec(),
            ..Default::default()
        };
        assert!(matches!(Registry::load(&source), Err(SceError::Load(_))));
    }

    #[test]
    fn test_load_rejects_bad_curve_table() {
        let mut source = testkit::keyset_source(&testkit::keyset_records());
        source.vsh_curves = Some(vec![0u8; 10]);
        assert!(matches!(Registry::load(&source), Err(SceError::Load(_))));
    }

    #[test]
    fn test_named_key() {
        let registry = testkit::registry();
        let klic = registry.named(NP_KLIC_FREE).unwrap();
        assert_eq!(klic.key128().unwrap().len(), 16);
        assert!(registry.named("missing").is_err());
        assert!(registry.named(NP_SIG).unwrap().can_sign());
    }

    #[test]
    fn test_full_override() {
        let registry = testkit::registry();
        let mut bytes = vec![0x11u8; ERK_SIZE];
        bytes.extend_from_slice(&[0x22; RIV_SIZE]);
        bytes.extend_from_slice(&[0x33; PUBLIC_KEY_SIZE]);
        bytes.extend_from_slice(&[0x44; PRIVATE_KEY_SIZE]);
        bytes.push(testkit::LOADER_CURVE_ID);

        let entry = registry.override_entry(&app_context(0), &bytes).unwrap();
        assert_eq!(entry.erk, vec![0x11; ERK_SIZE]);
        assert_eq!(entry.riv, vec![0x22; RIV_SIZE]);
        assert_eq!(entry.public, Some([0x33; PUBLIC_KEY_SIZE]));
        assert!(entry.curve.is_some());
    }

    #[test]
    fn test_short_override_borrows_identity() {
        let registry = testkit::registry();
        let bytes = vec![0x5Au8; OVERRIDE_SHORT_SIZE];
        let entry = registry.override_entry(&app_context(0), &bytes).unwrap();
        let resolved = registry.resolve(&app_context(0)).unwrap();
        assert_eq!(entry.erk, vec![0x5A; ERK_SIZE]);
        assert_eq!(entry.public, resolved.public);
    }

    #[test]
    fn test_override_rejects_bad_length() {
        let registry = testkit::registry();
        assert!(registry.override_entry(&app_context(0), &[0u8; 50]).is_err());
    }
}
