//! Human-readable diagnostics for decoded containers, plaintext summaries
//! and the keyset listing.

use crate::codec::ContainerSummary;
use crate::header::ContainerHeader;
use crate::image::{ControlInfo, ImageHeader};
use crate::keyset::Registry;
use crate::license::LicenseInfo;
use crate::metadata::{Metadata, OptionalHeader};
use crate::signature::Signature;
use std::fmt::{self, Write};

/// Everything decode learned on the way to the payload
#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub header: ContainerHeader,
    pub image_header: Option<ImageHeader>,
    pub key_name: String,
    pub metadata: Metadata,
    pub signature: Signature,
    pub license: Option<LicenseInfo>,
    pub payload_len: usize,
    /// Also dump key material and raw structures
    pub raw: bool,
}

impl DecodeReport {
    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn write_header(f: &mut fmt::Formatter<'_>, header: &ContainerHeader) -> fmt::Result {
    writeln!(f, "SCE Header:")?;
    writeln!(f, "  Version: {}", header.version)?;
    writeln!(f, "  Key revision: 0x{:04x}", header.key_revision)?;
    writeln!(f, "  Type: {}", header.container_type.name())?;
    writeln!(f, "  Metadata offset: 0x{:x}", header.metadata_offset)?;
    writeln!(f, "  Header length: 0x{:x}", header.header_len)?;
    writeln!(f, "  Total length: 0x{:x} ({})", header.total_len, format_size(header.total_len))?;
    writeln!(f)
}

fn write_image_header(f: &mut fmt::Formatter<'_>, image: &ImageHeader) -> fmt::Result {
    let app = &image.app_info;
    writeln!(f, "Application Info:")?;
    writeln!(f, "  Auth ID: 0x{:016x}", app.auth_id)?;
    writeln!(f, "  Vendor ID: 0x{:08x}", app.vendor_id)?;
    writeln!(f, "  Type: {:?}", app.self_type)?;
    writeln!(f, "  Version: {:016x}", app.version)?;
    writeln!(f)?;

    writeln!(f, "Segments ({}):", image.segment_infos.len())?;
    writeln!(f, "  Idx  Offset      Size        Comp  Enc   Perm")?;
    for (i, info) in image.segment_infos.iter().enumerate() {
        let perm = (image.permissions >> (3 * i)) & 0x7;
        writeln!(
            f,
            "  {:03}  0x{:08x}  0x{:08x}  {:<4}  {:<4}  {}{}{}",
            i,
            info.offset,
            info.size,
            yes_no(info.compressed),
            yes_no(info.encrypted),
            if perm & 4 != 0 { 'R' } else { '-' },
            if perm & 2 != 0 { 'W' } else { '-' },
            if perm & 1 != 0 { 'X' } else { '-' },
        )?;
    }
    if image.shdr_offset != 0 {
        writeln!(f, "  Section headers at 0x{:x}", image.shdr_offset)?;
    }
    writeln!(f)?;

    if !image.control_infos.is_empty() {
        writeln!(f, "Control Info:")?;
        for info in &image.control_infos {
            match info {
                ControlInfo::Flags(flags) => writeln!(f, "  Flags: {}", hex::encode(flags))?,
                ControlInfo::Digest {
                    elf_digest,
                    fw_version,
                    ..
                } => {
                    writeln!(f, "  ELF digest: {}", hex::encode(elf_digest))?;
                    writeln!(f, "  FW version: {:016x}", fw_version)?;
                }
                ControlInfo::Unknown { kind, data } => {
                    writeln!(f, "  Type {} ({} bytes)", kind, data.len())?
                }
            }
        }
        writeln!(f)?;
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn write_license(f: &mut fmt::Formatter<'_>, license: &LicenseInfo) -> fmt::Result {
    writeln!(f, "License:")?;
    writeln!(f, "  Type: {:?}", license.license_type)?;
    writeln!(f, "  Application type: {:?}", license.app_type)?;
    writeln!(f, "  Content ID: {}", license.content_id)?;
    writeln!(f, "  Real filename: {}", license.real_filename)?;
    writeln!(f)
}

impl fmt::Display for DecodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SCE Container Information")?;
        writeln!(f, "=========================")?;
        writeln!(f)?;
        write_header(f, &self.header)?;
        if let Some(image) = &self.image_header {
            write_image_header(f, image)?;
        }
        if let Some(license) = &self.license {
            write_license(f, license)?;
        }

        let meta = &self.metadata;
        writeln!(f, "Metadata:")?;
        writeln!(f, "  Key: {}", self.key_name)?;
        writeln!(f, "  Signed length: 0x{:x}", meta.header.sig_input_length)?;
        writeln!(f, "  Sections: {}", meta.header.section_count)?;
        writeln!(f, "  Key slots: {}", meta.header.key_count)?;
        if self.raw {
            writeln!(f, "  Info key: {}", hex::encode(meta.info.key))?;
            writeln!(f, "  Info IV: {}", hex::encode(meta.info.iv))?;
        }
        writeln!(f)?;

        writeln!(f, "Sections:")?;
        writeln!(f, "  Idx  Type            Offset      Size        Hash  Enc   Comp")?;
        for section in &meta.sections {
            writeln!(
                f,
                "  {:03}  {:<14}  0x{:08x}  0x{:08x}  {:<4}  {:<4}  {}",
                section.index,
                format!("{:?}", section.section_type),
                section.offset,
                section.data_size,
                yes_no(section.hashed),
                yes_no(section.encrypted),
                yes_no(section.compressed),
            )?;
            if self.raw {
                writeln!(f, "       digest {}", hex::encode(section.digest))?;
            }
        }
        writeln!(f)?;

        for header in &meta.optional_headers {
            match header {
                OptionalHeader::CapabilityFlags(flags) => {
                    writeln!(f, "Capability flags: {}", hex::encode(flags))?
                }
                OptionalHeader::IndividualsSeed(seed) => {
                    writeln!(f, "Individuals seed: {} bytes", seed.len())?
                }
                OptionalHeader::Unknown { kind, data } => {
                    writeln!(f, "Optional header type {}: {} bytes", kind, data.len())?
                }
            }
        }

        if self.raw {
            writeln!(f, "Key slots:")?;
            for (i, slot) in meta.keys.iter().enumerate() {
                writeln!(f, "  {:03}: {}", i, hex::encode(slot))?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Signature:")?;
        writeln!(f, "  Curve: 0x{:02x}", self.signature.curve_id)?;
        writeln!(f, "  R: {}", hex::encode(self.signature.r))?;
        writeln!(f, "  S: {}", hex::encode(self.signature.s))?;
        writeln!(f, "  Status: OK")?;
        writeln!(f)?;

        writeln!(f, "Payload: {}", format_size(self.payload_len as u64))
    }
}

impl fmt::Display for ContainerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SCE Container Summary")?;
        writeln!(f, "=====================")?;
        writeln!(f)?;
        writeln!(f, "Type: {}", self.container_type.name())?;
        writeln!(f, "Key revision: 0x{:04x}", self.key_revision)?;
        writeln!(f, "Header length: 0x{:x}", self.header_len)?;
        writeln!(f, "Total length: 0x{:x} ({})", self.total_len, format_size(self.total_len))?;
        if let Some(app) = &self.app_info {
            writeln!(f, "Image type: {:?}", app.self_type)?;
            writeln!(f, "Auth ID: 0x{:016x}", app.auth_id)?;
            writeln!(f, "Vendor ID: 0x{:08x}", app.vendor_id)?;
            writeln!(f, "App version: {:016x}", app.version)?;
            writeln!(f, "Segments: {}", self.segment_count)?;
        }
        if let Some(fw) = self.fw_version {
            writeln!(f, "FW version: {:016x}", fw)?;
        }
        if let Some(license) = &self.license {
            writeln!(f)?;
            write_license(f, license)?;
        }
        Ok(())
    }
}

/// One line per keyset record, in resolution order
pub fn keyset_listing(registry: &Registry) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Keyset ({} records)", registry.records().len());
    let _ = writeln!(out, "  Name                      Type   Rev     Self type  Pub  Priv  Curve");
    for record in registry.records() {
        let _ = writeln!(
            out,
            "  {:<24}  {:<5}  {:<6}  {:<9}  {:<3}  {:<4}  0x{:02x}",
            record.name,
            record.key_type.name(),
            record
                .revision
                .map(|r| format!("0x{:04x}", r))
                .unwrap_or_else(|| "*".into()),
            record
                .self_type
                .map(|t| format!("{:?}", t))
                .unwrap_or_else(|| "*".into()),
            yes_no(record.public.is_some()),
            yes_no(record.private.is_some()),
            record.curve_id,
        );
    }
    if !registry.has_loader_curves() {
        let _ = writeln!(out, "  (no loader curves loaded)");
    }
    if !registry.has_vsh_curves() {
        let _ = writeln!(out, "  (no vsh curves loaded)");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(100), "100 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_keyset_listing() {
        let listing = keyset_listing(&testkit::registry());
        assert!(listing.contains("app-rev0"));
        assert!(listing.contains("NP_sig"));
        assert!(listing.starts_with("Keyset (13 records)"));
        assert!(!listing.contains("no loader curves"));
    }
}
