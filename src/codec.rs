//! Codec facade: the decode and encode state machines.
//!
//! ```text
//! decode: Start -> HeaderParsed -> SignatureVerified -> MetadataDecrypted
//!               -> SectionsProcessed -> Done
//! encode: Start -> ExecutableParsed -> SectionsBuilt -> MetadataBuilt
//!               -> HeaderBuilt -> Signed -> Done
//! ```
//!
//! Any failure moves to `Failed` and aborts; no partial output is returned.
//! Decode checks the main signature, and for NPDRM images the license block,
//! before a single byte is decrypted.

use crate::config::{DecodeOverrides, EncodeAttributes, KeyOverrides};
use crate::error::{IntegrityError, Result, SceError, Stage};
use crate::header::{
    align16, ContainerHeader, ContainerType, HeaderAttributes, SelfType, SIGNATURE_SIZE,
};
use crate::image::elf::parse_ehdr;
use crate::image::extended::CONTROL_FLAGS_SIZE;
use crate::image::{transform, AppInfo, ExecutableImage, ImageHeader, SectionPlan};
use crate::keyset::{KeyContext, KeyEntry, Registry};
use crate::license::{
    Klicensee, LicenseBlock, LicenseInfo, LicenseWrapper, LICENSE_BLOCK_SIZE,
    LICENSE_TRAILER_SIZE,
};
use crate::metadata::{
    self, decrypt_metadata_with_info, encrypt_body, Metadata, MetadataInfo,
    OptionalHeader, SectionKeys, SectionType, METADATA_INFO_SIZE,
};
use crate::pipeline::{SectionJob, SectionProcessor};
use crate::report::DecodeReport;
use crate::signature::{self, Signature};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Start,
    HeaderParsed,
    SignatureVerified,
    MetadataDecrypted,
    SectionsProcessed,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Start,
    ExecutableParsed,
    SectionsBuilt,
    MetadataBuilt,
    HeaderBuilt,
    Signed,
    Done,
    Failed,
}

trait PipelineState: Copy + Debug + PartialEq {
    const FAILED: Self;
}

impl PipelineState for DecodeState {
    const FAILED: Self = DecodeState::Failed;
}

impl PipelineState for EncodeState {
    const FAILED: Self = EncodeState::Failed;
}

/// Tracks and logs the current state of one operation
struct Machine<S: PipelineState> {
    operation: &'static str,
    state: S,
}

impl<S: PipelineState> Machine<S> {
    fn new(operation: &'static str, start: S) -> Self {
        debug!(operation, state = ?start, "pipeline started");
        Self {
            operation,
            state: start,
        }
    }

    fn advance(&mut self, next: S) {
        debug!(operation = self.operation, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn fail(&mut self, error: &SceError) {
        warn!(operation = self.operation, from = ?self.state, %error, "pipeline failed");
        self.state = S::FAILED;
    }
}

/// Plaintext, key-free view of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub container_type: ContainerType,
    pub key_revision: u16,
    pub header_len: u64,
    pub total_len: u64,
    pub app_info: Option<AppInfo>,
    pub segment_count: usize,
    pub fw_version: Option<u64>,
    pub control_flags: Option<[u8; CONTROL_FLAGS_SIZE]>,
    pub license: Option<LicenseInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPayload {
    Executable {
        image: ExecutableImage,
        bytes: Vec<u8>,
    },
    Raw(Vec<u8>),
}

impl DecodedPayload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            DecodedPayload::Executable { bytes, .. } => bytes,
            DecodedPayload::Raw(bytes) => bytes,
        }
    }

    pub fn executable(&self) -> Option<&ExecutableImage> {
        match self {
            DecodedPayload::Executable { image, .. } => Some(image),
            DecodedPayload::Raw(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decoded {
    pub payload: DecodedPayload,
    pub license: Option<LicenseInfo>,
    pub report: DecodeReport,
}

/// Where the plaintext parts of a container sit
struct Framing<'a> {
    header: ContainerHeader,
    metadata_block: &'a [u8],
    image_header: Option<ImageHeader>,
    signed_len: usize,
    license: Option<LicenseBlock>,
}

fn frame(input: &[u8]) -> Result<Framing<'_>> {
    let (header, metadata_block) = ContainerHeader::parse(input)?;
    let image_header = match header.container_type {
        ContainerType::LoadableImage => Some(ImageHeader::parse(input, &header)?),
        _ => None,
    };
    let npdrm = image_header
        .as_ref()
        .is_some_and(|h| h.app_info.self_type == SelfType::Npdrm);
    let trailer = SIGNATURE_SIZE + if npdrm { LICENSE_TRAILER_SIZE } else { 0 };
    let signed_len = header.signed_len(trailer as u64)?;
    let license = if npdrm {
        let start = signed_len + SIGNATURE_SIZE;
        Some(LicenseBlock::from_bytes(&input[start..start + LICENSE_BLOCK_SIZE])?)
    } else {
        None
    };
    Ok(Framing {
        header,
        metadata_block,
        image_header,
        signed_len,
        license,
    })
}

fn key_context(header: &ContainerHeader, image: Option<&ImageHeader>, license: Option<&LicenseBlock>) -> KeyContext {
    KeyContext {
        container_type: header.container_type,
        key_revision: header.key_revision,
        self_type: image.map(|h| h.app_info.self_type),
        app_type: license.map(|l| l.app_type),
        vendor_id: image.map(|h| h.app_info.vendor_id),
        auth_id: image.map(|h| h.app_info.auth_id),
        fw_version: image.and_then(|h| h.elf_digest()).map(|(_, fw)| fw),
    }
}

/// Header-level attributes, no key material needed
pub fn inspect(input: &[u8]) -> Result<ContainerSummary> {
    let framing = frame(input)?;
    let image = framing.image_header.as_ref();
    Ok(ContainerSummary {
        container_type: framing.header.container_type,
        key_revision: framing.header.key_revision,
        header_len: framing.header.header_len,
        total_len: framing.header.total_len,
        app_info: image.map(|h| h.app_info),
        segment_count: image.map(|h| h.segment_infos.len()).unwrap_or(0),
        fw_version: image.and_then(|h| h.elf_digest()).map(|(_, fw)| fw),
        control_flags: image.and_then(|h| h.control_flags()).copied(),
        license: framing.license.as_ref().map(LicenseBlock::info),
    })
}

pub struct Codec<'r> {
    registry: &'r Registry,
}

impl<'r> Codec<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    pub fn inspect(&self, input: &[u8]) -> Result<ContainerSummary> {
        inspect(input)
    }

    fn select_key(&self, ctx: &KeyContext, keyset: Option<&[u8]>, signing: bool) -> Result<KeyEntry> {
        match keyset {
            Some(bytes) => self.registry.override_entry(ctx, bytes),
            None if signing => self.registry.resolve_for_signing(ctx),
            None => self.registry.resolve(ctx),
        }
    }

    pub fn decode(&self, input: &[u8], overrides: &DecodeOverrides) -> Result<Decoded> {
        let mut machine = Machine::new("decode", DecodeState::Start);
        let result = self.run_decode(input, overrides, &mut machine);
        match &result {
            Ok(decoded) => {
                machine.advance(DecodeState::Done);
                info!(
                    container_type = decoded.report.header.container_type.name(),
                    bytes = decoded.payload.bytes().len(),
                    "container decoded"
                );
            }
            Err(e) => machine.fail(e),
        }
        result
    }

    fn run_decode(
        &self,
        input: &[u8],
        overrides: &DecodeOverrides,
        machine: &mut Machine<DecodeState>,
    ) -> Result<Decoded> {
        let framing = frame(input)?;
        let signed_len = framing.signed_len;
        machine.advance(DecodeState::HeaderParsed);

        let ctx = key_context(
            &framing.header,
            framing.image_header.as_ref(),
            framing.license.as_ref(),
        );
        let entry = self.select_key(&ctx, overrides.keyset.as_deref(), false)?;

        let main_signature = &input[signed_len..signed_len + SIGNATURE_SIZE];
        let signature = Signature::from_bytes(main_signature, entry.curve_id)?;
        if !signature::verify(&input[..signed_len], &signature, &entry)? {
            return Err(IntegrityError::SignatureInvalid.into());
        }

        let mut license_layer: Option<(LicenseWrapper, Klicensee)> = None;
        if let Some(block) = &framing.license {
            let wrapper = LicenseWrapper::from_registry(self.registry)?;
            let footer = signed_len + SIGNATURE_SIZE + LICENSE_BLOCK_SIZE;
            let license_signature =
                Signature::from_bytes(&input[footer..footer + SIGNATURE_SIZE], wrapper.curve_id())?;
            wrapper.verify(main_signature, block, &license_signature)?;

            match wrapper.klicensee(block.license_type, overrides.klicensee) {
                Ok(klicensee) => {
                    let content_id = wrapper.unwrap(block, &klicensee)?;
                    debug!(%content_id, "license accepted");
                    license_layer = Some((wrapper, klicensee));
                }
                // A supplied metadata info never needs the license key.
                Err(_) if overrides.meta_info.is_some() => {}
                Err(e) => return Err(e),
            }
        }
        machine.advance(DecodeState::SignatureVerified);

        let info = match &overrides.meta_info {
            Some(plain) => MetadataInfo::from_bytes(plain)?,
            None => {
                let sealed = &framing.metadata_block[..METADATA_INFO_SIZE];
                match &license_layer {
                    Some((wrapper, klicensee)) => {
                        metadata::open_info(&wrapper.open_info(sealed, klicensee)?, &entry)?
                    }
                    None => metadata::open_info(sealed, &entry)?,
                }
            }
        };
        let mut metadata = decrypt_metadata_with_info(framing.metadata_block, info)?;
        if metadata.header.sig_input_length != signed_len as u64 {
            return Err(SceError::format(
                Stage::Metadata,
                format!(
                    "signed length 0x{:x} disagrees with container (0x{:x})",
                    metadata.header.sig_input_length, signed_len
                ),
            ));
        }
        machine.advance(DecodeState::MetadataDecrypted);

        metadata.check_layout(framing.header.header_len, signed_len as u64)?;
        if let Some(image_header) = &framing.image_header {
            transform::attach_segment_lengths(image_header, &mut metadata)?;
        }
        let sections = SectionProcessor::new(overrides.threads).open_all(input, &metadata)?;
        machine.advance(DecodeState::SectionsProcessed);

        let payload = match &framing.image_header {
            Some(image_header) => {
                let section_headers = carried_section_headers(input, image_header, signed_len)?;
                let image =
                    transform::reconstruct(image_header, &metadata, &sections, section_headers)?;
                DecodedPayload::Executable {
                    bytes: image.to_bytes(),
                    image,
                }
            }
            None => DecodedPayload::Raw(join_chunks(&metadata, sections)?),
        };

        let license = framing.license.as_ref().map(LicenseBlock::info);
        let report = DecodeReport {
            header: framing.header,
            image_header: framing.image_header,
            key_name: entry.name.clone(),
            metadata,
            signature,
            license: license.clone(),
            payload_len: payload.bytes().len(),
            raw: false,
        };
        Ok(Decoded {
            payload,
            license,
            report,
        })
    }

    pub fn encode(&self, input: &[u8], attrs: &EncodeAttributes, keys: &KeyOverrides) -> Result<Vec<u8>> {
        let mut machine = Machine::new("encode", EncodeState::Start);
        let result = self.run_encode(input, attrs, keys, &mut machine);
        match &result {
            Ok(bytes) => {
                machine.advance(EncodeState::Done);
                info!(
                    container_type = attrs.container_type.name(),
                    bytes = bytes.len(),
                    "container encoded"
                );
            }
            Err(e) => machine.fail(e),
        }
        result
    }

    fn run_encode(
        &self,
        input: &[u8],
        attrs: &EncodeAttributes,
        keys: &KeyOverrides,
        machine: &mut Machine<EncodeState>,
    ) -> Result<Vec<u8>> {
        attrs.validate()?;
        let options = attrs.transform_options();

        let image = match attrs.container_type {
            ContainerType::LoadableImage => Some(ExecutableImage::parse(input)?),
            _ => None,
        };
        let plans: Vec<SectionPlan> = match &image {
            Some(image) => transform::plan_sections(image, &options)?,
            None => input
                .chunks(attrs.chunk_size)
                .enumerate()
                .map(|(i, chunk)| SectionPlan {
                    section_type: SectionType::Segment,
                    index: i as u32,
                    data: chunk,
                    encrypt: true,
                    compress: attrs.compress,
                })
                .collect(),
        };
        machine.advance(EncodeState::ExecutableParsed);

        let ctx = KeyContext {
            container_type: attrs.container_type,
            key_revision: attrs.key_revision,
            self_type: image.as_ref().map(|_| attrs.self_type),
            app_type: attrs.license.as_ref().filter(|_| attrs.is_npdrm()).map(|l| l.app_type),
            vendor_id: image.as_ref().map(|_| attrs.vendor_id),
            auth_id: image.as_ref().map(|_| attrs.auth_id),
            fw_version: image.as_ref().map(|_| attrs.fw_version),
        };
        let entry = self.select_key(&ctx, keys.keyset.as_deref(), true)?;

        let info = match &keys.meta_info {
            Some(plain) => MetadataInfo::from_bytes(plain)?,
            None => MetadataInfo::generate(attrs.key_policy, &entry, &derivation_seed(attrs, input)),
        };
        let section_keys: Vec<SectionKeys> = (0..plans.len())
            .map(|position| SectionKeys::generate(attrs.key_policy, &info, position as u32))
            .collect();
        let jobs: Vec<SectionJob> = plans
            .iter()
            .zip(&section_keys)
            .map(|(plan, keys)| SectionJob {
                section_type: plan.section_type,
                index: plan.index,
                data: plan.data,
                encrypt: plan.encrypt,
                compress: plan.compress,
                keys: keys.clone(),
            })
            .collect();
        let sealed = SectionProcessor::new(attrs.threads).seal_all(&jobs)?;
        machine.advance(EncodeState::SectionsBuilt);

        let mut optional_headers = Vec::new();
        if let Some(flags) = attrs.capability_flags {
            optional_headers.push(OptionalHeader::CapabilityFlags(flags));
        }
        if let Some(seed) = &attrs.individuals_seed {
            optional_headers.push(OptionalHeader::IndividualsSeed(seed.clone()));
        }
        let descriptors = sealed.iter().map(|s| s.descriptor.clone()).collect();
        let mut metadata = Metadata::assemble(info, descriptors, &section_keys, optional_headers);

        let mut image_header = image.as_ref().map(|image| {
            let app_info = AppInfo {
                auth_id: attrs.auth_id,
                vendor_id: attrs.vendor_id,
                self_type: attrs.self_type,
                version: attrs.app_version,
            };
            transform::image_header(image, app_info, attrs.control_flags, attrs.fw_version, &options)
        });
        let extended_len = image_header.as_ref().map(|h| h.encoded_len()).unwrap_or(0);
        let trailer = SIGNATURE_SIZE + if attrs.is_npdrm() { LICENSE_TRAILER_SIZE } else { 0 };

        let header_len = align16((ContainerHeader::SIZE + extended_len + metadata.encoded_len()) as u64);
        let mut cursor = header_len;
        for descriptor in &mut metadata.sections {
            descriptor.offset = cursor;
            cursor = align16(cursor + descriptor.data_size);
        }
        let carried_shdrs = image
            .as_ref()
            .filter(|_| options.add_section_headers)
            .and_then(|i| i.section_headers.as_ref());
        if let (Some(header), Some(shdrs)) = (image_header.as_mut(), carried_shdrs) {
            header.shdr_offset = cursor;
            cursor = align16(cursor + shdrs.len() as u64);
        }
        if let Some(header) = image_header.as_mut() {
            transform::restate_segments(header, &metadata.sections);
        }

        let attributes = HeaderAttributes {
            container_type: attrs.container_type,
            key_revision: attrs.key_revision,
            extended_len: extended_len as u32,
            trailer_len: trailer as u64,
        };
        let header = ContainerHeader::build(&attributes, metadata.encoded_len() as u64, cursor - header_len);
        let signed_len = header.signed_len(trailer as u64)?;
        metadata.header.sig_input_length = signed_len as u64;
        machine.advance(EncodeState::MetadataBuilt);

        let license = match (&attrs.license, attrs.is_npdrm()) {
            (Some(params), true) => {
                let wrapper = LicenseWrapper::from_registry(self.registry)?;
                let klicensee = wrapper.klicensee(params.license_type, keys.klicensee)?;
                Some((wrapper, klicensee, params))
            }
            _ => None,
        };

        let mut sealed_info = metadata::seal_info(&metadata.info, &entry)?.to_vec();
        if let Some((wrapper, klicensee, _)) = &license {
            sealed_info = wrapper.seal_info(&sealed_info, klicensee)?;
        }

        let mut out = Vec::with_capacity(header.total_len as usize);
        out.extend_from_slice(&header.to_bytes());
        if let Some(image_header) = &image_header {
            out.extend_from_slice(&image_header.to_bytes());
        }
        out.extend_from_slice(&sealed_info);
        out.extend_from_slice(&encrypt_body(&metadata)?);
        for (descriptor, section) in metadata.sections.iter().zip(&sealed) {
            out.resize(descriptor.offset as usize, 0);
            out.extend_from_slice(&section.payload);
        }
        if let (Some(header), Some(shdrs)) = (&image_header, carried_shdrs) {
            out.resize(header.shdr_offset as usize, 0);
            out.extend_from_slice(shdrs);
        }
        out.resize(signed_len, 0);
        machine.advance(EncodeState::HeaderBuilt);

        let signature = signature::sign(&out, &entry)?;
        let main_signature = signature.to_bytes();
        out.extend_from_slice(&main_signature);
        if let Some((wrapper, klicensee, params)) = &license {
            let block = wrapper.wrap(params, klicensee, input)?;
            let license_signature = wrapper.sign(&main_signature, &block)?;
            out.extend_from_slice(&block.to_bytes());
            out.extend_from_slice(&license_signature.to_bytes());
        }
        machine.advance(EncodeState::Signed);

        if out.len() as u64 != header.total_len {
            return Err(SceError::format(
                Stage::Header,
                format!("built {} bytes, header declares {}", out.len(), header.total_len),
            ));
        }
        debug!(key = %entry.name, sections = metadata.sections.len(), "container assembled");
        Ok(out)
    }
}

/// Input to derived key material: the attributes that shape the container
/// plus a digest of the payload
fn derivation_seed(attrs: &EncodeAttributes, input: &[u8]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(&attrs.container_type.to_u16().to_be_bytes());
    seed.extend_from_slice(&attrs.key_revision.to_be_bytes());
    seed.extend_from_slice(&attrs.self_type.to_u32().to_be_bytes());
    seed.extend_from_slice(&attrs.auth_id.to_be_bytes());
    seed.extend_from_slice(&attrs.vendor_id.to_be_bytes());
    seed.extend_from_slice(&attrs.app_version.to_be_bytes());
    seed.extend_from_slice(&attrs.fw_version.to_be_bytes());
    seed.extend_from_slice(&Sha256::digest(input));
    seed
}

/// ELF section header table stored after the payloads, if any
fn carried_section_headers(input: &[u8], header: &ImageHeader, signed_len: usize) -> Result<Option<Vec<u8>>> {
    if header.shdr_offset == 0 {
        return Ok(None);
    }
    let (ehdr, _, _) = parse_ehdr(&header.ehdr)?;
    let len = ehdr.e_shnum as u64 * ehdr.e_shentsize as u64;
    let start = header.shdr_offset;
    if start.checked_add(len).map_or(true, |end| end > signed_len as u64) {
        return Err(SceError::format(
            Stage::Executable,
            format!("section headers at 0x{:x}+0x{:x} outside the signed range", start, len),
        ));
    }
    Ok(Some(input[start as usize..(start + len) as usize].to_vec()))
}

/// Raw payload: chunks in index order, which must be 0..n
fn join_chunks(metadata: &Metadata, sections: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    let mut indexed: Vec<(u32, Vec<u8>)> = metadata
        .sections
        .iter()
        .map(|d| d.index)
        .zip(sections)
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    for (expected, (index, _)) in indexed.iter().enumerate() {
        if *index as usize != expected {
            return Err(SceError::format(
                Stage::Metadata,
                format!("payload chunk {} missing (found {})", expected, index),
            ));
        }
    }
    Ok(indexed.into_iter().flat_map(|(_, data)| data).collect())
}
