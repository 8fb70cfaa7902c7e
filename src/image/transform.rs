use crate::error::{Result, SceError, Stage, TransformError};
use crate::image::elf::{parse_ehdr, ElfClass, ExecutableImage, ProgramSegment};
use crate::image::extended::{
    permissions_word, AppInfo, ControlInfo, ImageHeader, SegmentInfo, CONTROL_FLAGS_SIZE,
    ELF_DIGEST_SIZE, MAX_PROGRAM_HEADERS,
};
use crate::metadata::{Metadata, SectionDescriptor, SectionType};
use goblin::elf::program_header::ProgramHeader;
use sha1::{Digest, Sha1};
use tracing::debug;

/// Fixed prefix of the executable digest control info
const DIGEST_CONSTANT: [u8; ELF_DIGEST_SIZE] = [
    0x62, 0x7C, 0xB1, 0x80, 0x8A, 0xB9, 0x38, 0xE3, 0x2C, 0x8C, 0x09, 0x17, 0x08, 0x72, 0x6A,
    0x57, 0x9E, 0x25, 0x86, 0xE4,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// Store non-loadable segments unencrypted
    pub skip_sections: bool,
    /// Carry the ELF section header table after the payloads
    pub add_section_headers: bool,
    /// Try zlib on loadable segments
    pub compress: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            skip_sections: true,
            add_section_headers: true,
            compress: false,
        }
    }
}

/// One segment scheduled to become a section
#[derive(Debug, Clone, Copy)]
pub struct SectionPlan<'a> {
    pub section_type: SectionType,
    pub index: u32,
    pub data: &'a [u8],
    pub encrypt: bool,
    pub compress: bool,
}

/// Map segments with file data to sections, ascending by virtual address
/// with ties broken by program header index.
pub fn plan_sections<'a>(
    image: &'a ExecutableImage,
    options: &TransformOptions,
) -> Result<Vec<SectionPlan<'a>>> {
    if image.segments.len() > MAX_PROGRAM_HEADERS {
        return Err(TransformError::UnsupportedSegmentLayout(format!(
            "{} program headers, the container holds at most {}",
            image.segments.len(),
            MAX_PROGRAM_HEADERS
        ))
        .into());
    }

    let mut segments: Vec<&ProgramSegment> =
        image.segments.iter().filter(|s| s.file_size > 0).collect();
    segments.sort_by_key(|s| (s.vaddr, s.index));

    let plans: Vec<SectionPlan> = segments
        .into_iter()
        .map(|segment| {
            let loadable = segment.is_loadable();
            SectionPlan {
                section_type: SectionType::Segment,
                index: segment.index,
                data: &segment.data,
                encrypt: loadable || !options.skip_sections,
                compress: loadable && options.compress,
            }
        })
        .collect();

    debug!(
        segments = image.segments.len(),
        sections = plans.len(),
        "segment to section mapping"
    );
    Ok(plans)
}

/// SHA-1 over the executable as it will be reconstructed
pub fn executable_digest(image: &ExecutableImage, with_section_headers: bool) -> [u8; ELF_DIGEST_SIZE] {
    let bytes = if with_section_headers || image.section_headers.is_none() {
        image.to_bytes()
    } else {
        ExecutableImage {
            section_headers: None,
            ..image.clone()
        }
        .to_bytes()
    };
    Sha1::digest(&bytes).into()
}

/// Extended header for `image`. Segment infos are placeholders until
/// `restate_segments` runs, and the section header offset is set by the
/// caller once the payload layout is known.
pub fn image_header(
    image: &ExecutableImage,
    app_info: AppInfo,
    control_flags: [u8; CONTROL_FLAGS_SIZE],
    fw_version: u64,
    options: &TransformOptions,
) -> ImageHeader {
    ImageHeader {
        app_info,
        ehdr: image.ehdr.clone(),
        phdr_table: image.phdr_table.clone(),
        segment_infos: vec![SegmentInfo::default(); image.segments.len()],
        permissions: permissions_word(image.segments.iter().map(|s| s.permissions())),
        shdr_offset: 0,
        version_present: true,
        control_infos: vec![
            ControlInfo::Flags(control_flags),
            ControlInfo::Digest {
                constant: DIGEST_CONSTANT,
                elf_digest: executable_digest(image, options.add_section_headers),
                fw_version,
            },
        ],
    }
}

/// Restate where each program header's payload landed
pub fn restate_segments(header: &mut ImageHeader, descriptors: &[SectionDescriptor]) {
    for descriptor in descriptors {
        if descriptor.section_type != SectionType::Segment {
            continue;
        }
        if let Some(info) = header.segment_infos.get_mut(descriptor.index as usize) {
            *info = SegmentInfo {
                offset: descriptor.offset,
                size: descriptor.data_size,
                compressed: descriptor.compressed,
                encrypted: descriptor.encrypted,
            };
        }
    }
}

fn malformed(message: impl Into<String>) -> SceError {
    TransformError::MalformedInput(message.into()).into()
}

fn program_headers(header: &ImageHeader) -> Result<(goblin::elf::header::Header, Vec<ProgramHeader>)> {
    let (ehdr, ctx, _) = parse_ehdr(&header.ehdr)?;
    let phdrs = crate::image::elf::parse_phdrs(&header.phdr_table, ehdr.e_phnum as usize, ctx)?;
    Ok((ehdr, phdrs))
}

/// Fill in the expected plaintext length of every segment section from the
/// program headers, so decompression is bounded by it.
pub fn attach_segment_lengths(header: &ImageHeader, metadata: &mut Metadata) -> Result<()> {
    let (_, phdrs) = program_headers(header)?;
    for descriptor in &mut metadata.sections {
        if descriptor.section_type != SectionType::Segment {
            continue;
        }
        let phdr = phdrs.get(descriptor.index as usize).ok_or_else(|| {
            SceError::format(
                Stage::Metadata,
                format!("section refers to program header {}", descriptor.index),
            )
        })?;
        descriptor.uncompressed_len = phdr.p_filesz;
    }
    Ok(())
}

/// Rebuild the executable from the extended header and decoded sections.
/// The restated segment table and the permissions word must agree with the
/// metadata and the program headers.
pub fn reconstruct(
    header: &ImageHeader,
    metadata: &Metadata,
    sections: &[Vec<u8>],
    section_headers: Option<Vec<u8>>,
) -> Result<ExecutableImage> {
    let (ehdr, ctx, class) = parse_ehdr(&header.ehdr)?;
    let phdrs = crate::image::elf::parse_phdrs(&header.phdr_table, ehdr.e_phnum as usize, ctx)?;

    if header.segment_infos.len() != phdrs.len() {
        return Err(malformed(format!(
            "{} restated segments for {} program headers",
            header.segment_infos.len(),
            phdrs.len()
        )));
    }
    let permissions = permissions_word(phdrs.iter().map(|ph| (ph.p_flags & 0x7) as u8));
    if permissions != header.permissions {
        return Err(malformed(format!(
            "permissions 0x{:x} disagree with program headers (0x{:x})",
            header.permissions, permissions
        )));
    }

    let mut segments = Vec::with_capacity(phdrs.len());
    for (index, ph) in phdrs.iter().enumerate() {
        let found = metadata
            .sections
            .iter()
            .position(|d| d.section_type == SectionType::Segment && d.index as usize == index);
        let data = match found {
            Some(position) => {
                let descriptor = &metadata.sections[position];
                let restated = header.segment_infos[index];
                if restated.offset != descriptor.offset
                    || restated.size != descriptor.data_size
                    || restated.compressed != descriptor.compressed
                    || restated.encrypted != descriptor.encrypted
                {
                    return Err(malformed(format!(
                        "restated segment table disagrees with metadata for segment {}",
                        index
                    )));
                }
                sections
                    .get(position)
                    .cloned()
                    .ok_or_else(|| malformed(format!("segment {} was not decoded", index)))?
            }
            None if ph.p_filesz == 0 => Vec::new(),
            None => {
                return Err(malformed(format!(
                    "segment {} has 0x{:x} bytes but no section",
                    index, ph.p_filesz
                )))
            }
        };
        if data.len() as u64 != ph.p_filesz {
            return Err(malformed(format!(
                "segment {} decoded to 0x{:x} bytes, header says 0x{:x}",
                index,
                data.len(),
                ph.p_filesz
            )));
        }
        segments.push(ProgramSegment {
            index: index as u32,
            p_type: ph.p_type,
            vaddr: ph.p_vaddr,
            file_offset: ph.p_offset,
            file_size: ph.p_filesz,
            mem_size: ph.p_memsz,
            flags: ph.p_flags,
            align: ph.p_align,
            data,
        });
    }

    let image = ExecutableImage {
        class,
        big_endian: ehdr.e_ident[goblin::elf::header::EI_DATA] == goblin::elf::header::ELFDATA2MSB,
        machine: ehdr.e_machine,
        entry_point: ehdr.e_entry,
        ehdr: header.ehdr.clone(),
        phdr_offset: ehdr.e_phoff,
        phdr_table: header.phdr_table.clone(),
        segments,
        section_header_offset: ehdr.e_shoff,
        section_headers,
    };

    if let Some((expected, _)) = header.elf_digest() {
        let actual = executable_digest(&image, true);
        if &actual != expected {
            return Err(SceError::format(
                Stage::Executable,
                "reconstructed executable does not match its recorded digest",
            ));
        }
    }

    debug!(
        segments = image.segments.len(),
        class = ?image.class,
        elf64 = image.class == ElfClass::Elf64,
        "executable reconstructed"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::SelfType;
    use crate::metadata::{KeyMaterialPolicy, MetadataInfo, SectionKeys};
    use crate::testkit::{self, SegmentSpec};
    use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_NOTE};

    fn app_info() -> AppInfo {
        AppInfo {
            auth_id: 0x1010_0000_0100_0003,
            vendor_id: 0x0100_0002,
            self_type: SelfType::App,
            version: 0x0001_0000_0000_0000,
        }
    }

    /// Lay sections out back to back from 0x400 and return matching metadata
    fn layout(plans: &[SectionPlan]) -> (Metadata, Vec<Vec<u8>>) {
        let info = MetadataInfo {
            key: [1; 16],
            iv: [2; 16],
        };
        let mut offset = 0x400u64;
        let mut descriptors = Vec::new();
        let mut keys = Vec::new();
        for (position, plan) in plans.iter().enumerate() {
            descriptors.push(SectionDescriptor {
                offset,
                data_size: plan.data.len() as u64,
                uncompressed_len: plan.data.len() as u64,
                section_type: plan.section_type,
                index: plan.index,
                hashed: true,
                digest_index: 0,
                encrypted: plan.encrypt,
                key_index: 0,
                iv_index: 0,
                compressed: false,
                digest: [0; 20],
            });
            keys.push(SectionKeys::generate(KeyMaterialPolicy::Derived, &info, position as u32));
            offset += plan.data.len() as u64;
        }
        let sections = plans.iter().map(|p| p.data.to_vec()).collect();
        (Metadata::assemble(info, descriptors, &keys, Vec::new()), sections)
    }

    #[test]
    fn test_plan_orders_by_vaddr_then_index() {
        let bytes = testkit::build_elf64(
            0x20000,
            &[
                SegmentSpec::load(0x20000, PF_R | PF_W, vec![1; 0x40]),
                SegmentSpec::load(0x10000, PF_R | PF_X, vec![2; 0x40]),
                SegmentSpec::load(0x10000, PF_R, vec![3; 0x10]),
            ],
            false,
        );
        let image = ExecutableImage::parse(&bytes).unwrap();
        let plans = plan_sections(&image, &TransformOptions::default()).unwrap();
        let order: Vec<u32> = plans.iter().map(|p| p.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_skip_sections_leaves_notes_plain() {
        let bytes = testkit::build_elf64(
            0x100,
            &[
                SegmentSpec::load(0x100, PF_R | PF_X, vec![1; 0x80]),
                SegmentSpec {
                    p_type: PT_NOTE,
                    vaddr: 0,
                    flags: PF_R,
                    data: vec![2; 0x18],
                    bss: 0,
                },
                SegmentSpec::load(0x400, PF_R | PF_W, Vec::new()),
            ],
            false,
        );
        let image = ExecutableImage::parse(&bytes).unwrap();

        let plans = plan_sections(&image, &TransformOptions::default()).unwrap();
        assert_eq!(plans.len(), 2, "empty segments get no section");
        let note = plans.iter().find(|p| p.index == 1).unwrap();
        assert!(!note.encrypt);

        let options = TransformOptions {
            skip_sections: false,
            ..Default::default()
        };
        let plans = plan_sections(&image, &options).unwrap();
        assert!(plans.iter().all(|p| p.encrypt));
    }

    #[test]
    fn test_too_many_program_headers() {
        let segments: Vec<SegmentSpec> = (0..22u64)
            .map(|i| SegmentSpec::load(0x1000 * (i + 1), PF_R, vec![i as u8; 16]))
            .collect();
        let image = ExecutableImage::parse(&testkit::build_elf64(0x1000, &segments, false)).unwrap();
        let err = plan_sections(&image, &TransformOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            SceError::Transform(TransformError::UnsupportedSegmentLayout(_))
        ));
    }

    #[test]
    fn test_reconstruct_roundtrip() {
        let image = ExecutableImage::parse(&testkit::sample_elf()).unwrap();
        let options = TransformOptions::default();
        let plans = plan_sections(&image, &options).unwrap();
        let (metadata, sections) = layout(&plans);

        let mut header = image_header(&image, app_info(), [0; CONTROL_FLAGS_SIZE], 0, &options);
        restate_segments(&mut header, &metadata.sections);
        assert_eq!(header.segment_infos[1].offset, 0x400 + 0x1800);

        let rebuilt =
            reconstruct(&header, &metadata, &sections, image.section_headers.clone()).unwrap();
        assert_eq!(rebuilt, image);
    }

    #[test]
    fn test_attach_segment_lengths() {
        let image = ExecutableImage::parse(&testkit::sample_elf()).unwrap();
        let options = TransformOptions::default();
        let plans = plan_sections(&image, &options).unwrap();
        let (mut metadata, _) = layout(&plans);
        for section in &mut metadata.sections {
            section.uncompressed_len = 0;
        }
        let header = image_header(&image, app_info(), [0; CONTROL_FLAGS_SIZE], 0, &options);
        attach_segment_lengths(&header, &mut metadata).unwrap();
        assert_eq!(metadata.sections[0].uncompressed_len, 0x1800);
        assert_eq!(metadata.sections[1].uncompressed_len, image.segments[1].file_size);
    }

    #[test]
    fn test_restated_table_disagreement() {
        let image = ExecutableImage::parse(&testkit::sample_elf()).unwrap();
        let options = TransformOptions::default();
        let plans = plan_sections(&image, &options).unwrap();
        let (metadata, sections) = layout(&plans);

        let mut header = image_header(&image, app_info(), [0; CONTROL_FLAGS_SIZE], 0, &options);
        restate_segments(&mut header, &metadata.sections);
        header.segment_infos[0].offset += 0x10;
        let err = reconstruct(&header, &metadata, &sections, None).unwrap_err();
        assert!(matches!(
            err,
            SceError::Transform(TransformError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_permissions_disagreement() {
        let image = ExecutableImage::parse(&testkit::sample_elf()).unwrap();
        let options = TransformOptions::default();
        let plans = plan_sections(&image, &options).unwrap();
        let (metadata, sections) = layout(&plans);

        let mut header = image_header(&image, app_info(), [0; CONTROL_FLAGS_SIZE], 0, &options);
        restate_segments(&mut header, &metadata.sections);
        header.permissions ^= 0x2;
        assert!(reconstruct(&header, &metadata, &sections, None).is_err());
    }

    #[test]
    fn test_digest_catches_swapped_payload() {
        let image = ExecutableImage::parse(&testkit::sample_elf()).unwrap();
        let options = TransformOptions::default();
        let plans = plan_sections(&image, &options).unwrap();
        let (metadata, mut sections) = layout(&plans);

        let mut header = image_header(&image, app_info(), [0; CONTROL_FLAGS_SIZE], 0, &options);
        restate_segments(&mut header, &metadata.sections);
        sections[0][0] ^= 0xFF;
        assert!(matches!(
            reconstruct(&header, &metadata, &sections, image.section_headers.clone()),
            Err(SceError::Format { stage: Stage::Executable, .. })
        ));
    }
}
