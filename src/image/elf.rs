use crate::error::{Result, TransformError};
use goblin::container::{Container, Ctx};
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::{header::Header, Elf};

pub const EHDR64_SIZE: usize = 0x40;
pub const EHDR32_SIZE: usize = 0x34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

/// One program header together with its file image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSegment {
    /// Position in the program header table
    pub index: u32,
    pub p_type: u32,
    pub vaddr: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    /// PF_R / PF_W / PF_X
    pub flags: u32,
    pub align: u64,
    pub data: Vec<u8>,
}

impl ProgramSegment {
    pub fn is_loadable(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// 3-bit permission mask, R=4 W=2 X=1
    pub fn permissions(&self) -> u8 {
        (self.flags & (PF_R | PF_W | PF_X)) as u8
    }
}

/// Executable as the transformer sees it: the raw headers it must restate
/// verbatim plus the segment images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableImage {
    pub class: ElfClass,
    pub big_endian: bool,
    pub machine: u16,
    pub entry_point: u64,
    pub ehdr: Vec<u8>,
    pub phdr_offset: u64,
    pub phdr_table: Vec<u8>,
    pub segments: Vec<ProgramSegment>,
    pub section_header_offset: u64,
    pub section_headers: Option<Vec<u8>>,
}

fn malformed(message: impl Into<String>) -> TransformError {
    TransformError::MalformedInput(message.into())
}

fn slice(bytes: &[u8], offset: u64, len: u64, what: &str) -> Result<Vec<u8>> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= bytes.len() as u64)
        .ok_or_else(|| {
            malformed(format!(
                "{} at 0x{:x}+0x{:x} exceeds file size 0x{:x}",
                what,
                offset,
                len,
                bytes.len()
            ))
        })?;
    Ok(bytes[offset as usize..end as usize].to_vec())
}

/// ELF header plus the parsing context it implies
pub(crate) fn parse_ehdr(bytes: &[u8]) -> Result<(Header, Ctx, ElfClass)> {
    let header = Elf::parse_header(bytes).map_err(|e| malformed(format!("ELF header: {}", e)))?;
    let container = header
        .container()
        .map_err(|e| malformed(format!("ELF class: {}", e)))?;
    let endian = header
        .endianness()
        .map_err(|e| malformed(format!("ELF data encoding: {}", e)))?;
    let class = match container {
        Container::Big => ElfClass::Elf64,
        Container::Little => ElfClass::Elf32,
    };
    Ok((header, Ctx::new(container, endian), class))
}

pub(crate) fn ehdr_size(class: ElfClass) -> usize {
    match class {
        ElfClass::Elf64 => EHDR64_SIZE,
        ElfClass::Elf32 => EHDR32_SIZE,
    }
}

pub(crate) fn parse_phdrs(table: &[u8], count: usize, ctx: Ctx) -> Result<Vec<ProgramHeader>> {
    ProgramHeader::parse(table, 0, count, ctx)
        .map_err(|e| malformed(format!("program headers: {}", e)).into())
}

impl ExecutableImage {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (header, ctx, class) = parse_ehdr(bytes)?;
        let ehdr = slice(bytes, 0, ehdr_size(class) as u64, "ELF header")?;

        let phdr_len = header.e_phnum as u64 * header.e_phentsize as u64;
        let phdr_table = slice(bytes, header.e_phoff, phdr_len, "program header table")?;
        let phdrs = parse_phdrs(&phdr_table, header.e_phnum as usize, ctx)?;

        let segments = phdrs
            .iter()
            .enumerate()
            .map(|(index, ph)| {
                let data = slice(bytes, ph.p_offset, ph.p_filesz, &format!("segment {}", index))?;
                Ok(ProgramSegment {
                    index: index as u32,
                    p_type: ph.p_type,
                    vaddr: ph.p_vaddr,
                    file_offset: ph.p_offset,
                    file_size: ph.p_filesz,
                    mem_size: ph.p_memsz,
                    flags: ph.p_flags,
                    align: ph.p_align,
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let section_headers = if header.e_shoff != 0 && header.e_shnum > 0 {
            let len = header.e_shnum as u64 * header.e_shentsize as u64;
            Some(slice(bytes, header.e_shoff, len, "section header table")?)
        } else {
            None
        };

        Ok(Self {
            class,
            big_endian: header.e_ident[goblin::elf::header::EI_DATA]
                == goblin::elf::header::ELFDATA2MSB,
            machine: header.e_machine,
            entry_point: header.e_entry,
            ehdr,
            phdr_offset: header.e_phoff,
            phdr_table,
            segments,
            section_header_offset: header.e_shoff,
            section_headers,
        })
    }

    /// Serialize back to a file image. Bytes not covered by a header table
    /// or segment are zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut size = self.ehdr.len() as u64;
        size = size.max(self.phdr_offset + self.phdr_table.len() as u64);
        for segment in &self.segments {
            size = size.max(segment.file_offset + segment.data.len() as u64);
        }
        if let Some(shdrs) = &self.section_headers {
            size = size.max(self.section_header_offset + shdrs.len() as u64);
        }

        let mut out = vec![0u8; size as usize];
        out[..self.ehdr.len()].copy_from_slice(&self.ehdr);
        let ph = self.phdr_offset as usize;
        out[ph..ph + self.phdr_table.len()].copy_from_slice(&self.phdr_table);
        for segment in &self.segments {
            let start = segment.file_offset as usize;
            out[start..start + segment.data.len()].copy_from_slice(&segment.data);
        }
        if let Some(shdrs) = &self.section_headers {
            let start = self.section_header_offset as usize;
            out[start..start + shdrs.len()].copy_from_slice(shdrs);
        }
        out
    }

    pub fn loadable_segments(&self) -> impl Iterator<Item = &ProgramSegment> {
        self.segments.iter().filter(|s| s.is_loadable())
    }
}
