//! Executable transformer: ELF program segments in, sections plus the
//! loadable-image extended header out, and back.

pub mod elf;
pub mod extended;
pub mod transform;

pub use elf::{ElfClass, ExecutableImage, ProgramSegment};
pub use extended::{AppInfo, ControlInfo, ImageHeader, SegmentInfo, MAX_PROGRAM_HEADERS};
pub use transform::{plan_sections, reconstruct, SectionPlan, TransformOptions};
