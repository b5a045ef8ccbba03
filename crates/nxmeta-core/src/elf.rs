//! Loadable segments of an ARM/AArch64 ELF image.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use goblin::elf::header::{EM_AARCH64, EM_ARM};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};

use crate::error::{BuildError, BuildResult};
use crate::layout::SegmentSizes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPerm {
    Rx,
    Ro,
    Rw,
    Other(u32),
}

impl SegmentPerm {
    fn from_flags(flags: u32) -> Self {
        let rwx = flags & (PF_R | PF_W | PF_X);
        if rwx == PF_R | PF_X {
            SegmentPerm::Rx
        } else if rwx == PF_R {
            SegmentPerm::Ro
        } else if rwx == PF_R | PF_W {
            SegmentPerm::Rw
        } else {
            SegmentPerm::Other(flags)
        }
    }
}

impl fmt::Display for SegmentPerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentPerm::Rx => f.write_str("r-x"),
            SegmentPerm::Ro => f.write_str("r--"),
            SegmentPerm::Rw => f.write_str("rw-"),
            SegmentPerm::Other(flags) => write!(f, "flags={flags:#x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment {
    pub data: Vec<u8>,
    pub mem_size: u64,
    pub perm: SegmentPerm,
}

impl LoadSegment {
    pub fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn sizes(&self) -> SegmentSizes {
        SegmentSizes {
            file_size: self.file_size(),
            mem_size: self.mem_size,
        }
    }
}

/// The three loadable segments of an executable, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSource {
    pub machine: u16,
    pub segments: Vec<LoadSegment>,
}

impl SegmentSource {
    pub fn parse(image: &[u8]) -> BuildResult<Self> {
        let elf = goblin::elf::Elf::parse(image)
            .map_err(|err| BuildError::structural(format!("invalid ELF image: {err}")))?;

        let machine = elf.header.e_machine;
        if machine != EM_ARM && machine != EM_AARCH64 {
            return Err(BuildError::structural(format!(
                "must be an ARM or AArch64 ELF (e_machine = {machine})"
            )));
        }

        let mut segments = Vec::new();
        for phdr in &elf.program_headers {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let start = usize::try_from(phdr.p_offset).ok();
            let end = start.and_then(|s| s.checked_add(usize::try_from(phdr.p_filesz).ok()?));
            let data = match (start, end) {
                (Some(start), Some(end)) if end <= image.len() => &image[start..end],
                _ => {
                    return Err(BuildError::structural(format!(
                        "loadable segment at file offset {:#x} (size {:#x}) lies outside the image",
                        phdr.p_offset, phdr.p_filesz
                    )))
                }
            };
            segments.push(LoadSegment {
                data: data.to_vec(),
                mem_size: phdr.p_memsz,
                perm: SegmentPerm::from_flags(phdr.p_flags),
            });
        }

        if segments.len() != 3 {
            return Err(BuildError::structural(format!(
                "expected 3 loadable segments, got {}",
                segments.len()
            )));
        }
        Ok(SegmentSource { machine, segments })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let image = std::fs::read(path).with_context(|| format!("read ELF: {}", path.display()))?;
        Self::parse(&image).with_context(|| format!("load segments: {}", path.display()))
    }

    pub fn sizes(&self) -> Vec<SegmentSizes> {
        self.segments.iter().map(LoadSegment::sizes).collect()
    }
}
