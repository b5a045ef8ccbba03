//! Memory placement of the three loadable segments and the trailing BSS.

use nxmeta_contracts::PAGE_SIZE;
use serde::Serialize;

use crate::error::{BuildError, BuildResult};
use crate::writer::align_up;

/// Sizes of one loadable segment as seen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSizes {
    pub file_size: u64,
    pub mem_size: u64,
}

/// One row of a segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SegmentHeader {
    pub memory_offset: u64,
    pub decompressed_size: u64,
    pub stored_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentLayout {
    /// Executable, read-only and read-write segments, in that order.
    pub segments: [SegmentHeader; 3],
    pub bss: SegmentHeader,
}

impl SegmentLayout {
    /// Plans the layout of `[rx, ro, rw]`. Compressed output is not produced,
    /// so `compress` must be false.
    pub fn plan(segments: &[SegmentSizes], compress: bool) -> BuildResult<Self> {
        if compress {
            return Err(BuildError::Unimplemented("segment compression"));
        }
        let [rx, ro, rw] = segments else {
            return Err(BuildError::structural(format!(
                "expected 3 loadable segments, got {}",
                segments.len()
            )));
        };

        let mut headers = [SegmentHeader::default(); 3];
        let mut memory_offset = 0u64;
        for (header, seg) in headers.iter_mut().zip([rx, ro, rw]) {
            *header = SegmentHeader {
                memory_offset,
                decompressed_size: seg.file_size,
                stored_size: seg.file_size,
            };
            memory_offset = memory_offset
                .checked_add(seg.file_size)
                .and_then(|end| align_up(end, PAGE_SIZE).ok())
                .ok_or_else(|| {
                    BuildError::structural(format!(
                        "segment of {:#x} bytes at memory offset {memory_offset:#x} overflows the address space",
                        seg.file_size
                    ))
                })?;
        }

        let bss_start = align_up(rw.file_size, PAGE_SIZE)?;
        let bss_size = align_up(rw.mem_size.saturating_sub(bss_start), PAGE_SIZE).map_err(|_| {
            BuildError::structural(format!(
                "read-write segment memory size {:#x} overflows the address space",
                rw.mem_size
            ))
        })?;
        Ok(SegmentLayout {
            segments: headers,
            bss: SegmentHeader {
                memory_offset,
                decompressed_size: bss_size,
                stored_size: 0,
            },
        })
    }
}
