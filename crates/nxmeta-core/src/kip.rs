//! Kernel initial process (KIP1) images.
//!
//! Layout: a 0x100-byte header (the segment table at 0x20, the capability
//! region at 0x80) followed by the raw bytes of the three segments.

use nxmeta_contracts::KIP_MAGIC;

use crate::caps::{capabilities_from_doc, encode_capabilities, Capability};
use crate::config::Doc;
use crate::elf::SegmentSource;
use crate::error::{BuildError, BuildResult};
use crate::layout::{SegmentHeader, SegmentLayout};
use crate::process::{check_name, check_priority, check_stack_size, MAX_THREAD_PRIORITY};
use crate::writer::{to_u32, BinaryWriter};

pub const KIP_NAME_LEN: usize = 0xC;
pub const KIP_HEADER_SIZE: usize = 0x100;
pub const KIP_SEGMENT_TABLE_OFFSET: usize = 0x20;
pub const KIP_SEGMENT_ENTRY_SIZE: usize = 0x10;
pub const KIP_BSS_ENTRY_OFFSET: usize = 0x50;
pub const KIP_STACK_SIZE_OFFSET: usize = 0x3C;
pub const KIP_CAPS_OFFSET: usize = 0x80;
pub const KIP_CAPS_SIZE: usize = 0x80;

const FLAG_64_BIT: u8 = 0b0001_1000;
const FLAG_SECURE_MEMORY: u8 = 0b0010_0000;
const FLAG_IMMORTAL: u8 = 0b0100_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KipConfig {
    pub name: String,
    pub program_id: u64,
    pub version: u32,
    pub main_thread_priority: u8,
    pub default_cpu_id: u8,
    pub main_thread_stack_size: u32,
    pub use_secure_memory: bool,
    pub immortal: bool,
    pub capabilities: Vec<Capability>,
}

impl KipConfig {
    pub fn from_doc(doc: &Doc<'_>) -> BuildResult<Self> {
        Ok(KipConfig {
            name: doc.string(&["name"], Some(KIP_NAME_LEN), None)?,
            program_id: doc.u64(&["program_id", "title_id"], None)?,
            version: doc.u32(&["version", "process_category"], Some(1))?,
            main_thread_priority: doc.int(
                &["main_thread_priority"],
                0,
                MAX_THREAD_PRIORITY as u64,
                None,
            )? as u8,
            default_cpu_id: doc.u8(&["default_cpu_id"], None)?,
            main_thread_stack_size: doc.u32(&["main_thread_stack_size"], None)?,
            use_secure_memory: doc.bool(&["use_secure_memory"], Some(true))?,
            immortal: doc.bool(&["immortal"], Some(true))?,
            capabilities: capabilities_from_doc(doc)?,
        })
    }

    /// Checks the fields whose ranges are narrower than their Rust types.
    pub fn validate(&self) -> BuildResult<()> {
        check_stack_size(self.main_thread_stack_size)?;
        check_name(&self.name, KIP_NAME_LEN)?;
        check_priority(self.main_thread_priority)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KipOptions {
    /// Request the compressed variant. Not produced by this tool.
    pub compress: bool,
}

/// A finished KIP image together with the segment layout written into its header.
#[derive(Debug, Clone)]
pub struct KipImage {
    pub layout: SegmentLayout,
    pub image: BinaryWriter,
}

fn write_segment_entry(w: &mut BinaryWriter, at: usize, seg: &SegmentHeader) -> BuildResult<()> {
    w.seek(at);
    w.write_u32(to_u32(seg.memory_offset, "segment memory offset")?);
    w.write_u32(to_u32(seg.decompressed_size, "segment size")?);
    w.write_u32(to_u32(seg.stored_size, "segment stored size")?);
    Ok(())
}

/// Builds a complete KIP1 image. A compression request fails before anything
/// else is looked at.
pub fn build_kip(
    config: &KipConfig,
    source: &SegmentSource,
    options: KipOptions,
) -> BuildResult<KipImage> {
    if options.compress {
        return Err(BuildError::Unimplemented("KIP segment compression"));
    }
    config.validate()?;

    let caps = encode_capabilities(&config.capabilities)?;
    if caps.len() > KIP_CAPS_SIZE {
        return Err(BuildError::TooMany {
            what: "kernel capability bytes for a KIP".to_string(),
            count: caps.len(),
            max: KIP_CAPS_SIZE,
        });
    }
    let layout = SegmentLayout::plan(&source.sizes(), options.compress)?;

    // Compression bits (0..=2) stay clear.
    let mut flags = FLAG_64_BIT;
    if config.use_secure_memory {
        flags |= FLAG_SECURE_MEMORY;
    }
    if config.immortal {
        flags |= FLAG_IMMORTAL;
    }

    let mut w = BinaryWriter::new();
    w.write_bytes(KIP_MAGIC);
    w.write_fixed_str(&config.name, KIP_NAME_LEN);
    w.write_u64(config.program_id);
    w.write_u32(config.version);
    w.write_u8(config.main_thread_priority);
    w.write_u8(config.default_cpu_id);
    w.seek_rel(1);
    w.write_u8(flags);

    for (i, seg) in layout.segments.iter().enumerate() {
        write_segment_entry(
            &mut w,
            KIP_SEGMENT_TABLE_OFFSET + i * KIP_SEGMENT_ENTRY_SIZE,
            seg,
        )?;
    }
    write_segment_entry(&mut w, KIP_BSS_ENTRY_OFFSET, &layout.bss)?;

    w.seek(KIP_STACK_SIZE_OFFSET);
    w.write_u32(config.main_thread_stack_size);

    w.seek(KIP_CAPS_OFFSET);
    w.fill(0xFF, KIP_CAPS_SIZE);
    w.seek(KIP_CAPS_OFFSET);
    w.embed(&caps);

    w.seek(KIP_HEADER_SIZE);
    for seg in &source.segments {
        w.write_bytes(&seg.data);
    }
    Ok(KipImage { layout, image: w })
}
