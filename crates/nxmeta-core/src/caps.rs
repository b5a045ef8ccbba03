//! Kernel capability descriptors.
//!
//! Each descriptor becomes one or more little-endian `u32` words. The low bits of
//! every word are a run of one-bits whose length identifies the descriptor type,
//! terminated by a zero bit; the type-specific fields sit above that terminator.
//! Trailing `0xFF` padding never decodes as a descriptor because its run of ones
//! is longer than any tag.

use nxmeta_contracts::MAX_KERNEL_CAPABILITIES;
use serde_json::Value;

use crate::config::{parse_int, Doc, Node};
use crate::error::{BuildError, BuildResult};
use crate::writer::BinaryWriter;

pub const MAX_SYSCALL: u64 = 0xBF;
const SYSCALLS_PER_GROUP: u64 = 24;
const SYSCALL_GROUPS: usize = 8;
const MAX_MAP_REGIONS: usize = 3;
const IRQ_NONE: u64 = 0x3FF;
const MAX_APPLICATION_TYPE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    KernelFlags,
    Syscalls,
    Map,
    MapPage,
    MapRegion,
    IrqPair,
    ApplicationType,
    MinKernelVersion,
    HandleTableSize,
    DebugFlags,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 10] = [
        CapabilityKind::KernelFlags,
        CapabilityKind::Syscalls,
        CapabilityKind::Map,
        CapabilityKind::MapPage,
        CapabilityKind::MapRegion,
        CapabilityKind::IrqPair,
        CapabilityKind::ApplicationType,
        CapabilityKind::MinKernelVersion,
        CapabilityKind::HandleTableSize,
        CapabilityKind::DebugFlags,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityKind::KernelFlags => "kernel_flags",
            CapabilityKind::Syscalls => "syscalls",
            CapabilityKind::Map => "map",
            CapabilityKind::MapPage => "map_page",
            CapabilityKind::MapRegion => "map_region",
            CapabilityKind::IrqPair => "irq_pair",
            CapabilityKind::ApplicationType => "application_type",
            CapabilityKind::MinKernelVersion => "min_kernel_version",
            CapabilityKind::HandleTableSize => "handle_table_size",
            CapabilityKind::DebugFlags => "debug_flags",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Number of trailing one-bits that tag this descriptor type.
    pub const fn tag_bits(self) -> u32 {
        match self {
            CapabilityKind::KernelFlags => 3,
            CapabilityKind::Syscalls => 4,
            CapabilityKind::Map => 6,
            CapabilityKind::MapPage => 7,
            CapabilityKind::MapRegion => 10,
            CapabilityKind::IrqPair => 11,
            CapabilityKind::ApplicationType => 13,
            CapabilityKind::MinKernelVersion => 14,
            CapabilityKind::HandleTableSize => 15,
            CapabilityKind::DebugFlags => 16,
        }
    }

    pub const fn tag(self) -> u32 {
        (1 << self.tag_bits()) - 1
    }

    /// Recovers the descriptor type of an encoded word.
    pub fn from_word(word: u32) -> Option<Self> {
        let ones = word.trailing_ones();
        Self::ALL.into_iter().find(|k| k.tag_bits() == ones)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRegion {
    pub region_type: u64,
    pub is_ro: bool,
}

/// One capability descriptor. Numeric fields are range-checked at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    KernelFlags {
        highest_thread_priority: u64,
        lowest_thread_priority: u64,
        lowest_cpu_id: u64,
        highest_cpu_id: u64,
    },
    Syscalls(Vec<u64>),
    Map {
        address: u64,
        size: u64,
        is_ro: bool,
        is_io: bool,
    },
    MapPage(u64),
    MapRegion(Vec<MapRegion>),
    /// `None` marks an unused interrupt slot.
    IrqPair(Vec<Option<u64>>),
    ApplicationType(u64),
    MinKernelVersion(u64),
    HandleTableSize(u64),
    DebugFlags {
        allow_debug: bool,
        force_debug_prod: bool,
        force_debug: bool,
    },
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::KernelFlags { .. } => CapabilityKind::KernelFlags,
            Capability::Syscalls(_) => CapabilityKind::Syscalls,
            Capability::Map { .. } => CapabilityKind::Map,
            Capability::MapPage(_) => CapabilityKind::MapPage,
            Capability::MapRegion(_) => CapabilityKind::MapRegion,
            Capability::IrqPair(_) => CapabilityKind::IrqPair,
            Capability::ApplicationType(_) => CapabilityKind::ApplicationType,
            Capability::MinKernelVersion(_) => CapabilityKind::MinKernelVersion,
            Capability::HandleTableSize(_) => CapabilityKind::HandleTableSize,
            Capability::DebugFlags { .. } => CapabilityKind::DebugFlags,
        }
    }
}

/// Reads the `kernel_capabilities` list of a configuration document.
pub fn capabilities_from_doc(doc: &Doc<'_>) -> BuildResult<Vec<Capability>> {
    let entries = doc.list(&["kernel_capabilities"], false)?;
    if entries.len() > MAX_KERNEL_CAPABILITIES {
        return Err(BuildError::TooMany {
            what: "kernel capabilities".to_string(),
            count: entries.len(),
            max: MAX_KERNEL_CAPABILITIES,
        });
    }
    entries.iter().map(capability_from_node).collect()
}

fn capability_from_node(node: &Node<'_>) -> BuildResult<Capability> {
    let entry = node.dict()?;
    let type_name = entry.string(&["type"], None, None)?;
    let kind = CapabilityKind::parse(&type_name).ok_or_else(|| BuildError::UnknownCapability {
        path: format!("{}.type", node.path),
        name: type_name.clone(),
    })?;

    let cap = match kind {
        CapabilityKind::KernelFlags => {
            let value = entry.node(&["value"])?;
            let value = value.dict()?;
            Capability::KernelFlags {
                highest_thread_priority: value.u64(&["highest_thread_priority"], None)?,
                lowest_thread_priority: value.u64(&["lowest_thread_priority"], None)?,
                lowest_cpu_id: value.u64(&["lowest_cpu_id"], None)?,
                highest_cpu_id: value.u64(&["highest_cpu_id"], None)?,
            }
        }
        CapabilityKind::Syscalls => {
            let value = entry.node(&["value"])?;
            let numbers: Vec<(String, &Value)> = match value.value {
                Value::Object(map) => map
                    .iter()
                    .map(|(name, v)| (format!("{}.{name}", value.path), v))
                    .collect(),
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (format!("{}[{i}]", value.path), v))
                    .collect(),
                _ => {
                    return Err(BuildError::WrongType {
                        path: value.path.clone(),
                        expected: "a dict of syscall numbers",
                    })
                }
            };
            let mut ids = Vec::with_capacity(numbers.len());
            for (path, v) in numbers {
                let id = parse_int(v).ok_or_else(|| BuildError::WrongType {
                    path: path.clone(),
                    expected: "an integer syscall number",
                })?;
                ids.push(u64::try_from(id).map_err(|_| BuildError::OutOfRange {
                    path,
                    value: id,
                    min: 0,
                    max: MAX_SYSCALL,
                })?);
            }
            Capability::Syscalls(ids)
        }
        CapabilityKind::Map => {
            let value = entry.node(&["value"])?;
            let value = value.dict()?;
            Capability::Map {
                address: value.u64(&["address"], None)?,
                size: value.u64(&["size"], None)?,
                is_ro: value.bool(&["is_ro"], None)?,
                is_io: value.bool(&["is_io"], None)?,
            }
        }
        CapabilityKind::MapPage => Capability::MapPage(entry.u64(&["value"], None)?),
        CapabilityKind::MapRegion => {
            let mut regions = Vec::new();
            for region in entry.list(&["value"], false)? {
                let region = region.dict()?;
                regions.push(MapRegion {
                    region_type: region.u64(&["region_type"], None)?,
                    is_ro: region.bool(&["is_ro"], None)?,
                });
            }
            Capability::MapRegion(regions)
        }
        CapabilityKind::IrqPair => {
            let mut irqs = Vec::new();
            for irq in entry.list(&["value"], false)? {
                irqs.push(if irq.is_null() {
                    None
                } else {
                    Some(irq.int(0, u64::MAX)?)
                });
            }
            Capability::IrqPair(irqs)
        }
        CapabilityKind::ApplicationType => {
            Capability::ApplicationType(entry.u64(&["value"], Some(0))?)
        }
        CapabilityKind::MinKernelVersion => {
            Capability::MinKernelVersion(entry.u64(&["value"], None)?)
        }
        CapabilityKind::HandleTableSize => {
            Capability::HandleTableSize(entry.u64(&["value"], None)?)
        }
        CapabilityKind::DebugFlags => {
            let value = entry.node(&["value"])?;
            let value = value.dict()?;
            Capability::DebugFlags {
                allow_debug: value.bool(&["allow_debug"], Some(false))?,
                force_debug_prod: value.bool(&["force_debug_prod"], Some(false))?,
                force_debug: value.bool(&["force_debug"], Some(false))?,
            }
        }
    };
    Ok(cap)
}

/// Places `value` into a `width`-bit field at bit `offset`.
fn field(path: &str, name: &str, value: u64, offset: u32, width: u32) -> BuildResult<u32> {
    field_max(path, name, value, offset, (1u64 << width) - 1)
}

/// Like [`field`], but bounded by an allowed maximum narrower than the field width.
fn field_max(path: &str, name: &str, value: u64, offset: u32, max: u64) -> BuildResult<u32> {
    if value > max {
        return Err(BuildError::OutOfRange {
            path: format!("{path}.{name}"),
            value: value as i128,
            min: 0,
            max,
        });
    }
    Ok((value as u32) << offset)
}

fn flag(set: bool, bit: u32) -> u32 {
    if set {
        1 << bit
    } else {
        0
    }
}

/// Encodes one descriptor into its words.
pub fn encode_capability(cap: &Capability, path: &str) -> BuildResult<Vec<u32>> {
    let tag = cap.kind().tag();
    let words = match cap {
        Capability::KernelFlags {
            highest_thread_priority,
            lowest_thread_priority,
            lowest_cpu_id,
            highest_cpu_id,
        } => vec![
            tag | field(path, "highest_thread_priority", *highest_thread_priority, 4, 6)?
                | field(path, "lowest_thread_priority", *lowest_thread_priority, 10, 6)?
                | field(path, "lowest_cpu_id", *lowest_cpu_id, 16, 8)?
                | field(path, "highest_cpu_id", *highest_cpu_id, 24, 8)?,
        ],
        Capability::Syscalls(ids) => {
            let mut groups = [0u32; SYSCALL_GROUPS];
            for &id in ids {
                if id > MAX_SYSCALL {
                    return Err(BuildError::OutOfRange {
                        path: format!("{path}.value"),
                        value: id as i128,
                        min: 0,
                        max: MAX_SYSCALL,
                    });
                }
                groups[(id / SYSCALLS_PER_GROUP) as usize] |= 1 << (id % SYSCALLS_PER_GROUP);
            }
            groups
                .iter()
                .enumerate()
                .filter(|(_, mask)| **mask != 0)
                .map(|(index, mask)| tag | (mask << 5) | ((index as u32) << 29))
                .collect()
        }
        Capability::Map {
            address,
            size,
            is_ro,
            is_io,
        } => vec![
            tag | field(path, "address", *address, 7, 24)? | flag(*is_ro, 31),
            tag | field(path, "size", *size, 7, 20)? | flag(*is_io, 31),
        ],
        Capability::MapPage(page) => vec![tag | field(path, "value", *page, 8, 24)?],
        Capability::MapRegion(regions) => {
            if regions.len() > MAX_MAP_REGIONS {
                return Err(BuildError::TooMany {
                    what: format!("`{path}` regions"),
                    count: regions.len(),
                    max: MAX_MAP_REGIONS,
                });
            }
            let mut word = tag;
            for (i, region) in regions.iter().enumerate() {
                let shift = 11 + 7 * i as u32;
                word |= field(path, "region_type", region.region_type, shift, 2)?;
                word |= flag(region.is_ro, shift + 6);
            }
            vec![word]
        }
        Capability::IrqPair(irqs) => {
            if irqs.len() != 2 {
                return Err(BuildError::WrongCount {
                    what: format!("`{path}` interrupts"),
                    count: irqs.len(),
                    expected: 2,
                });
            }
            let mut word = tag;
            for (i, irq) in irqs.iter().enumerate() {
                let irq = irq.unwrap_or(IRQ_NONE);
                word |= field(path, "value", irq, 12 + 10 * i as u32, 10)?;
            }
            vec![word]
        }
        Capability::ApplicationType(value) => {
            vec![tag | field_max(path, "value", *value, 14, MAX_APPLICATION_TYPE)?]
        }
        Capability::MinKernelVersion(version) => {
            vec![tag | field(path, "value", *version, 15, 16)?]
        }
        Capability::HandleTableSize(size) => vec![tag | field(path, "value", *size, 16, 10)?],
        Capability::DebugFlags {
            allow_debug,
            force_debug_prod,
            force_debug,
        } => {
            let set = [*allow_debug, *force_debug_prod, *force_debug]
                .iter()
                .filter(|b| **b)
                .count();
            if set > 1 {
                return Err(BuildError::Conflict {
                    path: format!("{path}.value"),
                    why: "only one of `allow_debug`, `force_debug_prod`, or `force_debug` can be set",
                });
            }
            vec![tag | flag(*allow_debug, 17) | flag(*force_debug_prod, 18) | flag(*force_debug, 19)]
        }
    };
    Ok(words)
}

/// Encodes a capability list into a standalone little-endian blob, in list order.
pub fn encode_capabilities(caps: &[Capability]) -> BuildResult<BinaryWriter> {
    if caps.len() > MAX_KERNEL_CAPABILITIES {
        return Err(BuildError::TooMany {
            what: "kernel capabilities".to_string(),
            count: caps.len(),
            max: MAX_KERNEL_CAPABILITIES,
        });
    }
    let mut out = BinaryWriter::new();
    for (i, cap) in caps.iter().enumerate() {
        let path = format!("kernel_capabilities[{i}]");
        for word in encode_capability(cap, &path)? {
            out.write_u32(word);
        }
    }
    Ok(out)
}
