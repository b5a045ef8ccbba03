//! Program metadata (NPDM) descriptors.
//!
//! The file is a fixed-size META header followed by the ACID and ACI sections.
//! Both sections embed identical copies of the service access control list and
//! the kernel capability blob. Every nested region's offset is relative to the
//! start of the section that contains it.

use nxmeta_contracts::{NPDM_ACID_MAGIC, NPDM_ACI_MAGIC, NPDM_META_MAGIC};

use crate::caps::{capabilities_from_doc, encode_capabilities, Capability};
use crate::config::{parse_int, Doc};
use crate::error::{BuildError, BuildResult};
use crate::process::{check_name, check_priority, check_stack_size, MAX_THREAD_PRIORITY};
use crate::writer::{to_u32, BinaryWriter, Extent, Mark};

pub const META_NAME_LEN: usize = 0x10;
pub const META_SIZE: usize = 0x80;
pub const MAX_SYSTEM_RESOURCE_SIZE: u64 = 0x1FE0_0000;
pub const MAX_SERVICE_NAME_LEN: usize = 8;
const SECTION_ALIGN: usize = 0x10;
const ACID_SIGNATURE_SIZE: usize = 0x100;
const ACID_PUBLIC_KEY_SIZE: usize = 0x100;
const FS_ACCESS_VERSION: u8 = 1;
const SERVICE_HOST_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveDataOwner {
    /// 1 = read, 2 = write, 3 = read/write.
    pub accessibility: u8,
    pub id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsAccess {
    pub permissions: u64,
    pub content_owner_ids: Vec<u64>,
    pub save_data_owner_ids: Vec<SaveDataOwner>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAccess {
    pub host: Vec<String>,
    pub access: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaFlags {
    pub is_64_bit: bool,
    pub address_space_type: u8,
    pub optimize_memory_allocation: bool,
    pub disable_device_address_space_merge: bool,
    pub enable_alias_region_extra_size: bool,
    pub prevent_code_reads: bool,
}

impl MetaFlags {
    fn bits(self) -> u8 {
        let mut bits = (self.address_space_type & 0b11) << 1;
        for (set, bit) in [
            (self.is_64_bit, 0b0000_0001),
            (self.optimize_memory_allocation, 0b0001_0000),
            (self.disable_device_address_space_merge, 0b0010_0000),
            (self.enable_alias_region_extra_size, 0b0100_0000),
            (self.prevent_code_reads, 0b1000_0000),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcidFlags {
    pub is_retail: bool,
    pub unqualified_approval: bool,
    pub pool_partition: u8,
}

impl AcidFlags {
    fn bits(self) -> u32 {
        let mut bits = (self.pool_partition as u32 & 0b11) << 2;
        if self.is_retail {
            bits |= 0b01;
        }
        if self.unqualified_approval {
            bits |= 0b10;
        }
        bits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpdmConfig {
    pub name: String,
    pub signature_key_generation: u32,
    pub flags: MetaFlags,
    pub main_thread_priority: u8,
    pub default_cpu_id: u8,
    pub system_resource_size: u32,
    pub version: u32,
    pub main_thread_stack_size: u32,
    pub acid_flags: AcidFlags,
    pub program_id: u64,
    pub program_id_range_min: u64,
    pub program_id_range_max: u64,
    pub fs_access: FsAccess,
    pub services: ServiceAccess,
    pub capabilities: Vec<Capability>,
}

impl NpdmConfig {
    pub fn from_doc(doc: &Doc<'_>) -> BuildResult<Self> {
        let fs = doc.node(&["filesystem_access"])?;
        let fs = fs.dict()?;
        Ok(NpdmConfig {
            name: doc.string(&["name"], Some(META_NAME_LEN), None)?,
            signature_key_generation: doc.u32(&["signature_key_generation"], Some(0))?,
            flags: MetaFlags {
                is_64_bit: doc.bool(&["is_64_bit"], None)?,
                address_space_type: doc.int(&["address_space_type"], 0, 3, None)? as u8,
                optimize_memory_allocation: doc.bool(&["optimize_memory_allocation"], Some(false))?,
                disable_device_address_space_merge: doc
                    .bool(&["disable_device_address_space_merge"], Some(false))?,
                enable_alias_region_extra_size: doc
                    .bool(&["enable_alias_region_extra_size"], Some(false))?,
                prevent_code_reads: doc.bool(&["prevent_code_reads"], Some(false))?,
            },
            main_thread_priority: doc.int(
                &["main_thread_priority"],
                0,
                MAX_THREAD_PRIORITY as u64,
                None,
            )? as u8,
            default_cpu_id: doc.u8(&["default_cpu_id"], None)?,
            system_resource_size: doc.int(
                &["system_resource_size"],
                0,
                MAX_SYSTEM_RESOURCE_SIZE,
                Some(0),
            )? as u32,
            version: doc.u32(&["version"], Some(0))?,
            main_thread_stack_size: doc.u32(&["main_thread_stack_size"], None)?,
            acid_flags: AcidFlags {
                is_retail: doc.bool(&["is_retail"], None)?,
                unqualified_approval: doc.bool(&["unqualified_approval"], Some(false))?,
                pool_partition: doc.int(&["pool_partition"], 0, 3, None)? as u8,
            },
            program_id: doc.u64(&["program_id", "title_id"], None)?,
            program_id_range_min: doc.u64(&["program_id_range_min", "title_id_range_min"], None)?,
            program_id_range_max: doc.u64(&["program_id_range_max", "title_id_range_max"], None)?,
            fs_access: fs_access_from_doc(&fs)?,
            services: ServiceAccess {
                host: string_list(doc, "service_host")?,
                access: string_list(doc, "service_access")?,
            },
            capabilities: capabilities_from_doc(doc)?,
        })
    }

    /// Checks the fields whose ranges are narrower than their Rust types.
    pub fn validate(&self) -> BuildResult<()> {
        check_stack_size(self.main_thread_stack_size)?;
        check_name(&self.name, META_NAME_LEN)?;
        check_priority(self.main_thread_priority)?;
        check_max("address_space_type", self.flags.address_space_type as u64, 3)?;
        check_max("pool_partition", self.acid_flags.pool_partition as u64, 3)?;
        check_max(
            "system_resource_size",
            self.system_resource_size as u64,
            MAX_SYSTEM_RESOURCE_SIZE,
        )?;
        for (i, owner) in self.fs_access.save_data_owner_ids.iter().enumerate() {
            if !(1..=3).contains(&owner.accessibility) {
                return Err(BuildError::OutOfRange {
                    path: format!("filesystem_access.save_data_owner_ids[{i}].accessibility"),
                    value: owner.accessibility as i128,
                    min: 1,
                    max: 3,
                });
            }
        }
        Ok(())
    }
}

fn check_max(path: &str, value: u64, max: u64) -> BuildResult<()> {
    if value > max {
        return Err(BuildError::OutOfRange {
            path: path.to_string(),
            value: value as i128,
            min: 0,
            max,
        });
    }
    Ok(())
}

fn string_list(doc: &Doc<'_>, key: &'static str) -> BuildResult<Vec<String>> {
    doc.list(&[key], false)?
        .iter()
        .map(|node| node.str().map(str::to_string))
        .collect()
}

fn fs_access_from_doc(fs: &Doc<'_>) -> BuildResult<FsAccess> {
    let mut content_owner_ids = Vec::new();
    for node in fs.list(&["content_owner_ids"], true)? {
        let id = parse_int(node.value)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| {
                BuildError::structural(format!(
                    "`{}` must be a 64-bit integer content owner ID",
                    node.path
                ))
            })?;
        content_owner_ids.push(id);
    }

    let mut save_data_owner_ids = Vec::new();
    for node in fs.list(&["save_data_owner_ids"], true)? {
        let entry = node.dict().map_err(|_| {
            BuildError::structural(format!(
                "`{}` must be a dict with `accessibility` and `id`",
                node.path
            ))
        })?;
        save_data_owner_ids.push(SaveDataOwner {
            accessibility: entry.int(&["accessibility"], 1, 3, None)? as u8,
            id: entry.u64(&["id"], None)?,
        });
    }

    Ok(FsAccess {
        permissions: fs.u64(&["permissions"], None)?,
        content_owner_ids,
        save_data_owner_ids,
    })
}

fn check_service_name(name: &str, path: String) -> BuildResult<()> {
    if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
        return Err(BuildError::InvalidString {
            path,
            why: "must be between 1 and 8 characters long",
        });
    }
    if !name.is_ascii() {
        return Err(BuildError::InvalidString {
            path,
            why: "must be ASCII",
        });
    }
    Ok(())
}

/// Service access control: one length-tagged name per entry, hosted services first.
pub fn build_sac(services: &ServiceAccess) -> BuildResult<BinaryWriter> {
    let mut w = BinaryWriter::new();
    for (key, names, host_bit) in [
        ("service_host", &services.host, SERVICE_HOST_BIT),
        ("service_access", &services.access, 0),
    ] {
        for (i, name) in names.iter().enumerate() {
            check_service_name(name, format!("{key}[{i}]"))?;
            w.write_u8(host_bit | (name.len() as u8 - 1));
            w.write_str(name);
        }
    }
    Ok(w)
}

/// Embeds `sub` at the next section-aligned offset and returns its extent
/// relative to the start of the writer.
fn embed_aligned(w: &mut BinaryWriter, sub: &BinaryWriter) -> BuildResult<Extent> {
    w.align(SECTION_ALIGN)?;
    let start = w.mark();
    w.embed(sub);
    Ok(w.extent_since(start, Mark::START))
}

/// Access control descriptor: the signed envelope of what the process may ever request.
pub fn build_acid(
    config: &NpdmConfig,
    sac: &BinaryWriter,
    caps: &BinaryWriter,
) -> BuildResult<BinaryWriter> {
    let mut w = BinaryWriter::new();
    // Signing is not performed: signature and modulus stay zero.
    w.fill(0, ACID_SIGNATURE_SIZE);
    w.fill(0, ACID_PUBLIC_KEY_SIZE);

    w.write_bytes(NPDM_ACID_MAGIC);
    let size_slot = w.reserve_u32();
    w.seek_rel(4);
    w.write_u32(config.acid_flags.bits());
    w.write_u64(config.program_id_range_min);
    w.write_u64(config.program_id_range_max);
    let fac_slot = w.reserve_extent();
    let sac_slot = w.reserve_extent();
    let kc_slot = w.reserve_extent();
    w.seek_rel(8);

    // Filesystem access control: permission mask only, empty owner ranges.
    let fac_start = w.mark();
    w.write_u8(FS_ACCESS_VERSION);
    w.write_u8(0);
    w.write_u8(0);
    w.seek(fac_start.pos() + 4);
    w.write_u64(config.fs_access.permissions);
    for _ in 0..4 {
        w.write_u64(0);
    }
    let fac = w.extent_since(fac_start, Mark::START);

    let sac_extent = embed_aligned(&mut w, sac)?;
    let kc_extent = embed_aligned(&mut w, caps)?;

    let signed_size = w.position() - ACID_SIGNATURE_SIZE;
    w.patch_u32(size_slot, to_u32(signed_size as u64, "ACID size")?);
    w.patch_extent(fac_slot, fac, "ACID filesystem access control")?;
    w.patch_extent(sac_slot, sac_extent, "ACID service access control")?;
    w.patch_extent(kc_slot, kc_extent, "ACID kernel capabilities")?;
    Ok(w)
}

/// Access control info: the concrete grants for this program.
pub fn build_aci(
    config: &NpdmConfig,
    sac: &BinaryWriter,
    caps: &BinaryWriter,
) -> BuildResult<BinaryWriter> {
    let fs = &config.fs_access;
    let mut w = BinaryWriter::new();

    w.write_bytes(NPDM_ACI_MAGIC);
    w.seek_rel(0xC);
    w.write_u64(config.program_id);
    w.seek_rel(8);
    let fah_slot = w.reserve_extent();
    let sac_slot = w.reserve_extent();
    let kc_slot = w.reserve_extent();
    w.seek_rel(8);

    let fah_start = w.mark();
    w.write_u32(FS_ACCESS_VERSION as u32);
    w.write_u64(fs.permissions);
    let coi_slot = w.reserve_extent();
    let sdoi_slot = w.reserve_extent();

    let coi_start = w.mark();
    if !fs.content_owner_ids.is_empty() {
        let count = to_u32(fs.content_owner_ids.len() as u64, "content owner ID count")?;
        w.write_u32(count);
        for id in &fs.content_owner_ids {
            w.write_u64(*id);
        }
    }
    let coi = w.extent_since(coi_start, fah_start);

    let sdoi_start = w.mark();
    if !fs.save_data_owner_ids.is_empty() {
        let count = to_u32(fs.save_data_owner_ids.len() as u64, "save data owner ID count")?;
        w.write_u32(count);
        for owner in &fs.save_data_owner_ids {
            w.write_u8(owner.accessibility);
        }
        w.align(4)?;
        for owner in &fs.save_data_owner_ids {
            w.write_u64(owner.id);
        }
    }
    let sdoi = w.extent_since(sdoi_start, fah_start);
    let fah = w.extent_since(fah_start, Mark::START);
    w.patch_extent(coi_slot, coi, "content owner IDs")?;
    w.patch_extent(sdoi_slot, sdoi, "save data owner IDs")?;

    let sac_extent = embed_aligned(&mut w, sac)?;
    let kc_extent = embed_aligned(&mut w, caps)?;

    w.patch_extent(fah_slot, fah, "ACI filesystem access header")?;
    w.patch_extent(sac_slot, sac_extent, "ACI service access control")?;
    w.patch_extent(kc_slot, kc_extent, "ACI kernel capabilities")?;
    Ok(w)
}

/// Builds a complete NPDM file.
pub fn build_npdm(config: &NpdmConfig) -> BuildResult<BinaryWriter> {
    config.validate()?;
    let sac = build_sac(&config.services)?;
    let caps = encode_capabilities(&config.capabilities)?;
    let acid = build_acid(config, &sac, &caps)?;
    let aci = build_aci(config, &sac, &caps)?;

    let mut w = BinaryWriter::new();
    w.write_bytes(NPDM_META_MAGIC);
    w.write_u32(config.signature_key_generation);
    w.seek_rel(4);
    w.write_u8(config.flags.bits());
    w.seek_rel(1);
    w.write_u8(config.main_thread_priority);
    w.write_u8(config.default_cpu_id);
    w.seek_rel(4);
    w.write_u32(config.system_resource_size);
    w.write_u32(config.version);
    w.write_u32(config.main_thread_stack_size);
    w.write_fixed_str(&config.name, META_NAME_LEN);
    // Product code.
    w.fill(0, 0x10);
    w.seek_rel(0x30);
    let aci_slot = w.reserve_extent();
    let acid_slot = w.reserve_extent();
    debug_assert_eq!(w.position(), META_SIZE);

    let acid_extent = embed_aligned(&mut w, &acid)?;
    let aci_extent = embed_aligned(&mut w, &aci)?;

    w.patch_extent(aci_slot, aci_extent, "ACI")?;
    w.patch_extent(acid_slot, acid_extent, "ACID")?;
    Ok(w)
}
