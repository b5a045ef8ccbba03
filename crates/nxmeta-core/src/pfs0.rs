//! PFS0 flat archives: a header, an entry table, a string pool of file names,
//! then the concatenated file contents.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nxmeta_contracts::PFS0_MAGIC;

use crate::error::{BuildError, BuildResult};
use crate::writer::{to_u32, BinaryWriter};

const HEADER_SIZE: usize = 0x10;
const ENTRY_SIZE: usize = 0x18;
const DATA_ALIGN: usize = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pfs0Entry {
    pub name: String,
    pub data: Vec<u8>,
}

fn check_entry_name(name: &str) -> BuildResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(BuildError::structural(format!(
            "invalid archive entry name {name:?}"
        )));
    }
    Ok(())
}

pub fn build_pfs0(entries: &[Pfs0Entry]) -> BuildResult<BinaryWriter> {
    for entry in entries {
        check_entry_name(&entry.name)?;
    }
    let entry_count = to_u32(entries.len() as u64, "archive entry count")?;
    let string_pool_offset = HEADER_SIZE + ENTRY_SIZE * entries.len();

    let mut w = BinaryWriter::new();
    w.seek(string_pool_offset);
    let mut name_offsets = Vec::with_capacity(entries.len());
    for entry in entries {
        name_offsets.push(w.position() - string_pool_offset);
        w.write_str(&entry.name);
        w.write_u8(0);
    }
    w.align(DATA_ALIGN)?;
    let data_offset = w.position();

    let mut data_cursor = 0u64;
    for entry in entries {
        w.write_bytes(&entry.data);
    }

    w.seek(0);
    w.write_bytes(PFS0_MAGIC);
    w.write_u32(entry_count);
    w.write_u32(to_u32((data_offset - string_pool_offset) as u64, "string pool size")?);
    w.write_u32(0);
    for (entry, name_offset) in entries.iter().zip(name_offsets) {
        w.write_u64(data_cursor);
        w.write_u64(entry.data.len() as u64);
        w.write_u32(to_u32(name_offset as u64, "string pool offset")?);
        w.write_u32(0);
        data_cursor += entry.data.len() as u64;
    }
    Ok(w)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn slice(&self, offset: u64, size: u64, what: &str) -> BuildResult<&'a [u8]> {
        let range = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(size).ok())
            .and_then(|(start, size)| Some(start..start.checked_add(size)?))
            .filter(|r| r.end <= self.bytes.len());
        match range {
            Some(r) => Ok(&self.bytes[r]),
            None => Err(BuildError::structural(format!(
                "unexpected end of archive reading {what} at {offset:#x} (size {size:#x})"
            ))),
        }
    }

    fn u32(&self, offset: u64, what: &str) -> BuildResult<u32> {
        let b = self.slice(offset, 4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, offset: u64, what: &str) -> BuildResult<u64> {
        let b = self.slice(offset, 8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn c_str(&self, offset: u64, limit: u64, what: &str) -> BuildResult<&'a str> {
        let region = self.slice(offset, limit.saturating_sub(offset), what)?;
        let len = region.iter().position(|b| *b == 0).ok_or_else(|| {
            BuildError::structural(format!("unterminated {what} at {offset:#x}"))
        })?;
        std::str::from_utf8(&region[..len])
            .map_err(|_| BuildError::structural(format!("{what} at {offset:#x} is not UTF-8")))
    }
}

pub fn parse_pfs0(bytes: &[u8]) -> BuildResult<Vec<Pfs0Entry>> {
    let r = Reader { bytes };
    let magic = r.slice(0, 4, "magic")?;
    if magic != PFS0_MAGIC {
        return Err(BuildError::structural(format!(
            "file signature was {:?}, expected {:?}",
            String::from_utf8_lossy(magic),
            String::from_utf8_lossy(PFS0_MAGIC)
        )));
    }
    let entry_count = r.u32(4, "entry count")? as u64;
    let string_pool_size = r.u32(8, "string pool size")? as u64;
    let string_pool_offset = HEADER_SIZE as u64 + ENTRY_SIZE as u64 * entry_count;
    let data_offset = string_pool_offset + string_pool_size;
    r.slice(string_pool_offset, string_pool_size, "string pool")?;

    let mut entries = Vec::with_capacity(entry_count.min(0x1000) as usize);
    for i in 0..entry_count {
        let at = HEADER_SIZE as u64 + ENTRY_SIZE as u64 * i;
        let offset = r.u64(at, "entry offset")?;
        let size = r.u64(at + 8, "entry size")?;
        let name_offset = r.u32(at + 0x10, "entry name offset")? as u64;

        let name = r.c_str(string_pool_offset + name_offset, data_offset, "entry name")?;
        check_entry_name(name)?;
        let data = r.slice(
            data_offset.checked_add(offset).ok_or_else(|| {
                BuildError::structural(format!("entry {name:?} offset overflows"))
            })?,
            size,
            "entry data",
        )?;
        entries.push(Pfs0Entry {
            name: name.to_string(),
            data: data.to_vec(),
        });
    }
    Ok(entries)
}

/// Collects the regular files of `dir`, sorted by name.
pub fn read_dir_entries(dir: &Path) -> Result<Vec<Pfs0Entry>> {
    if !dir.is_dir() {
        anyhow::bail!("input dir doesn't exist: {}", dir.display());
    }
    let mut entries = Vec::new();
    for item in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let item = item.with_context(|| format!("list dir: {}", dir.display()))?;
        if !item.file_type().is_file() {
            return Err(BuildError::structural(format!(
                "input dir mustn't contain anything but files: {}",
                item.path().display()
            ))
            .into());
        }
        let name = item
            .file_name()
            .to_str()
            .with_context(|| format!("non UTF-8 file name: {}", item.path().display()))?
            .to_string();
        let data = std::fs::read(item.path())
            .with_context(|| format!("read: {}", item.path().display()))?;
        entries.push(Pfs0Entry { name, data });
    }
    Ok(entries)
}

/// Writes every entry into `out_dir`, creating it if needed. Returns the written paths.
pub fn write_entries(out_dir: &Path, entries: &[Pfs0Entry]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create dir: {}", out_dir.display()))?;
    let mut written = Vec::with_capacity(entries.len());
    for entry in entries {
        check_entry_name(&entry.name)?;
        let path = out_dir.join(&entry.name);
        std::fs::write(&path, &entry.data)
            .with_context(|| format!("write: {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
