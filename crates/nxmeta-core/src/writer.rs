//! Growable, randomly seekable byte buffer used by every container builder.
//!
//! Seeking or writing past the end zero-extends the buffer, so regions that are
//! skipped now and patched later read as zero until written. The buffer never
//! shrinks.

use crate::error::{BuildError, BuildResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
/// Fails if the rounded value doesn't fit in a `u64`.
pub fn align_up(value: u64, alignment: u64) -> BuildResult<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(BuildError::InvalidAlignment(alignment as usize));
    }
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(v) => Ok(v & !mask),
        None => Err(BuildError::OutOfRange {
            path: format!("value rounded up to {alignment:#x}"),
            value: value as i128,
            min: 0,
            max: u64::MAX & !mask,
        }),
    }
}

/// A cursor position captured with [`BinaryWriter::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mark(usize);

impl Mark {
    pub const START: Mark = Mark(0);

    pub fn pos(self) -> usize {
        self.0
    }
}

/// Offset and size of a finished region, relative to its enclosing section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: usize,
    pub size: usize,
}

impl Extent {
    pub fn end(self) -> usize {
        self.offset + self.size
    }
}

/// A placeholder `u32` written by [`BinaryWriter::reserve_u32`].
///
/// Consumed by [`BinaryWriter::patch_u32`], so each slot is patched at most once.
#[derive(Debug)]
#[must_use = "a reserved slot stays zero unless it is patched"]
pub struct Slot(usize);

/// An `(offset, size)` pair of placeholder `u32`s.
#[derive(Debug)]
#[must_use = "a reserved extent stays zero unless it is patched"]
pub struct ExtentSlot {
    offset: Slot,
    size: Slot,
}

#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
    pos: usize,
    order: ByteOrder,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_byte_order(order: ByteOrder) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn grow_to(&mut self, end: usize) {
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
        self.grow_to(pos);
    }

    /// Moves the cursor by `delta`; moving before the start clamps to 0.
    pub fn seek_rel(&mut self, delta: isize) {
        let pos = if delta < 0 {
            self.pos.saturating_sub(delta.unsigned_abs())
        } else {
            self.pos + delta as usize
        };
        self.seek(pos);
    }

    pub fn align(&mut self, alignment: usize) -> BuildResult<()> {
        if !alignment.is_power_of_two() {
            return Err(BuildError::InvalidAlignment(alignment));
        }
        let pos = align_up(self.pos as u64, alignment as u64)?;
        self.seek(pos as usize);
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> usize {
        let end = self.pos + data.len();
        self.grow_to(end);
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        data.len()
    }

    pub fn fill(&mut self, byte: u8, count: usize) -> usize {
        let end = self.pos + count;
        self.grow_to(end);
        self.buf[self.pos..end].fill(byte);
        self.pos = end;
        count
    }

    /// Writes the low `width` bytes of `value` in the buffer's byte order.
    fn write_uint(&mut self, value: u64, width: usize) -> usize {
        let le = value.to_le_bytes();
        match self.order {
            ByteOrder::Little => self.write_bytes(&le[..width]),
            ByteOrder::Big => {
                let be = value.to_be_bytes();
                self.write_bytes(&be[8 - width..])
            }
        }
    }

    pub fn write_u8(&mut self, value: u8) -> usize {
        self.write_uint(value as u64, 1)
    }

    pub fn write_u16(&mut self, value: u16) -> usize {
        self.write_uint(value as u64, 2)
    }

    /// Writes the low 24 bits of `value`.
    pub fn write_u24(&mut self, value: u32) -> usize {
        self.write_uint(value as u64, 3)
    }

    /// Writes the low 24 bits of `value` in two's complement.
    pub fn write_i24(&mut self, value: i32) -> usize {
        self.write_uint(value as u32 as u64, 3)
    }

    pub fn write_u32(&mut self, value: u32) -> usize {
        self.write_uint(value as u64, 4)
    }

    pub fn write_u64(&mut self, value: u64) -> usize {
        self.write_uint(value, 8)
    }

    pub fn write_i8(&mut self, value: i8) -> usize {
        self.write_uint(value as u8 as u64, 1)
    }

    pub fn write_i16(&mut self, value: i16) -> usize {
        self.write_uint(value as u16 as u64, 2)
    }

    pub fn write_i32(&mut self, value: i32) -> usize {
        self.write_uint(value as u32 as u64, 4)
    }

    pub fn write_i64(&mut self, value: i64) -> usize {
        self.write_uint(value as u64, 8)
    }

    pub fn write_str(&mut self, text: &str) -> usize {
        self.write_bytes(text.as_bytes())
    }

    /// Writes `text` into a `max_len`-byte field: truncated if longer, NUL-padded if shorter.
    pub fn write_fixed_str(&mut self, text: &str, max_len: usize) -> usize {
        let bytes = text.as_bytes();
        let n = bytes.len().min(max_len);
        self.write_bytes(&bytes[..n]);
        self.fill(0, max_len - n);
        max_len
    }

    /// Copies the complete contents of `other` at the cursor.
    pub fn embed(&mut self, other: &BinaryWriter) -> usize {
        self.write_bytes(other.as_bytes())
    }

    pub fn mark(&self) -> Mark {
        Mark(self.pos)
    }

    /// Region from `start` to the cursor, with its offset taken relative to `base`.
    pub fn extent_since(&self, start: Mark, base: Mark) -> Extent {
        Extent {
            offset: start.0 - base.0,
            size: self.pos - start.0,
        }
    }

    pub fn reserve_u32(&mut self) -> Slot {
        let slot = Slot(self.pos);
        self.write_u32(0);
        slot
    }

    pub fn reserve_extent(&mut self) -> ExtentSlot {
        let offset = self.reserve_u32();
        let size = self.reserve_u32();
        ExtentSlot { offset, size }
    }

    /// Overwrites a reserved slot and restores the cursor.
    pub fn patch_u32(&mut self, slot: Slot, value: u32) {
        let resume = self.pos;
        self.seek(slot.0);
        self.write_u32(value);
        self.seek(resume);
    }

    pub fn patch_extent(&mut self, slot: ExtentSlot, extent: Extent, what: &str) -> BuildResult<()> {
        let offset = to_u32(extent.offset as u64, what)?;
        let size = to_u32(extent.size as u64, what)?;
        self.patch_u32(slot.offset, offset);
        self.patch_u32(slot.size, size);
        Ok(())
    }
}

pub(crate) fn to_u32(value: u64, what: &str) -> BuildResult<u32> {
    u32::try_from(value).map_err(|_| BuildError::OutOfRange {
        path: what.to_string(),
        value: value as i128,
        min: 0,
        max: u32::MAX as u64,
    })
}
