//! Field-list blob encoding
//!
//! ```text
//! header   varint  count << 3 | (offset_width - 1)
//! [mheader varint  mcount << 3 | (modstamp_width - 1)]   modstamp variant only
//! offsets  (count - 1) x offset_width bytes, big-endian, non-decreasing
//! [mstamps mcount x modstamp_width bytes, big-endian]    modstamp variant only
//! spans    concatenated value spans
//! ```
//!
//! The count takes header bits 3..=34. Bit 35 is reserved and must be zero;
//! a header with it set, or with any higher bit set, is corrupt.
//!
//! The first offset is implicitly 0 and offsets are relative to the start of
//! the spans. A span is empty for a null field; otherwise it opens with a
//! varint value-spec: `0` means interned and is followed by a varint row
//! pointer, `n > 0` means type hint `n - 1` and the rest of the span is the
//! raw value.

use std::io::{Read, Seek};

use super::varint::{min_width, read_varint, varint_len, write_be, write_varint};
use crate::modstamp::Modstamp;
use crate::reader::{BlobFieldsReader, FieldsReader};
use crate::storage::error::{StoreError, StoreResult};

/// A single field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum FieldValue {
    /// No value
    #[default]
    Null,
    /// Inline value with an application-defined type hint
    Raw { type_hint: u32, bytes: Vec<u8> },
    /// Pointer to a row in the interning table
    Interned(i64),
}

impl FieldValue {
    /// Convenience constructor for raw values
    pub fn raw(type_hint: u32, bytes: impl Into<Vec<u8>>) -> Self {
        FieldValue::Raw {
            type_hint,
            bytes: bytes.into(),
        }
    }

    /// Raw UTF-8 text with type hint 0
    pub fn text(value: &str) -> Self {
        Self::raw(0, value.as_bytes())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Encoded span length in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            FieldValue::Null => 0,
            FieldValue::Raw { type_hint, bytes } => {
                varint_len(u64::from(*type_hint) + 1) + bytes.len()
            }
            FieldValue::Interned(row) => 1 + varint_len(*row as u64),
        }
    }

    fn write_span(&self, out: &mut Vec<u8>) {
        match self {
            FieldValue::Null => {}
            FieldValue::Raw { type_hint, bytes } => {
                write_varint(out, u64::from(*type_hint) + 1);
                out.extend_from_slice(bytes);
            }
            FieldValue::Interned(row) => {
                write_varint(out, 0);
                write_varint(out, *row as u64);
            }
        }
    }

    /// Decode one value span
    pub fn from_span(span: &[u8]) -> StoreResult<Self> {
        if span.is_empty() {
            return Ok(FieldValue::Null);
        }
        let (spec, used) =
            read_varint(span).ok_or_else(|| StoreError::corrupt("truncated value-spec"))?;
        let rest = &span[used..];
        if spec == 0 {
            let (row, row_len) =
                read_varint(rest).ok_or_else(|| StoreError::corrupt("truncated interned row"))?;
            if row_len != rest.len() {
                return Err(StoreError::corrupt("trailing bytes after interned row"));
            }
            return Ok(FieldValue::Interned(row as i64));
        }
        let type_hint = u32::try_from(spec - 1)
            .map_err(|_| StoreError::corrupt(format!("type hint {} exceeds u32", spec - 1)))?;
        Ok(FieldValue::Raw {
            type_hint,
            bytes: rest.to_vec(),
        })
    }
}

/// Pack `count` and a width (1..=8) into a header varint value
pub(crate) fn pack_header(count: usize, width: usize) -> u64 {
    debug_assert!((1..=8).contains(&width));
    ((count as u64) << 3) | (width as u64 - 1)
}

/// Header bit kept clear for future use
const RESERVED_HEADER_BIT: u64 = 1 << 35;

/// Split a header varint value into `(count, width)`
pub(crate) fn unpack_header(header: u64) -> StoreResult<(usize, usize)> {
    if header & RESERVED_HEADER_BIT != 0 {
        return Err(StoreError::corrupt(format!(
            "header {:#x} sets the reserved bit",
            header
        )));
    }
    if header >> 36 != 0 {
        return Err(StoreError::corrupt(format!(
            "header {:#x} has a count wider than 32 bits",
            header
        )));
    }
    Ok(((header >> 3) as usize, (header & 0x7) as usize + 1))
}

/// Span offsets for `values`: element 0 is always 0
fn span_offsets(values: &[FieldValue]) -> (Vec<u64>, u64) {
    let mut offsets = Vec::with_capacity(values.len());
    let mut total = 0u64;
    for value in values {
        offsets.push(total);
        total += value.encoded_len() as u64;
    }
    (offsets, total)
}

fn write_table(out: &mut Vec<u8>, entries: &[u64], width: usize) {
    for &entry in entries {
        write_be(out, entry, width);
    }
}

/// Width used for a field list's offset table
pub fn offset_width(values: &[FieldValue]) -> usize {
    let (offsets, _) = span_offsets(values);
    min_width(offsets.last().copied().unwrap_or(0))
}

/// Encode an ordered field list
pub fn encode(values: &[FieldValue]) -> Vec<u8> {
    let (offsets, total) = span_offsets(values);
    let width = min_width(offsets.last().copied().unwrap_or(0));
    let stored = offsets.get(1..).unwrap_or(&[]);

    let mut out = Vec::with_capacity(
        varint_len(pack_header(values.len(), width)) + stored.len() * width + total as usize,
    );
    write_varint(&mut out, pack_header(values.len(), width));
    write_table(&mut out, stored, width);
    for value in values {
        value.write_span(&mut out);
    }
    out
}

/// Encode an ordered field list with a parallel modstamp array
///
/// Modstamps are stored as unsigned fixed-width integers; negative values
/// are clamped to 0.
pub fn encode_with_modstamps(values: &[FieldValue], modstamps: &[Modstamp]) -> Vec<u8> {
    let (offsets, total) = span_offsets(values);
    let width = min_width(offsets.last().copied().unwrap_or(0));
    let stored = offsets.get(1..).unwrap_or(&[]);

    let stamps: Vec<u64> = modstamps.iter().map(|&m| m.max(0) as u64).collect();
    let stamp_width = min_width(stamps.iter().copied().max().unwrap_or(0));

    let mut out = Vec::with_capacity(
        2 * super::varint::MAX_VARINT_LEN
            + stored.len() * width
            + stamps.len() * stamp_width
            + total as usize,
    );
    write_varint(&mut out, pack_header(values.len(), width));
    write_varint(&mut out, pack_header(stamps.len(), stamp_width));
    write_table(&mut out, stored, width);
    write_table(&mut out, &stamps, stamp_width);
    for value in values {
        value.write_span(&mut out);
    }
    out
}

/// Decode field `index` from an encoded stream
///
/// Indices past the stored field count decode as `Null`.
pub fn decode<R: Read + Seek>(src: R, index: usize) -> StoreResult<FieldValue> {
    let mut reader = BlobFieldsReader::open(src)?;
    if index >= reader.field_count() {
        return Ok(FieldValue::Null);
    }
    reader.read_field_val(index)
}

/// Decode every field of an in-memory blob
pub fn decode_all(bytes: &[u8]) -> StoreResult<Vec<FieldValue>> {
    let mut reader = BlobFieldsReader::open(std::io::Cursor::new(bytes))?;
    (0..reader.field_count())
        .map(|i| reader.read_field_val(i))
        .collect()
}

/// Decode every field and modstamp of an in-memory modstamp-variant blob
pub fn decode_all_with_modstamps(bytes: &[u8]) -> StoreResult<(Vec<FieldValue>, Vec<Modstamp>)> {
    let mut reader = BlobFieldsReader::open_with_modstamps(std::io::Cursor::new(bytes))?;
    let values = (0..reader.field_count())
        .map(|i| reader.read_field_val(i))
        .collect::<StoreResult<Vec<_>>>()?;
    let stamps = (0..reader.modstamp_count())
        .map(|i| reader.read_modstamp(i))
        .collect::<StoreResult<Vec<_>>>()?;
    Ok((values, stamps))
}
