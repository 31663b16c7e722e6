//! Streaming field readers
//!
//! [`BlobFieldsReader`] decodes one encoded field list straight from a
//! `Read + Seek` source such as an incremental SQLite blob, touching only
//! the header, the offsets it needs and the requested span.
//!
//! [`HotColdFieldsReader`] joins an item's hot and cold blobs into one
//! index space. The cold blob is opened lazily, at most once, through a
//! callback supplied by the owner.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use crate::codec::fields::{unpack_header, FieldValue};
use crate::codec::varint::{read_be, read_varint_from};
use crate::modstamp::Modstamp;
use crate::storage::error::{StoreError, StoreResult};

/// Random access to an ordered list of field values
pub trait FieldsReader {
    /// Number of addressable fields
    fn field_count(&self) -> usize;

    /// Read the value at `index`
    fn read_field_val(&mut self, index: usize) -> StoreResult<FieldValue>;

    /// Read every field in order
    fn read_all(&mut self) -> StoreResult<Vec<FieldValue>> {
        (0..self.field_count())
            .map(|i| self.read_field_val(i))
            .collect()
    }
}

/// Streaming decoder over a single encoded field list
#[derive(Debug)]
pub struct BlobFieldsReader<R> {
    src: R,
    count: usize,
    offset_width: usize,
    stamp_count: usize,
    stamp_width: usize,
    offsets_pos: u64,
    stamps_pos: u64,
    values_pos: u64,
    values_len: u64,
}

impl<R: Read + Seek> BlobFieldsReader<R> {
    /// Open a plain field list
    pub fn open(src: R) -> StoreResult<Self> {
        Self::open_inner(src, false)
    }

    /// Open a field list written with a modstamp array
    pub fn open_with_modstamps(src: R) -> StoreResult<Self> {
        Self::open_inner(src, true)
    }

    fn open_inner(mut src: R, with_modstamps: bool) -> StoreResult<Self> {
        let total_len = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(0))?;

        let mut reader = Self {
            src,
            count: 0,
            offset_width: 1,
            stamp_count: 0,
            stamp_width: 1,
            offsets_pos: 0,
            stamps_pos: 0,
            values_pos: 0,
            values_len: 0,
        };
        if total_len == 0 {
            return Ok(reader);
        }

        let (header, mut pos) = read_varint_from(&mut reader.src)?;
        let (count, offset_width) = unpack_header(header)?;
        reader.count = count;
        reader.offset_width = offset_width;

        if with_modstamps {
            let (stamp_header, used) = read_varint_from(&mut reader.src)?;
            let (stamp_count, stamp_width) = unpack_header(stamp_header)?;
            reader.stamp_count = stamp_count;
            reader.stamp_width = stamp_width;
            pos += used;
        }

        reader.offsets_pos = pos as u64;
        reader.stamps_pos =
            reader.offsets_pos + (count.saturating_sub(1) * offset_width) as u64;
        reader.values_pos = reader.stamps_pos + (reader.stamp_count * reader.stamp_width) as u64;

        if reader.values_pos > total_len {
            return Err(StoreError::corrupt(format!(
                "field list header claims {} bytes of tables but blob has {}",
                reader.values_pos, total_len
            )));
        }
        reader.values_len = total_len - reader.values_pos;
        Ok(reader)
    }

    /// Number of modstamps stored (0 for the plain variant)
    pub fn modstamp_count(&self) -> usize {
        self.stamp_count
    }

    /// Byte width of the offset table entries
    pub fn offset_width(&self) -> usize {
        self.offset_width
    }

    fn read_fixed(&mut self, pos: u64, width: usize) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        self.src.seek(SeekFrom::Start(pos))?;
        self.src.read_exact(&mut buf[..width])?;
        Ok(read_be(&buf[..width]))
    }

    fn offset(&mut self, index: usize) -> StoreResult<u64> {
        if index == 0 {
            return Ok(0);
        }
        let pos = self.offsets_pos + ((index - 1) * self.offset_width) as u64;
        self.read_fixed(pos, self.offset_width)
    }

    /// Read modstamp `index`
    pub fn read_modstamp(&mut self, index: usize) -> StoreResult<Modstamp> {
        if index >= self.stamp_count {
            return Err(StoreError::IndexOutOfRange {
                index,
                count: self.stamp_count,
            });
        }
        let pos = self.stamps_pos + (index * self.stamp_width) as u64;
        let stamp = self.read_fixed(pos, self.stamp_width)?;
        Ok(stamp.min(i64::MAX as u64) as Modstamp)
    }

    /// Byte range of field `index` within the spans, if well formed
    fn span_range(&mut self, index: usize) -> StoreResult<Option<(u64, u64)>> {
        let start = self.offset(index)?;
        let end = if index + 1 < self.count {
            self.offset(index + 1)?
        } else {
            self.values_len
        };

        if end < start || end > self.values_len {
            debug_assert!(
                false,
                "corrupt offset table: field {} spans {}..{} of {}",
                index, start, end, self.values_len
            );
            debug!(
                index,
                start, end, "Corrupt offset table, reading field as null"
            );
            return Ok(None);
        }
        Ok(Some((start, end)))
    }
}

impl<R: Read + Seek> FieldsReader for BlobFieldsReader<R> {
    fn field_count(&self) -> usize {
        self.count
    }

    fn read_field_val(&mut self, index: usize) -> StoreResult<FieldValue> {
        if index >= self.count {
            return Err(StoreError::IndexOutOfRange {
                index,
                count: self.count,
            });
        }
        let Some((start, end)) = self.span_range(index)? else {
            return Ok(FieldValue::Null);
        };
        if start == end {
            return Ok(FieldValue::Null);
        }

        let mut span = vec![0u8; (end - start) as usize];
        self.src.seek(SeekFrom::Start(self.values_pos + start))?;
        self.src.read_exact(&mut span)?;
        FieldValue::from_span(&span)
    }
}

/// Lifecycle of a [`HotColdFieldsReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Closed,
    HotOpen,
    HotAndColdOpen,
}

enum ColdSlot<C> {
    /// Not opened yet
    Pending,
    /// Opened; the owner has no cold data
    Missing,
    Open(BlobFieldsReader<C>),
    /// Opening failed; every later cold read reports it
    Failed(String),
}

/// One logical field index space over a hot and a cold blob
///
/// Indices below `hot_count` read the hot blob. The rest read the cold blob
/// at `index - hot_count`; it is opened on first use and kept until close.
pub struct HotColdFieldsReader<H, C, F> {
    hot: Option<BlobFieldsReader<H>>,
    cold: ColdSlot<C>,
    open_cold: Option<F>,
    hot_count: usize,
    cold_count: usize,
    closed: bool,
}

impl<H, C, F> HotColdFieldsReader<H, C, F>
where
    H: Read + Seek,
    C: Read + Seek,
    F: FnOnce() -> StoreResult<Option<C>>,
{
    /// Wrap an (optional) hot stream and a cold-stream opener
    pub fn new(hot: Option<H>, hot_count: usize, cold_count: usize, open_cold: F) -> StoreResult<Self> {
        let hot = hot.map(BlobFieldsReader::open).transpose()?;
        Ok(Self {
            hot,
            cold: ColdSlot::Pending,
            open_cold: Some(open_cold),
            hot_count,
            cold_count,
            closed: false,
        })
    }

    pub fn state(&self) -> ReaderState {
        if self.closed {
            ReaderState::Closed
        } else if matches!(self.cold, ColdSlot::Pending) {
            ReaderState::HotOpen
        } else {
            ReaderState::HotAndColdOpen
        }
    }

    pub fn hot_count(&self) -> usize {
        self.hot_count
    }

    pub fn cold_count(&self) -> usize {
        self.cold_count
    }

    /// Release both streams. Idempotent.
    pub fn close(&mut self) {
        self.hot = None;
        self.cold = ColdSlot::Missing;
        self.open_cold = None;
        self.closed = true;
    }

    fn cold_reader(&mut self) -> StoreResult<Option<&mut BlobFieldsReader<C>>> {
        if matches!(self.cold, ColdSlot::Pending) {
            // The opener runs at most once. Until it returns, the slot reads as
            // failed so an unwinding opener cannot leave it looking empty.
            self.cold = ColdSlot::Failed("cold opener did not finish".to_string());
            let opened = match self.open_cold.take() {
                Some(open) => open().and_then(|stream| stream.map(BlobFieldsReader::open).transpose()),
                None => Ok(None),
            };
            match opened {
                Ok(Some(reader)) => self.cold = ColdSlot::Open(reader),
                Ok(None) => self.cold = ColdSlot::Missing,
                Err(e) => {
                    debug!(error = %e, "Opening cold fields failed");
                    self.cold = ColdSlot::Failed(e.to_string());
                    return Err(e);
                }
            }
        }
        match &mut self.cold {
            ColdSlot::Open(reader) => Ok(Some(reader)),
            ColdSlot::Failed(details) => Err(StoreError::Io(std::io::Error::other(format!(
                "cold fields unavailable: {}",
                details
            )))),
            ColdSlot::Pending | ColdSlot::Missing => Ok(None),
        }
    }
}

impl<H, C, F> FieldsReader for HotColdFieldsReader<H, C, F>
where
    H: Read + Seek,
    C: Read + Seek,
    F: FnOnce() -> StoreResult<Option<C>>,
{
    fn field_count(&self) -> usize {
        self.hot_count + self.cold_count
    }

    fn read_field_val(&mut self, index: usize) -> StoreResult<FieldValue> {
        if self.closed {
            return Err(StoreError::Closed {
                what: "fields reader",
            });
        }
        if index >= self.field_count() {
            return Err(StoreError::IndexOutOfRange {
                index,
                count: self.field_count(),
            });
        }

        if index < self.hot_count {
            return match self.hot.as_mut() {
                Some(hot) if index < hot.field_count() => hot.read_field_val(index),
                _ => Ok(FieldValue::Null),
            };
        }

        let local = index - self.hot_count;
        match self.cold_reader()? {
            Some(cold) if local < cold.field_count() => cold.read_field_val(local),
            _ => Ok(FieldValue::Null),
        }
    }
}
