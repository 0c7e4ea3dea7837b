//! In-memory firmware image.
//!
//! [`FirmwareData`] keeps the bytes of a firmware file as a list of
//! segments sorted by base address. Segments never overlap and never touch:
//! adding data that overlaps or borders existing segments merges them into
//! one, with the newly added bytes winning on overlap.
//!
//! ```text
//!  before:   [0x100 .. 0x110)          [0x120 .. 0x130)
//!  add:                 [0x10C .. 0x124)
//!  after:    [0x100 ........................... 0x130)
//! ```

use crate::error::{Error, Result};
use crate::image::srec::SrecParser;
use crate::protocol::crc::crc32_chunks;
use log::debug;
use std::fmt;
use std::path::Path;

/// Exclusive upper bound of the 32-bit address space.
const ADDRESS_SPACE_END: u64 = 1 << 32;

/// Contiguous run of firmware bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareSegment {
    base: u32,
    data: Vec<u8>,
}

impl FirmwareSegment {
    /// Create a segment; fails when empty or when it crosses 4 GiB.
    pub fn new(base: u32, data: Vec<u8>) -> Result<Self> {
        check_range(base, data.len())?;
        Ok(Self { base, data })
    }

    /// First address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Address one past the last byte.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + self.data.len() as u64
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false` for a valid segment.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Segment bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable segment bytes; the length cannot change.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Length as `u32`; valid segments always fit.
    #[allow(clippy::cast_possible_truncation)]
    pub fn len_u32(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Reads and writes firmware files of one format.
pub trait FirmwareParser: Send + Sync {
    /// Parse `path`; `address_offset` is added to every address.
    fn load(&self, path: &Path, address_offset: u32) -> Result<Vec<FirmwareSegment>>;

    /// Write `segments` to `path`.
    fn save(&self, path: &Path, segments: &[FirmwareSegment]) -> Result<()>;
}

fn check_range(address: u32, len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::InvalidArgument("firmware data must not be empty".into()));
    }
    if u64::from(address) + len as u64 > ADDRESS_SPACE_END {
        return Err(Error::InvalidArgument(format!(
            "{len} bytes at {address:#010x} exceed the 32-bit address space"
        )));
    }
    Ok(())
}

/// Sorted, merged collection of firmware segments.
pub struct FirmwareData {
    segments: Vec<FirmwareSegment>,
    parser: Box<dyn FirmwareParser>,
}

impl Default for FirmwareData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FirmwareData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareData")
            .field("segments", &self.segments.len())
            .field("total_len", &self.total_len())
            .finish_non_exhaustive()
    }
}

impl FirmwareData {
    /// Empty store using the S-record format for files.
    pub fn new() -> Self {
        Self::with_parser(Box::new(SrecParser))
    }

    /// Empty store using `parser` for files.
    pub fn with_parser(parser: Box<dyn FirmwareParser>) -> Self {
        Self {
            segments: Vec::new(),
            parser,
        }
    }

    /// Insert `data` at `address`, merging with overlapping or adjacent
    /// segments.
    pub fn add_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_range(address, data.len())?;
        let start = u64::from(address);
        let end = start + data.len() as u64;

        // Segments are sorted and disjoint, so the affected ones are contiguous.
        let first = self.segments.partition_point(|s| s.end() < start);
        let last = self.segments.partition_point(|s| u64::from(s.base) <= end);

        if first == last {
            self.segments
                .insert(first, FirmwareSegment { base: address, data: data.to_vec() });
            return Ok(());
        }

        let merged_base = self.segments[first].base.min(address);
        let merged_end = self.segments[last - 1].end().max(end);
        let base = u64::from(merged_base);
        // bounded by the 32-bit address space
        #[allow(clippy::cast_possible_truncation)]
        let mut merged = vec![0u8; (merged_end - base) as usize];
        for seg in self.segments.drain(first..last) {
            let offset = (u64::from(seg.base) - base) as usize;
            merged[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
        }
        let offset = (start - base) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        debug!(
            "Merged {} bytes at {address:#010x} into segment {merged_base:#010x}..{merged_end:#010x}",
            data.len()
        );
        self.segments.insert(first, FirmwareSegment {
            base: merged_base,
            data: merged,
        });
        Ok(())
    }

    /// Remove `len` bytes starting at `address` from the image.
    pub fn remove_data(&mut self, address: u32, len: u32) -> Result<()> {
        check_range(address, len as usize)?;
        let start = u64::from(address);
        let end = start + u64::from(len);

        let first = self.segments.partition_point(|s| s.end() <= start);
        let last = self.segments.partition_point(|s| u64::from(s.base) < end);
        if first == last {
            return Ok(());
        }

        let mut kept = Vec::with_capacity(2);
        for seg in self.segments.drain(first..last) {
            let seg_start = u64::from(seg.base);
            let seg_end = seg.end();
            if seg_start < start {
                let keep = (start - seg_start) as usize;
                kept.push(FirmwareSegment {
                    base: seg.base,
                    data: seg.data[..keep].to_vec(),
                });
            }
            if seg_end > end {
                let skip = (end - seg_start) as usize;
                // end < seg_end <= 2^32
                #[allow(clippy::cast_possible_truncation)]
                kept.push(FirmwareSegment {
                    base: end as u32,
                    data: seg.data[skip..].to_vec(),
                });
            }
        }
        self.segments.splice(first..first, kept);
        Ok(())
    }

    /// Drop all segments.
    pub fn clear_data(&mut self) {
        self.segments.clear();
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment `idx` in ascending address order.
    pub fn segment(&self, idx: usize) -> Option<&FirmwareSegment> {
        self.segments.get(idx)
    }

    /// All segments in ascending address order.
    pub fn segments(&self) -> &[FirmwareSegment] {
        &self.segments
    }

    /// Mutable access to the segment contents.
    pub fn segments_mut(&mut self) -> impl Iterator<Item = &mut FirmwareSegment> {
        self.segments.iter_mut()
    }

    /// Total number of bytes over all segments.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(FirmwareSegment::len).sum()
    }

    /// CRC32 over the concatenated segment data.
    pub fn firmware_crc32(&self) -> u32 {
        crc32_chunks(self.segments.iter().map(FirmwareSegment::data))
    }

    /// Add the contents of a firmware file.
    ///
    /// Fails with [`Error::FirmwareLoad`] when the file cannot be parsed or
    /// contains no data.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>, address_offset: u32) -> Result<()> {
        let path = path.as_ref();
        let segments = self.parser.load(path, address_offset)?;
        if segments.is_empty() {
            return Err(Error::FirmwareLoad(format!(
                "{} contains no program data",
                path.display()
            )));
        }
        for seg in segments {
            self.add_data(seg.base, &seg.data)
                .map_err(|e| Error::FirmwareLoad(format!("{}: {e}", path.display())))?;
        }
        debug!(
            "Loaded {} bytes in {} segment(s) from {}",
            self.total_len(),
            self.segment_count(),
            path.display()
        );
        Ok(())
    }

    /// Write all segments to a firmware file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.parser.save(path.as_ref(), &self.segments)
    }
}
