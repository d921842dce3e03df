// Byte layouts of blocks and independent readers over them
//
// Every derived block maps onto runs of its disks. Slicing composes those
// runs, so a partition inside a partition still reads straight from the disk.

use crate::disk::DiskRef;
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// A run of a block stored contiguously on one disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Disk index in the engine's disk list
    pub disk: usize,
    pub offset: u64,
    pub length: u64,
}

/// Serializable description of where a block's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    /// The whole disk at `index`
    Disk { index: usize },
    /// Concatenation of disk runs
    Extents { extents: Vec<Extent> },
    /// Bytes produced by a decoder, not persisted
    Memory,
    /// No readable content
    Detached,
}

#[derive(Clone)]
pub(crate) struct BoundExtent {
    index: usize,
    disk: DiskRef,
    offset: u64,
    length: u64,
}

/// Runtime content of a block: a layout with live disk handles
#[derive(Clone)]
pub(crate) enum Content {
    Disk(usize, DiskRef),
    Extents(Vec<BoundExtent>),
    Memory { data: Arc<[u8]>, start: usize, len: usize },
    Detached,
}

impl Content {
    pub(crate) fn memory(data: Vec<u8>) -> Self {
        let len = data.len();
        Content::Memory {
            data: data.into(),
            start: 0,
            len,
        }
    }

    /// Rebind a persisted layout to the disks it refers to.
    /// Memory content is not persisted and comes back detached.
    pub(crate) fn bind(layout: &Layout, disks: &[DiskRef]) -> Result<Self> {
        let disk_at = |index: usize| {
            disks.get(index).cloned().ok_or_else(|| {
                StrataError::InvalidState(format!(
                    "layout refers to disk {} but only {} disks exist",
                    index,
                    disks.len()
                ))
            })
        };

        Ok(match layout {
            Layout::Disk { index } => Content::Disk(*index, disk_at(*index)?),
            Layout::Extents { extents } => Content::Extents(
                extents
                    .iter()
                    .map(|e| {
                        Ok(BoundExtent {
                            index: e.disk,
                            disk: disk_at(e.disk)?,
                            offset: e.offset,
                            length: e.length,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Layout::Memory | Layout::Detached => Content::Detached,
        })
    }

    pub(crate) fn layout(&self) -> Layout {
        match self {
            Content::Disk(index, _) => Layout::Disk { index: *index },
            Content::Extents(extents) => Layout::Extents {
                extents: extents
                    .iter()
                    .map(|e| Extent {
                        disk: e.index,
                        offset: e.offset,
                        length: e.length,
                    })
                    .collect(),
            },
            Content::Memory { .. } => Layout::Memory,
            Content::Detached => Layout::Detached,
        }
    }

    /// Readable length, `None` for detached content
    pub(crate) fn len(&self) -> Option<u64> {
        match self {
            Content::Disk(_, disk) => Some(disk.size()),
            Content::Extents(extents) => Some(extents.iter().map(|e| e.length).sum()),
            Content::Memory { len, .. } => Some(*len as u64),
            Content::Detached => None,
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        match self {
            Content::Disk(_, disk) => disk.is_available(),
            Content::Extents(extents) => extents.iter().all(|e| e.disk.is_available()),
            Content::Memory { .. } => true,
            Content::Detached => false,
        }
    }

    /// Extents covering `[offset, offset + length)` of this content
    fn runs(&self, offset: u64, length: u64) -> Vec<BoundExtent> {
        let source: Vec<BoundExtent> = match self {
            Content::Disk(index, disk) => vec![BoundExtent {
                index: *index,
                disk: Arc::clone(disk),
                offset: 0,
                length: disk.size(),
            }],
            Content::Extents(extents) => extents.clone(),
            _ => return Vec::new(),
        };

        let mut runs = Vec::new();
        let end = offset + length;
        let mut base = 0u64;
        for extent in source {
            let extent_end = base + extent.length;
            if extent_end > offset && base < end {
                let start_in = offset.saturating_sub(base);
                let stop_in = (end - base).min(extent.length);
                runs.push(BoundExtent {
                    index: extent.index,
                    disk: extent.disk,
                    offset: extent.offset + start_in,
                    length: stop_in - start_in,
                });
            }
            base = extent_end;
            if base >= end {
                break;
            }
        }
        runs
    }

    /// Sub-range of this content. The caller has validated the bounds.
    pub(crate) fn slice(&self, offset: u64, length: u64) -> Self {
        match self {
            Content::Disk(..) | Content::Extents(_) => Content::Extents(self.runs(offset, length)),
            Content::Memory { data, start, .. } => Content::Memory {
                data: Arc::clone(data),
                start: start + offset as usize,
                len: length as usize,
            },
            Content::Detached => Content::Detached,
        }
    }

    /// Concatenate the content of several blocks. Memory or detached parts
    /// cannot be mapped onto disks and make the result detached.
    pub(crate) fn concat(parts: &[&Content]) -> Self {
        let mut extents = Vec::new();
        for part in parts {
            match part {
                Content::Disk(..) | Content::Extents(_) => {
                    let len = part.len().unwrap_or(0);
                    extents.extend(part.runs(0, len));
                }
                _ => return Content::Detached,
            }
        }
        Content::Extents(extents)
    }

    /// Positioned read, a single underlying request at most
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self {
            Content::Disk(_, disk) => disk.read_at(offset, buf),
            Content::Extents(extents) => {
                let mut base = 0u64;
                for extent in extents {
                    if offset < base + extent.length {
                        let within = offset - base;
                        let count = ((extent.length - within).min(buf.len() as u64)) as usize;
                        return extent.disk.read_at(extent.offset + within, &mut buf[..count]);
                    }
                    base += extent.length;
                }
                Ok(0)
            }
            Content::Memory { data, start, len } => {
                if offset >= *len as u64 {
                    return Ok(0);
                }
                let from = start + offset as usize;
                let count = buf.len().min(len - offset as usize);
                buf[..count].copy_from_slice(&data[from..from + count]);
                Ok(count)
            }
            Content::Detached => Err(StrataError::Unavailable(
                "block has no readable content".to_string(),
            )),
        }
    }
}

/// What a reader pulls bytes from. A bare disk handle carries no position
/// in any engine's disk list, so it never becomes block content.
enum Source {
    Block(Content),
    Disk(DiskRef),
}

/// Independent reader over one block's bytes.
///
/// Each reader owns its cursor; any number may be open on the same block.
pub struct BlockReader {
    source: Source,
    size: u64,
    position: u64,
}

impl BlockReader {
    pub(crate) fn new(content: Content, size: u64) -> Self {
        Self {
            source: Source::Block(content),
            size,
            position: 0,
        }
    }

    pub(crate) fn over_disk(disk: DiskRef) -> Self {
        Self {
            size: disk.size(),
            source: Source::Disk(disk),
            position: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Positioned read that leaves the cursor untouched
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let max = ((self.size - offset).min(buf.len() as u64)) as usize;
        match &self.source {
            Source::Block(content) => content.read_at(offset, &mut buf[..max]),
            Source::Disk(disk) => disk.read_at(offset, &mut buf[..max]),
        }
    }

    /// Fill `buf` completely from `offset` or fail
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(StrataError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "short read: wanted {} bytes at offset {}, got {}",
                        buf.len(),
                        offset,
                        filled
                    ),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read `length` bytes at `offset` into a new buffer. The range is
    /// checked against the reader size before anything is allocated.
    pub fn read_vec_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        if length as u64 > self.size.saturating_sub(offset) {
            return Err(StrataError::InvalidRange {
                offset,
                length: length as u64,
                size: self.size,
            });
        }
        let mut buf = vec![0u8; length];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .read_at(self.position, buf)
            .map_err(|e| match e {
                StrataError::IoError(io) => io,
                other => io::Error::new(io::ErrorKind::Other, other),
            })?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for BlockReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;

    fn numbered_disk(len: usize) -> DiskRef {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Arc::new(MemoryDisk::new("numbers", data))
    }

    #[test]
    fn test_slice_of_slice_maps_onto_disk() {
        let disk = numbered_disk(4096);
        let whole = Content::Disk(0, disk);
        let outer = whole.slice(1024, 2048);
        let inner = outer.slice(512, 100);

        assert_eq!(
            inner.layout(),
            Layout::Extents {
                extents: vec![Extent { disk: 0, offset: 1536, length: 100 }]
            }
        );

        let reader = BlockReader::new(inner, 100);
        let bytes = reader.read_vec_at(0, 4).unwrap();
        let expected: Vec<u8> = (1536..1540).map(|i| (i % 251) as u8).collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_concat_reads_across_parts() {
        let a = Content::memory(vec![1, 2, 3]);
        let disk = numbered_disk(16);
        let d = Content::Disk(0, Arc::clone(&disk));
        // Memory parts cannot be described by extents
        assert!(matches!(Content::concat(&[&a, &d]), Content::Detached));

        let first = d.slice(0, 4);
        let second = d.slice(8, 4);
        let joined = Content::concat(&[&first, &second]);
        assert_eq!(joined.len(), Some(8));

        let mut reader = BlockReader::new(joined, 8);
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![0, 1, 2, 3, 8, 9, 10, 11]);
    }

    #[test]
    fn test_readers_have_independent_cursors() {
        let content = Content::memory(b"abcdefgh".to_vec());
        let mut r1 = BlockReader::new(content.clone(), 8);
        let mut r2 = BlockReader::new(content, 8);

        let mut buf = [0u8; 3];
        r1.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        r2.seek(SeekFrom::End(-2)).unwrap();
        r2.read_exact(&mut buf[..2]).unwrap();
        assert_eq!(&buf[..2], b"gh");
        r1.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn test_read_vec_past_end_is_rejected_before_allocating() {
        let reader = BlockReader::new(Content::memory(vec![0u8; 64]), 64);
        assert!(matches!(
            reader.read_vec_at(0, usize::MAX),
            Err(StrataError::InvalidRange { offset: 0, size: 64, .. })
        ));
        assert!(matches!(
            reader.read_vec_at(u64::MAX, 1),
            Err(StrataError::InvalidRange { .. })
        ));
        assert!(matches!(
            reader.read_vec_at(60, 8),
            Err(StrataError::InvalidRange { offset: 60, length: 8, size: 64 })
        ));
        assert_eq!(reader.read_vec_at(60, 4).unwrap().len(), 4);
    }

    #[test]
    fn test_disk_reader_reads_the_whole_disk() {
        use crate::disk::DiskExt;

        let disk = numbered_disk(600);
        let reader = disk.new_reader();
        assert_eq!(reader.size(), 600);
        let expected: Vec<u8> = (596..600).map(|i| (i % 251) as u8).collect();
        assert_eq!(reader.read_vec_at(596, 4).unwrap(), expected);
        assert!(reader.read_vec_at(598, 4).is_err());
    }

    #[test]
    fn test_detached_content_fails_to_read() {
        let reader = BlockReader::new(Content::Detached, 10);
        let mut buf = [0u8; 4];
        assert!(matches!(reader.read_at(0, &mut buf), Err(StrataError::Unavailable(_))));
    }

    #[test]
    fn test_bind_rejects_unknown_disk() {
        let layout = Layout::Extents {
            extents: vec![Extent { disk: 3, offset: 0, length: 1 }],
        };
        assert!(matches!(
            Content::bind(&layout, &[numbered_disk(4)]),
            Err(StrataError::InvalidState(_))
        ));
    }
}
