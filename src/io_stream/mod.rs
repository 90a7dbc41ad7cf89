//! Byte-stream access to a container.
//!
//! # Positionless reads
//! [`PffReader::read_at`] takes an absolute offset and never mutates shared
//! state, so one reader can serve many threads. A file-backed source holds
//! its `File` behind a mutex that is taken for exactly one seek+read pair;
//! a memory-backed source is a shared immutable buffer and takes no lock.
//!
//! # Sequential access
//! Callers that want a cursor get their own [`SourceCursor`], which
//! implements `Read + Seek` on top of `read_at`.
//!
//! # Bounds
//! Every read is checked against the container size before touching the
//! source. A read that would end past the container, including a non-empty
//! read starting exactly at the end, fails with `OutOfBounds`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::error::{PffError, Result};

// ── Source ───────────────────────────────────────────────────────────────────

enum Source {
    File(Mutex<File>),
    Memory(Arc<[u8]>),
}

/// Shared, bounds-checked reader over a file or an in-memory byte range.
#[derive(Clone)]
pub struct PffReader {
    source: Arc<Source>,
    size:   u64,
}

impl std::fmt::Debug for PffReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match *self.source {
            Source::File(_)   => "file",
            Source::Memory(_) => "memory",
        };
        f.debug_struct("PffReader").field("source", &kind).field("size", &self.size).finish()
    }
}

impl PffReader {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { source: Arc::new(Source::File(Mutex::new(file))), size })
    }

    /// Wrap an owned byte range.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        let size = bytes.len() as u64;
        Self { source: Arc::new(Source::Memory(bytes)), size }
    }

    /// Total container size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_bounds(&self, offset: u64, length: u64) -> Result<()> {
        let end = offset.checked_add(length);
        match end {
            Some(end) if end <= self.size && (length == 0 || offset < self.size) => Ok(()),
            _ => Err(PffError::OutOfBounds { offset, length, size: self.size }),
        }
    }

    /// Read exactly `length` bytes at `offset`.
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, length as u64)?;
        let mut buf = vec![0u8; length];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `buf` from `offset`.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len() as u64)?;
        if buf.is_empty() {
            return Ok(());
        }
        trace!(offset, length = buf.len(), "read_at");
        match &*self.source {
            Source::Memory(bytes) => {
                let start = offset as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
            }
            Source::File(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "reader lock poisoned"))?;
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
            }
        }
        Ok(())
    }

    /// Decode one little-endian fixed-width value at `offset`.
    pub fn read_fixed<T: FixedWidth>(&self, offset: u64) -> Result<T> {
        let mut buf = [0u8; 8];
        let slot = &mut buf[..T::SIZE];
        self.read_exact_at(offset, slot)?;
        Ok(T::decode(slot))
    }

    /// Independent sequential cursor starting at `offset`.
    pub fn cursor(&self, offset: u64) -> SourceCursor {
        SourceCursor { reader: self.clone(), position: offset }
    }

    /// Observer that reports when every clone of this reader is gone.
    pub fn probe(&self) -> SourceProbe {
        SourceProbe { source: Arc::downgrade(&self.source) }
    }
}

// ── Fixed-width values ───────────────────────────────────────────────────────

/// Little-endian scalar that [`PffReader::read_fixed`] can decode.
pub trait FixedWidth: Sized {
    const SIZE: usize;
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! fixed_width {
    ($($ty:ty => $size:expr, $read:expr;)*) => {
        $(impl FixedWidth for $ty {
            const SIZE: usize = $size;
            fn decode(bytes: &[u8]) -> Self { $read(bytes) }
        })*
    };
}

fixed_width! {
    u8  => 1, |b: &[u8]| b[0];
    i8  => 1, |b: &[u8]| b[0] as i8;
    u16 => 2, LittleEndian::read_u16;
    i16 => 2, LittleEndian::read_i16;
    u32 => 4, LittleEndian::read_u32;
    i32 => 4, LittleEndian::read_i32;
    u64 => 8, LittleEndian::read_u64;
    i64 => 8, LittleEndian::read_i64;
}

// ── Slice helpers ────────────────────────────────────────────────────────────

pub(crate) fn le_u16(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset.checked_add(2)?).map(LittleEndian::read_u16)
}

pub(crate) fn le_u32(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset.checked_add(4)?).map(LittleEndian::read_u32)
}

pub(crate) fn le_u64(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset.checked_add(8)?).map(LittleEndian::read_u64)
}

// ── Cursor ───────────────────────────────────────────────────────────────────

/// Private position over a shared reader.
pub struct SourceCursor {
    reader:   PffReader,
    position: u64,
}

impl SourceCursor {
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for SourceCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.reader.size.saturating_sub(self.position);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.reader
            .read_exact_at(self.position, &mut buf[..n])
            .map_err(|e| match e {
                PffError::Io(io) => io,
                other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
            })?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for SourceCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p)   => Some(p),
            SeekFrom::End(d)     => self.reader.size.checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        let target = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.position = target;
        Ok(target)
    }
}

// ── Release probe ────────────────────────────────────────────────────────────

/// Weak observer of a reader's underlying resource.
#[derive(Clone)]
pub struct SourceProbe {
    source: Weak<Source>,
}

impl SourceProbe {
    /// True once the file handle or buffer has been dropped.
    pub fn is_released(&self) -> bool {
        self.source.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    fn sample() -> PffReader {
        PffReader::from_bytes((0u8..64).collect::<Vec<_>>())
    }

    #[test]
    fn read_inside_bounds() {
        let r = sample();
        assert_eq!(r.read_at(4, 4).unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(r.read_at(60, 4).unwrap(), vec![60, 61, 62, 63]);
        assert!(r.read_at(0, 0).unwrap().is_empty());
    }

    #[test]
    fn read_at_end_is_out_of_bounds() {
        let r = sample();
        let err = r.read_at(64, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        let err = r.read_at(62, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        let err = r.read_at(u64::MAX, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn fixed_width_little_endian() {
        let r = PffReader::from_bytes(vec![0x34, 0x12, 0x78, 0x56, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(r.read_fixed::<u16>(0).unwrap(), 0x1234);
        assert_eq!(r.read_fixed::<u32>(0).unwrap(), 0x5678_1234);
        assert_eq!(r.read_fixed::<i32>(4).unwrap(), -1);
        assert_eq!(r.read_fixed::<u64>(1).unwrap_err().kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn cursors_are_independent() {
        let r = sample();
        let mut a = r.cursor(0);
        let mut b = r.cursor(32);
        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 1]);
        b.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [32, 33]);
        a.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert_eq!(a.position(), 4);
    }

    #[test]
    fn file_source_and_probe() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello pff").unwrap();
        let r = PffReader::from_path(tmp.path()).unwrap();
        let probe = r.probe();
        assert_eq!(r.size(), 9);
        assert_eq!(r.read_at(6, 3).unwrap(), b"pff");
        assert!(!probe.is_released());
        drop(r);
        assert!(probe.is_released());
    }

    #[test]
    fn slice_helpers_reject_short_input() {
        let buf = [1u8, 0, 0];
        assert_eq!(le_u16(&buf, 0), Some(1));
        assert_eq!(le_u32(&buf, 0), None);
        assert_eq!(le_u64(&buf, usize::MAX), None);
    }
}
