//! Byte buffers over memory-mapped file windows or heap regions.
//!
//! A [`Buffer`] is a bounded cursor over a slice of a shared region, in the
//! style of a `ByteBuffer`: big-endian primitive access, an explicit
//! position, and cheap duplication. Segment writers append through one
//! mutable buffer while readers walk independent duplicates of the same
//! bytes; the codec layer keeps those roles disjoint (see the safety notes
//! on [`RawRegion`]).

use crate::error::{EmberError, Result};
use memmap2::MmapRaw;
use std::sync::Arc;

/// Backing storage for a region
enum RegionOwner {
    /// A window of a memory-mapped data file
    Mapped(Arc<MmapRaw>),
    /// An anonymous heap region (compaction scratch, tests)
    Heap(#[allow(dead_code)] Box<[u8]>),
}

/// A shared byte region with interior mutability through raw pointers.
///
/// # Safety
///
/// Regions are aliased by design: one tail segment writer and any number of
/// readers may hold buffers over the same region concurrently. Soundness
/// rests on the write protocol, not the type system:
///
/// - exactly one writer appends to a given segment slice, always at or past
///   its current position;
/// - readers only read `[0, count)` where `count` is the segment's published
///   record count, loaded volatile at reader-open time;
/// - the count word is stored after the records it covers, so every byte a
///   reader may touch was fully written before it became reachable.
pub struct RawRegion {
    ptr: *mut u8,
    len: usize,
    _owner: RegionOwner,
}

// The raw pointer targets either an mmap or a leaked-in-place Box; both are
// valid for the owner's lifetime and accessed per the protocol above.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// Region over a whole memory-mapped file window
    pub fn mapped(map: Arc<MmapRaw>) -> Arc<Self> {
        Arc::new(Self {
            ptr: map.as_mut_ptr(),
            len: map.len(),
            _owner: RegionOwner::Mapped(map),
        })
    }

    /// Zero-filled heap region
    pub fn heap(len: usize) -> Arc<Self> {
        let mut boxed = vec![0u8; len].into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        Arc::new(Self {
            ptr,
            len,
            _owner: RegionOwner::Heap(boxed),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Flush a mapped region to its backing file; no-op for heap regions
    pub fn flush(&self) -> std::io::Result<()> {
        match &self._owner {
            RegionOwner::Mapped(map) => map.flush(),
            RegionOwner::Heap(_) => Ok(()),
        }
    }
}

/// Bounded big-endian cursor over a shared region.
#[derive(Clone)]
pub struct Buffer {
    region: Arc<RawRegion>,
    /// Absolute region offset of this buffer's byte 0
    start: usize,
    /// Capacity in bytes
    limit: usize,
    /// Next read/write offset, relative to `start`
    pos: usize,
    read_only: bool,
}

impl Buffer {
    /// Buffer over `[offset, offset + len)` of a region
    pub fn new(region: Arc<RawRegion>, offset: usize, len: usize) -> Result<Self> {
        if offset.checked_add(len).map_or(true, |end| end > region.len()) {
            return Err(EmberError::Corruption(format!(
                "buffer slice {}+{} exceeds region of {} bytes",
                offset,
                len,
                region.len()
            )));
        }
        Ok(Self {
            region,
            start: offset,
            limit: len,
            pos: 0,
            read_only: false,
        })
    }

    /// Heap-backed buffer (compaction scratch, tests)
    pub fn heap(len: usize) -> Self {
        Self {
            region: RawRegion::heap(len),
            start: 0,
            limit: len,
            pos: 0,
            read_only: false,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.limit {
            return Err(EmberError::Corruption(format!(
                "position {} past limit {}",
                pos, self.limit
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    /// Independent cursor over the same bytes, positioned at 0
    pub fn duplicate(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
            start: self.start,
            limit: self.limit,
            pos: 0,
            read_only: self.read_only,
        }
    }

    #[inline]
    fn addr(&self, offset: usize) -> *mut u8 {
        // offset is bounds-checked by every caller against self.limit
        unsafe { self.region.ptr.add(self.start + offset) }
    }

    fn check_write(&self, len: usize) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if self.remaining() < len {
            return Err(EmberError::SegmentFull);
        }
        Ok(())
    }

    fn check_read(&self, len: usize) -> Result<()> {
        if self.remaining() < len {
            return Err(EmberError::Corruption(format!(
                "read of {} bytes past limit {} at {}",
                len, self.limit, self.pos
            )));
        }
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.check_write(1)?;
        unsafe { self.addr(self.pos).write(v) };
        self.pos += 1;
        Ok(())
    }

    pub fn put_i8(&mut self, v: i8) -> Result<()> {
        self.put_u8(v as u8)
    }

    pub fn put_i16(&mut self, v: i16) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> Result<()> {
        self.put_bytes(&v.to_be_bytes())
    }

    pub fn put_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.check_write(src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.addr(self.pos), src.len());
        }
        self.pos += src.len();
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.check_read(1)?;
        let v = unsafe { self.addr(self.pos).read() };
        self.pos += 1;
        Ok(v)
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.get_bytes(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.get_bytes(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.get_bytes(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_read(dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr(self.pos), dst.as_mut_ptr(), dst.len());
        }
        self.pos += dst.len();
        Ok(())
    }

    /// Byte at an absolute offset, cursor untouched
    pub fn get_u8_at(&self, offset: usize) -> Result<u8> {
        if offset >= self.limit {
            return Err(EmberError::Corruption(format!(
                "offset {} past limit {}",
                offset, self.limit
            )));
        }
        Ok(unsafe { self.addr(offset).read() })
    }

    /// Overwrite the byte at an absolute offset, cursor untouched.
    /// Not permitted on read-only buffers; this is a writer-side hook.
    pub fn put_u8_at(&mut self, offset: usize, v: u8) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if offset >= self.limit {
            return Err(EmberError::Corruption(format!(
                "offset {} past limit {}",
                offset, self.limit
            )));
        }
        unsafe { self.addr(offset).write(v) };
        Ok(())
    }

    /// Volatile store of the big-endian count word at `offset`.
    ///
    /// Publishes the records written before it; must be the LAST store of an
    /// append.
    pub fn put_i32_volatile_at(&mut self, offset: usize, v: i32) -> Result<()> {
        if self.read_only {
            return Err(EmberError::SegmentReadOnly);
        }
        if offset + 4 > self.limit {
            return Err(EmberError::Corruption(format!(
                "count word {}+4 past limit {}",
                offset, self.limit
            )));
        }
        let bytes = v.to_be_bytes();
        unsafe {
            for (i, b) in bytes.iter().enumerate() {
                std::ptr::write_volatile(self.addr(offset + i), *b);
            }
        }
        Ok(())
    }

    /// Volatile load of the big-endian count word at `offset`
    pub fn get_i32_volatile_at(&self, offset: usize) -> Result<i32> {
        if offset + 4 > self.limit {
            return Err(EmberError::Corruption(format!(
                "count word {}+4 past limit {}",
                offset, self.limit
            )));
        }
        let mut bytes = [0u8; 4];
        unsafe {
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = std::ptr::read_volatile(self.addr(offset + i));
            }
        }
        Ok(i32::from_be_bytes(bytes))
    }

    /// Copy `[0, len)` of `src` into this buffer at the cursor
    pub fn put_buffer(&mut self, src: &Buffer, len: usize) -> Result<()> {
        if len > src.limit {
            return Err(EmberError::Corruption(format!(
                "copy of {} bytes from buffer of {}",
                len, src.limit
            )));
        }
        self.check_write(len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.addr(0), self.addr(self.pos), len);
        }
        self.pos += len;
        Ok(())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("limit", &self.limit)
            .field("pos", &self.pos)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let mut buf = Buffer::heap(64);
        buf.put_u8(7).unwrap();
        buf.put_i32(-42).unwrap();
        buf.put_i64(1_700_000_000_000).unwrap();

        let mut rdr = buf.duplicate();
        assert_eq!(rdr.get_u8().unwrap(), 7);
        assert_eq!(rdr.get_i32().unwrap(), -42);
        assert_eq!(rdr.get_i64().unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn test_overflow_signals_segment_full() {
        let mut buf = Buffer::heap(4);
        buf.put_i32(1).unwrap();
        assert!(buf.put_u8(0).unwrap_err().is_rollover());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut buf = Buffer::heap(8);
        buf.mark_read_only();
        assert!(matches!(
            buf.put_u8(1).unwrap_err(),
            EmberError::SegmentReadOnly
        ));
    }

    #[test]
    fn test_duplicate_shares_bytes_independent_cursor() {
        let mut buf = Buffer::heap(16);
        buf.put_i32(99).unwrap();

        let mut a = buf.duplicate();
        let mut b = buf.duplicate();
        assert_eq!(a.get_i32().unwrap(), 99);
        assert_eq!(b.get_i32().unwrap(), 99);
        assert_eq!(a.position(), 4);

        // writer appends, duplicate sees the new bytes
        buf.put_i32(100).unwrap();
        a.set_position(4).unwrap();
        assert_eq!(a.get_i32().unwrap(), 100);
    }

    #[test]
    fn test_volatile_count_word() {
        let mut buf = Buffer::heap(16);
        buf.put_i32_volatile_at(2, 1234).unwrap();
        assert_eq!(buf.get_i32_volatile_at(2).unwrap(), 1234);
    }

    #[test]
    fn test_put_buffer_copies_prefix() {
        let mut src = Buffer::heap(8);
        src.put_i64(55).unwrap();
        let mut dst = Buffer::heap(8);
        dst.put_buffer(&src, 8).unwrap();
        let mut rdr = dst.duplicate();
        assert_eq!(rdr.get_i64().unwrap(), 55);
    }
}
