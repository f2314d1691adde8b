//! Shared memory ring buffer
//!
//! A single-producer single-consumer byte ring laid out in a shared region:
//!
//! ```text
//! +------------+------------+---------------------------------+
//! | start word | end word   | payload (size - 2 words)         |
//! +------------+------------+---------------------------------+
//! ```
//!
//! The reader owns `start` and the writer owns `end`. Each side keeps its own
//! cursor locally and publishes it into the metadata word after copying
//! payload bytes, so the peer never observes a cursor ahead of the data.
//! The ring holds at most `capacity - 1` bytes; `start == end` means empty.

pub mod notify;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{SrvError, SrvResult};

/// Bytes of cursor metadata at the front of every ring region
pub const SHARE_METADATA_SIZE: usize = 2 * size_of::<usize>();

// ============================================================================
// Shared region
// ============================================================================

/// Backing memory of a region
struct Mapping {
    base: NonNull<u8>,
    size: usize,
    /// Word count of a heap-backed region; `None` for foreign mappings
    heap_words: Option<usize>,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Some(words) = self.heap_words {
            let raw = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr().cast::<AtomicUsize>(), words);
            // SAFETY: produced by `Box::into_raw` in `SharedRegion::anon`
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

// The mapping is only touched through atomics (metadata) or under the
// single-producer single-consumer discipline (payload).
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Handle on a mapped shared memory region.
///
/// Cloning yields another handle on the same memory, the way two processes
/// mapping the same dataspace see the same bytes.
#[derive(Clone)]
pub struct SharedRegion {
    map: Arc<Mapping>,
}

impl SharedRegion {
    /// Allocate a zeroed, word-aligned region of `size` bytes on the heap
    pub fn anon(size: usize) -> Self {
        let words = size.div_ceil(size_of::<usize>()).max(2);
        let heap: Box<[AtomicUsize]> = (0..words).map(|_| AtomicUsize::new(0)).collect();
        // SAFETY: `Box::into_raw` never returns null
        let base = unsafe { NonNull::new_unchecked(Box::into_raw(heap).cast::<u8>()) };
        Self {
            map: Arc::new(Mapping {
                base,
                size,
                heap_words: Some(words),
            }),
        }
    }

    /// Wrap memory mapped by a collaborator.
    ///
    /// # Safety
    ///
    /// `base` must be word aligned, valid for reads and writes of
    /// `max(size, SHARE_METADATA_SIZE)` bytes, and stay mapped for as long
    /// as any clone of the handle exists.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        Self {
            map: Arc::new(Mapping {
                base,
                size,
                heap_words: None,
            }),
        }
    }

    /// Region size in bytes, including metadata
    pub fn size(&self) -> usize {
        self.map.size
    }

    /// Whether two handles refer to the same memory
    pub fn same_region(&self, other: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }

    /// Payload capacity of the ring in this region
    pub fn capacity(&self) -> SrvResult<usize> {
        if self.map.size < SHARE_METADATA_SIZE + 1 {
            return Err(SrvError::Malformed);
        }
        Ok(self.map.size - SHARE_METADATA_SIZE)
    }

    /// Published reader cursor
    pub fn start(&self) -> usize {
        self.meta(0).load(Ordering::Acquire)
    }

    /// Published writer cursor
    pub fn end(&self) -> usize {
        self.meta(1).load(Ordering::Acquire)
    }

    /// Zero both cursors. Only valid while neither side is active.
    pub fn reset(&self) {
        self.meta(0).store(0, Ordering::Release);
        self.meta(1).store(0, Ordering::Release);
    }

    /// Bytes currently readable
    pub fn readable(&self) -> SrvResult<usize> {
        let cap = self.capacity()?;
        let (start, end) = (self.start(), self.end());
        validate(cap, start, end)?;
        Ok(if start <= end { end - start } else { cap - start + end })
    }

    /// Append `src` to the ring.
    ///
    /// `end` is the writer's local cursor; it is advanced and published on
    /// success. Fails with `ResourceExhausted` if `src` does not fit.
    pub fn write(&self, src: &[u8], end: &mut usize) -> SrvResult<()> {
        let cap = self.capacity()?;
        let start = self.start();
        validate(cap, start, *end)?;

        let len = src.len();
        if len > remaining(start, *end, cap) {
            return Err(SrvError::ResourceExhausted);
        }

        let first = len.min(cap - *end);
        // SAFETY: `*end + first <= cap` and `len - first <= start`, both
        // inside the payload area; the reader does not touch free space.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.payload().add(*end), first);
            if first < len {
                core::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.payload(), len - first);
            }
        }

        *end = (*end + len) % cap;
        self.meta(1).store(*end, Ordering::Release);
        log::trace!("share: wrote {} bytes, end={}", len, *end);
        Ok(())
    }

    /// Copy up to `dest.len()` bytes out of the ring.
    ///
    /// `start` is the reader's local cursor; it is advanced and published.
    /// Returns the number of bytes read, zero when the ring is empty.
    pub fn read(&self, dest: &mut [u8], start: &mut usize) -> SrvResult<usize> {
        let cap = self.capacity()?;
        let end = self.end();
        validate(cap, *start, end)?;

        let len = dest.len();
        let (first, second) = if *start <= end {
            ((end - *start).min(len), 0)
        } else {
            let first = (cap - *start).min(len);
            (first, (len - first).min(end))
        };

        // SAFETY: the ranges lie within published, unread payload bytes
        unsafe {
            core::ptr::copy_nonoverlapping(self.payload().add(*start), dest.as_mut_ptr(), first);
            if second > 0 {
                core::ptr::copy_nonoverlapping(self.payload(), dest.as_mut_ptr().add(first), second);
            }
        }

        let read = first + second;
        *start = (*start + read) % cap;
        self.meta(0).store(*start, Ordering::Release);
        if read > 0 {
            log::trace!("share: read {} bytes, start={}", read, *start);
        }
        Ok(read)
    }

    /// Read exactly `dest.len()` bytes or nothing.
    ///
    /// Returns `Ok(false)` if the ring is empty. A partial record is
    /// reported as `Malformed` after consuming it.
    pub fn read_exact(&self, dest: &mut [u8], start: &mut usize) -> SrvResult<bool> {
        match self.read(dest, start)? {
            0 => Ok(false),
            n if n == dest.len() => Ok(true),
            _ => Err(SrvError::Malformed),
        }
    }

    fn meta(&self, index: usize) -> &AtomicUsize {
        // SAFETY: every region is word aligned and covers both metadata words
        unsafe { &*self.map.base.as_ptr().cast::<AtomicUsize>().add(index) }
    }

    fn payload(&self) -> *mut u8 {
        // SAFETY: callers only use this after `capacity()` succeeded
        unsafe { self.map.base.as_ptr().add(SHARE_METADATA_SIZE) }
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("size", &self.map.size)
            .field("start", &self.start())
            .field("end", &self.end())
            .finish()
    }
}

fn remaining(start: usize, end: usize, cap: usize) -> usize {
    if start > end {
        start - end - 1
    } else {
        (cap - 1) - (end - start)
    }
}

fn validate(cap: usize, start: usize, end: usize) -> SrvResult<()> {
    if start >= cap || end >= cap {
        return Err(SrvError::Malformed);
    }
    Ok(())
}

// ============================================================================
// Endpoints
// ============================================================================

/// Producer side of a ring
#[derive(Debug, Clone)]
pub struct ShareWriter {
    region: SharedRegion,
    end: usize,
}

impl ShareWriter {
    /// Attach to `region`, resuming from its published end cursor
    pub fn new(region: SharedRegion) -> Self {
        let end = region.end();
        Self { region, end }
    }

    /// Append bytes
    pub fn write(&mut self, src: &[u8]) -> SrvResult<()> {
        self.region.write(src, &mut self.end)
    }

    /// Free space left
    pub fn remaining(&self) -> SrvResult<usize> {
        let cap = self.region.capacity()?;
        Ok(remaining(self.region.start(), self.end, cap))
    }

    /// The underlying region
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

/// Consumer side of a ring
#[derive(Debug, Clone)]
pub struct ShareReader {
    region: SharedRegion,
    start: usize,
}

impl ShareReader {
    /// Attach to `region`, resuming from its published start cursor
    pub fn new(region: SharedRegion) -> Self {
        let start = region.start();
        Self { region, start }
    }

    /// Read available bytes into `dest`
    pub fn read(&mut self, dest: &mut [u8]) -> SrvResult<usize> {
        self.region.read(dest, &mut self.start)
    }

    /// Read one fixed-size record; see [`SharedRegion::read_exact`]
    pub fn read_exact(&mut self, dest: &mut [u8]) -> SrvResult<bool> {
        self.region.read_exact(dest, &mut self.start)
    }

    /// Drain everything currently readable
    pub fn read_to_vec(&mut self) -> SrvResult<Vec<u8>> {
        let mut out = alloc::vec![0u8; self.region.readable()?];
        let n = self.read(&mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// The underlying region
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(cap: usize) -> SharedRegion {
        SharedRegion::anon(SHARE_METADATA_SIZE + cap)
    }

    #[test]
    fn test_fresh_region_empty() {
        let r = region(16);
        assert_eq!(r.capacity(), Ok(16));
        assert_eq!(r.readable(), Ok(0));
        let mut buf = [0u8; 8];
        let mut start = 0;
        assert_eq!(r.read(&mut buf, &mut start), Ok(0));
    }

    #[test]
    fn test_too_small_region() {
        let r = SharedRegion::anon(SHARE_METADATA_SIZE);
        let mut end = 0;
        assert_eq!(r.write(b"x", &mut end), Err(SrvError::Malformed));
    }

    #[test]
    fn test_round_trip() {
        let r = region(16);
        let mut w = ShareWriter::new(r.clone());
        let mut rd = ShareReader::new(r);
        w.write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(rd.read(&mut buf), Ok(5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_capacity_boundary() {
        let r = region(8);
        let mut end = 0;
        assert_eq!(r.write(&[1; 8], &mut end), Err(SrvError::ResourceExhausted));
        assert_eq!(r.write(&[1; 7], &mut end), Ok(()));
        assert_eq!(r.write(&[1; 1], &mut end), Err(SrvError::ResourceExhausted));
        assert_eq!(r.readable(), Ok(7));
    }

    #[test]
    fn test_wraparound() {
        let r = region(8);
        let mut w = ShareWriter::new(r.clone());
        let mut rd = ShareReader::new(r.clone());
        let mut buf = [0u8; 8];

        w.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(rd.read(&mut buf[..6]), Ok(6));

        // Wraps: 2 bytes at the tail, 3 at the head
        w.write(&[7, 8, 9, 10, 11]).unwrap();
        assert!(r.end() < r.start());
        assert_eq!(rd.read(&mut buf), Ok(5));
        assert_eq!(&buf[..5], &[7, 8, 9, 10, 11]);
        assert_eq!(r.readable(), Ok(0));
    }

    #[test]
    fn test_partial_read() {
        let r = region(16);
        let mut w = ShareWriter::new(r.clone());
        let mut rd = ShareReader::new(r);
        w.write(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(rd.read(&mut buf), Ok(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(rd.read_to_vec().unwrap(), b"ef".to_vec());
    }

    #[test]
    fn test_corrupt_cursor_rejected() {
        let r = region(8);
        let mut start = 99;
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf, &mut start), Err(SrvError::Malformed));
    }

    #[test]
    fn test_read_exact_short() {
        let r = region(16);
        let mut w = ShareWriter::new(r.clone());
        let mut rd = ShareReader::new(r);
        let mut rec = [0u8; 4];
        assert_eq!(rd.read_exact(&mut rec), Ok(false));
        w.write(&[1, 2]).unwrap();
        assert_eq!(rd.read_exact(&mut rec), Err(SrvError::Malformed));
    }
}
