//! Page-aligned I/O buffers
//!
//! With O_DIRECT on Linux, both the buffer address and the transfer length
//! must be aligned to the device's logical block size. Cache blocks are
//! allocated once at page alignment so every whole-block transfer can go
//! through the native async path.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ops::{Deref, DerefMut, Range};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Fallback when the page size cannot be queried
const DEFAULT_PAGE_SIZE: usize = 4096;

/// System page size, queried once
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size)
            .ok()
            .filter(|s| s.is_power_of_two())
            .unwrap_or(DEFAULT_PAGE_SIZE)
    })
}

/// Heap buffer whose start address is aligned for direct I/O.
///
/// The allocation never moves, so a buffer handed to the kernel stays valid
/// for as long as the owning value is alive, wherever that value is moved.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer uniquely owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a zeroed buffer aligned to the page size
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, page_size())
    }

    /// Create a zeroed buffer with custom alignment
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        // Round the allocation up so whole-page transfers never run off the end
        let alloc_size = size.max(1).div_ceil(alignment) * alignment;
        let layout = Layout::from_size_align(alloc_size, alignment)
            .expect("alignment must be a power of two");

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        Self {
            ptr,
            len: size,
            layout,
        }
    }

    /// Get the buffer as a slice
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes and uniquely owned.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer size
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Alignment of the allocation
    pub const fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// True if the byte range starting at `range.start` sits on an `align` boundary
    /// in memory and both ends are multiples of `align`
    pub fn is_range_aligned(&self, range: &Range<usize>, align: usize) -> bool {
        let addr = self.ptr.as_ptr() as usize + range.start;
        addr % align == 0 && range.len() % align == 0
    }

    /// Zero a byte range
    pub fn zero(&mut self, range: Range<usize>) {
        self.as_mut_slice()[range].fill(0);
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish_non_exhaustive()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
        assert!(buf.iter().all(|b| *b == 0));

        buf[..5].copy_from_slice(b"hello");
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_odd_size_keeps_requested_len() {
        let buf = AlignedBuffer::with_alignment(512, 4096);
        assert_eq!(buf.len(), 512);
        assert_eq!(buf.alignment(), 4096);
        assert!(buf.is_range_aligned(&(0..512), 512));
    }

    #[test]
    fn test_range_alignment() {
        let buf = AlignedBuffer::with_alignment(8192, 4096);
        assert!(buf.is_range_aligned(&(0..4096), 4096));
        assert!(buf.is_range_aligned(&(4096..8192), 4096));
        assert!(!buf.is_range_aligned(&(512..4096), 4096));
        assert!(!buf.is_range_aligned(&(0..512), 4096));
    }

    #[test]
    fn test_zero_range() {
        let mut buf = AlignedBuffer::new(1024);
        buf.fill(0xAB);
        buf.zero(100..200);
        assert!(buf[..100].iter().all(|b| *b == 0xAB));
        assert!(buf[100..200].iter().all(|b| *b == 0));
        assert!(buf[200..].iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_buffer_moves_without_relocating() {
        let buf = AlignedBuffer::new(4096);
        let addr = buf.as_ptr() as usize;
        let moved = vec![buf];
        assert_eq!(moved[0].as_ptr() as usize, addr);
    }
}
