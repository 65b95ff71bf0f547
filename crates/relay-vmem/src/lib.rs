//! Virtual memory regions obtained directly from the OS page allocator.
//!
//! A [`VirtualRegion`] reserves and commits zero-initialized, readable and
//! writable address space without going through the general-purpose heap.
//! The handoff demo uses one to stand in for memory that arrives from
//! outside the allocator's world - a mapped file, a device window, a foreign
//! arena - and therefore must be treated as logically distinct from
//! heap-allocated working memory.
//!
//! On Unix targets the region is an anonymous private `mmap`; elsewhere it
//! falls back to a page-aligned zeroed allocation from the system allocator.
//! Either way the memory is released when the region drops, so a region that
//! failed to reserve never needs a cleanup call.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;
use thiserror::Error;

/// Result type for region operations.
pub type VmemResult<T> = Result<T, VmemError>;

/// Errors from the virtual memory provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmemError {
    /// The OS could not satisfy the reservation.
    #[error("virtual memory reservation of {requested} bytes failed")]
    OutOfMemory {
        /// Requested region size in bytes.
        requested: usize,
    },

    /// The requested size is out of contract.
    #[error("invalid region size: {0}")]
    InvalidSize(String),
}

/// Size of an OS page in bytes.
#[must_use]
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // Safety: sysconf has no memory-safety preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
}

/// An owned block of committed, zero-initialized address space.
///
/// # Invariants
///
/// - `ptr` is page-aligned and points to `len` readable-writable bytes
/// - the full range is committed and starts zeroed
/// - the region is unmapped exactly once, on drop
#[derive(Debug)]
pub struct VirtualRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the region exclusively owns its mapping; it carries no interior
// mutability of its own, so sending or sharing it follows the usual
// reference rules.
unsafe impl Send for VirtualRegion {}
unsafe impl Sync for VirtualRegion {}

impl VirtualRegion {
    /// Reserve and commit `len` bytes of zeroed address space.
    pub fn reserve(len: usize) -> VmemResult<Self> {
        if len == 0 {
            return Err(VmemError::InvalidSize(
                "region size must be nonzero".to_owned(),
            ));
        }

        let ptr = Self::map(len)?;
        Ok(Self { ptr, len })
    }

    #[cfg(unix)]
    fn map(len: usize) -> VmemResult<NonNull<u8>> {
        // Safety: anonymous private mapping, no address hint, no fd.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(VmemError::OutOfMemory { requested: len });
        }
        NonNull::new(raw.cast()).ok_or(VmemError::OutOfMemory { requested: len })
    }

    #[cfg(not(unix))]
    fn map(len: usize) -> VmemResult<NonNull<u8>> {
        use std::alloc::Layout;

        let layout = Layout::from_size_align(len, page_size())
            .map_err(|e| VmemError::InvalidSize(e.to_string()))?;
        // Safety: layout is nonzero sized.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(raw).ok_or(VmemError::OutOfMemory { requested: len })
    }

    /// Length of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty. Always false for a live region.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the start of the region.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Immutable byte view of the whole region.
    ///
    /// Safe because the mapping is committed and zero-initialized from the
    /// moment it exists.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr/len describe one live, initialized mapping we own.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable byte view of the whole region.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, plus &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        // Safety: ptr/len are the exact mapping returned by mmap.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }

        #[cfg(not(unix))]
        // Safety: same layout the region was allocated with.
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.len, page_size());
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_rejected() {
        let err = VirtualRegion::reserve(0).unwrap_err();
        assert!(matches!(err, VmemError::InvalidSize(_)));
    }

    #[test]
    fn fresh_region_is_zeroed() {
        let region = VirtualRegion::reserve(2 * page_size()).unwrap();
        assert!(region.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn region_is_page_aligned() {
        let region = VirtualRegion::reserve(page_size()).unwrap();
        assert_eq!(region.as_ptr() as usize % page_size(), 0);
    }

    #[test]
    fn writes_read_back() {
        let mut region = VirtualRegion::reserve(4096).unwrap();
        for (i, byte) in region.as_mut_slice().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        for (i, byte) in region.as_slice().iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }
    }

    #[test]
    fn large_region_reserves_and_drops() {
        let region = VirtualRegion::reserve(8 * 1024 * 1024).unwrap();
        assert_eq!(region.len(), 8 * 1024 * 1024);
        drop(region);
    }

    #[test]
    fn region_crosses_threads() {
        let mut region = VirtualRegion::reserve(4096).unwrap();
        region.as_mut_slice()[0] = 0xA5;
        let handle = std::thread::spawn(move || region.as_slice()[0]);
        assert_eq!(handle.join().unwrap(), 0xA5);
    }
}
