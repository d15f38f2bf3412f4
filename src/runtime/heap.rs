//! Emulated native heap
//!
//! Every block native code sees (object headers, capsules, type objects,
//! method tables built by tests) lives here. Blocks come from the process
//! allocator via `calloc`, so they are zero-initialized and keep the alignment
//! native code expects from `malloc`.
//!
//! The bridge talks to the heap through the [`Allocator`] trait so tests can
//! observe allocation and free order.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Address of a block in the emulated heap.
///
/// This is the native handle type: native code receives and returns these
/// as plain pointers. The null value means "no object".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HeapPtr {
    ptr: *mut u8,
}

impl HeapPtr {
    /// Create a HeapPtr from a raw pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *mut T) -> Self {
        Self { ptr: ptr.cast() }
    }

    /// Create a HeapPtr from an address.
    #[inline]
    pub fn from_usize(addr: usize) -> Self {
        Self {
            ptr: addr as *mut u8,
        }
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.ptr as usize
    }

    #[inline]
    pub const fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.ptr.is_null()
    }

    /// Pointer `offset` bytes into the block.
    #[inline]
    pub fn offset(self, offset: usize) -> *mut u8 {
        self.ptr.wrapping_add(offset)
    }
}

impl std::fmt::Debug for HeapPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapPtr({:p})", self.ptr)
    }
}

impl std::fmt::Pointer for HeapPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Pointer::fmt(&self.ptr, f)
    }
}

impl Default for HeapPtr {
    fn default() -> Self {
        Self::null()
    }
}

/// Fill `size` bytes at `ptr` with zero.
///
/// # Safety
/// `ptr` must be valid for writes of `size` bytes.
pub unsafe fn zero(ptr: HeapPtr, size: usize) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) }
}

/// Source of emulated memory blocks.
///
/// `alloc` must return a zeroed block or fail; it never hands out null as a
/// valid block.
pub trait Allocator {
    fn alloc(&self, size: usize) -> BridgeResult<HeapPtr>;
    fn free(&self, ptr: HeapPtr) -> BridgeResult<()>;
    fn stats(&self) -> HeapStats;
}

/// Usage counters reported by an [`Allocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub bytes_in_use: usize,
    pub live_blocks: usize,
    pub total_allocated: usize,
}

/// Configuration for the native heap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Upper bound on live bytes; `None` means only the process allocator limits us.
    pub limit: Option<usize>,
}

/// The default allocator: `calloc`/`free` with bookkeeping.
///
/// Live blocks are tracked so frees of foreign or already-freed pointers are
/// caught instead of corrupting the process heap, and so everything still
/// live is released when the heap is dropped.
pub struct NativeHeap {
    live: RefCell<HashMap<HeapPtr, usize>>,
    in_use: Cell<usize>,
    total_allocated: Cell<usize>,
    config: HeapConfig,
}

impl Default for NativeHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeHeap {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            live: RefCell::new(HashMap::new()),
            in_use: Cell::new(0),
            total_allocated: Cell::new(0),
            config,
        }
    }

    /// Bytes currently allocated and not yet freed.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Bytes ever allocated (for stats).
    pub fn total_allocated(&self) -> usize {
        self.total_allocated.get()
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn owns(&self, ptr: HeapPtr) -> bool {
        self.live.borrow().contains_key(&ptr)
    }
}

impl Allocator for NativeHeap {
    fn alloc(&self, size: usize) -> BridgeResult<HeapPtr> {
        if let Some(limit) = self.config.limit {
            if self.in_use.get().saturating_add(size) > limit {
                return Err(BridgeError::AllocationFailure { size });
            }
        }

        // calloc(0) may legitimately return null; native blocks are never empty
        let raw = unsafe { libc::calloc(1, size.max(1)) };
        if raw.is_null() {
            return Err(BridgeError::AllocationFailure { size });
        }

        let ptr = HeapPtr::from_ptr(raw);
        self.live.borrow_mut().insert(ptr, size);
        self.in_use.set(self.in_use.get() + size);
        self.total_allocated.set(self.total_allocated.get() + size);
        Ok(ptr)
    }

    fn free(&self, ptr: HeapPtr) -> BridgeResult<()> {
        let size = self
            .live
            .borrow_mut()
            .remove(&ptr)
            .ok_or(BridgeError::UnknownHandle(ptr))?;
        self.in_use.set(self.in_use.get() - size);
        unsafe { libc::free(ptr.as_ptr().cast()) };
        Ok(())
    }

    fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_in_use: self.bytes_in_use(),
            live_blocks: self.live_blocks(),
            total_allocated: self.total_allocated(),
        }
    }
}

impl Drop for NativeHeap {
    fn drop(&mut self) {
        for (ptr, _) in self.live.get_mut().drain() {
            unsafe { libc::free(ptr.as_ptr().cast()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let heap = NativeHeap::new();
        let ptr = heap.alloc(64).expect("allocation failed");
        assert!(!ptr.is_null());

        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0));
        heap.free(ptr).unwrap();
    }

    #[test]
    fn test_zero_overwrites() {
        let heap = NativeHeap::new();
        let ptr = heap.alloc(16).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 16);
            zero(ptr, 16);
            assert_eq!(std::slice::from_raw_parts(ptr.as_ptr(), 16), &[0u8; 16]);
        }
    }

    #[test]
    fn test_free_tracks_usage() {
        let heap = NativeHeap::new();
        let a = heap.alloc(24).unwrap();
        let b = heap.alloc(40).unwrap();
        assert_eq!(heap.bytes_in_use(), 64);
        assert_eq!(heap.live_blocks(), 2);

        heap.free(a).unwrap();
        assert_eq!(heap.bytes_in_use(), 40);
        assert!(!heap.owns(a));
        assert!(heap.owns(b));
        assert_eq!(heap.total_allocated(), 64);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let heap = NativeHeap::new();
        let ptr = heap.alloc(8).unwrap();
        heap.free(ptr).unwrap();
        assert!(matches!(heap.free(ptr), Err(BridgeError::UnknownHandle(p)) if p == ptr));
    }

    #[test]
    fn test_limit_reports_failure() {
        let heap = NativeHeap::with_config(HeapConfig { limit: Some(100) });
        let _a = heap.alloc(60).unwrap();
        assert!(matches!(
            heap.alloc(60),
            Err(BridgeError::AllocationFailure { size: 60 })
        ));
        assert_eq!(heap.bytes_in_use(), 60);
    }

    #[test]
    fn test_heap_ptr_roundtrip() {
        let addr: usize = 0x1234_5678_9ABC;
        let ptr = HeapPtr::from_usize(addr);
        assert_eq!(ptr.as_usize(), addr);
        assert!(HeapPtr::null().is_null());
        assert_eq!(HeapPtr::default(), HeapPtr::null());
    }
}
