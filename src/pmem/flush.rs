//! Cache-line persistence primitives.
//!
//! PM durability is built from three operations:
//!
//! - [`flush`]: write back every cache line overlapping a byte range.
//!   A flush alone guarantees neither ordering nor completion.
//! - [`fence`]: store barrier. Once it returns, all previously issued
//!   flushes are durable.
//! - [`persist_assign`]: atomic 8-byte store + flush + fence. This is
//!   the commit primitive: any operation that changes more than 8 bytes
//!   must stage its data (flushed and fenced) *before* the single
//!   `persist_assign` that makes the staged data reachable. A crash at
//!   any point then exposes either the old word or the new one, never a
//!   torn state.
//!
//! On x86_64 these map to `clflush`/`sfence`. On other architectures
//! the flush degrades to a no-op and the fence to a `SeqCst` atomic
//! fence, which keeps the crate testable everywhere while preserving
//! the same store ordering for in-process readers.

use std::sync::atomic::{AtomicU64, Ordering};

pub const CACHE_LINE_SIZE: usize = 64;

/// Writes back every cache line overlapping `[addr, addr + len)`.
///
/// # Safety
///
/// `addr..addr + len` must lie within a single valid mapped allocation.
#[inline]
pub unsafe fn flush(addr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = (addr as usize) & !(CACHE_LINE_SIZE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            std::arch::x86_64::_mm_clflush(line as *const u8);
            line += CACHE_LINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, len);
    }
}

/// Store barrier: all prior flushes are durable once this returns.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence has no preconditions; it only orders stores.
    unsafe {
        std::arch::x86_64::_mm_sfence()
    };
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// Atomically stores an 8-byte value, flushes its cache line, and
/// fences. The single commit point of every structural mutation.
///
/// # Safety
///
/// `loc` must be valid for writes, 8-byte aligned, and within mapped
/// memory. The caller is the only writer (single-writer model); racing
/// readers observe either the old or the new value.
#[inline]
pub unsafe fn persist_assign(loc: *mut u64, value: u64) {
    // SAFETY: loc is 8-byte aligned per the caller contract, so the
    // AtomicU64 view is layout-compatible and the store is a single
    // untorn 8-byte write.
    (*(loc as *const AtomicU64)).store(value, Ordering::Release);
    flush(loc as *const u8, std::mem::size_of::<u64>());
    fence();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_assign_stores_value() {
        let mut word = 0u64;
        // SAFETY: word is a live, aligned stack variable.
        unsafe { persist_assign(&mut word, 0xdead_beef_cafe_f00d) };
        assert_eq!(word, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn flush_accepts_unaligned_ranges() {
        let buf = vec![0u8; 300];
        // SAFETY: the range lies within the live allocation.
        unsafe { flush(buf.as_ptr().wrapping_add(7), 250) };
        fence();
    }
}
