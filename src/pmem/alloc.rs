//! The PM allocation capability consumed by both trees.
//!
//! Tree code never touches a concrete pool type; it talks to this trait
//! the way the rest of the crate talks to persisted data: allocations
//! come back as relative pointers, and every pointer read off PM is
//! rehydrated through [`PmAlloc::absolute`] before use.

use eyre::Result;

use crate::types::RelPtr;

/// Allocate and free PM regions and translate between the in-process
/// (absolute) and persisted (relative) pointer forms.
///
/// Implementations are not required to be thread-safe; the single
/// writer serialises allocation. Node-sized allocations must come back
/// aligned to at least a cache line (64 bytes).
pub trait PmAlloc {
    /// Allocates `size` bytes of PM, returning the region's relative
    /// pointer. Fails when the pool is exhausted.
    fn malloc(&self, size: usize) -> Result<RelPtr>;

    /// Releases a previously allocated region by its absolute pointer.
    fn free(&self, abs: *mut u8);

    /// Rehydrates a relative pointer to an absolute one.
    fn absolute(&self, rel: RelPtr) -> *mut u8;

    /// Converts an absolute pointer back to its persistable form.
    fn relative(&self, abs: *const u8) -> RelPtr;
}
