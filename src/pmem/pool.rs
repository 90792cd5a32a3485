//! # Memory-Mapped PM Pool
//!
//! `PmPool` is the concrete [`PmAlloc`] implementation: a fixed-size
//! file mapped into the process address space, standing in for a real
//! persistent-memory region.
//!
//! ## Layout
//!
//! ```text
//! Offset 0       PoolHeader (128 bytes)
//!                  magic, version, capacity, bump head, root slots
//! Offset 128     reserved up to the first data offset
//! Offset 4096    allocation area (bump-allocated, 64-byte aligned)
//! ```
//!
//! ## Allocation model
//!
//! Allocation is a persistent bump cursor: `malloc` rounds the request
//! up to a cache line, advances the cursor, and commits the new cursor
//! into the header with `persist_assign` before returning. A reopened
//! pool therefore never re-hands space that an earlier run allocated.
//! `free` does not recycle; it only counts released regions. This makes
//! the crash-window leak the trees accept an explicit property of the
//! pool rather than a surprise.
//!
//! ## Root slots
//!
//! The header carries four 8-byte root slots. They are the durable
//! anchors from which the trees are found again after reopen: the
//! fixed tree stashes its entrance pointer in one, the write-optimized
//! tree commits its root pointer directly into another via
//! [`PmPool::root_cell`].
//!
//! ## Pointer stability
//!
//! The pool never grows or remaps, so absolute pointers produced by
//! `absolute()` stay valid for the pool's lifetime. This is what allows
//! the trees to hold rehydrated pointers across operations.

use std::fs::{File, OpenOptions};
use std::mem::offset_of;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::alloc::PmAlloc;
use super::flush::{fence, flush, persist_assign, CACHE_LINE_SIZE};
use crate::types::RelPtr;

pub const POOL_MAGIC: &[u8; 16] = b"duotree pool\x00\x00\x00\x00";
pub const POOL_VERSION: u32 = 1;
pub const POOL_HEADER_SIZE: usize = 128;
pub const POOL_DATA_START: usize = 4096;
pub const ROOT_SLOTS: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PoolHeader {
    magic: [u8; 16],
    version: U32,
    _pad: U32,
    capacity: U64,
    head: U64,
    roots: [U64; ROOT_SLOTS],
    reserved: [u8; 56],
}

const _: () = assert!(std::mem::size_of::<PoolHeader>() == POOL_HEADER_SIZE);

#[derive(Debug)]
pub struct PmPool {
    _file: File,
    mmap: MmapMut,
    base: *mut u8,
    capacity: usize,
    head: Mutex<u64>,
    freed_regions: AtomicU64,
}

impl PmPool {
    /// Creates a pool file of exactly `capacity` bytes and maps it.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            capacity >= 2 * POOL_DATA_START,
            "pool capacity {} too small (minimum {})",
            capacity,
            2 * POOL_DATA_START
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create pool file '{}'", path.display()))?;

        file.set_len(capacity as u64)
            .wrap_err_with(|| format!("failed to size pool file to {} bytes", capacity))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files
        // can be modified externally. This is safe because:
        // 1. The file was just created with truncate=true and exclusive use
        // 2. The mapping's lifetime is tied to PmPool, which never remaps
        // 3. All access goes through the bounds-checked allocator methods
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = PoolHeader {
            magic: *POOL_MAGIC,
            version: U32::new(POOL_VERSION),
            _pad: U32::new(0),
            capacity: U64::new(capacity as u64),
            head: U64::new(POOL_DATA_START as u64),
            roots: [U64::new(0); ROOT_SLOTS],
            reserved: [0u8; 56],
        };
        mmap[..POOL_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let base = mmap.as_mut_ptr();
        // SAFETY: the header range lies within the freshly created mapping.
        unsafe { flush(base, POOL_HEADER_SIZE) };
        fence();

        Ok(Self {
            _file: file,
            mmap,
            base,
            capacity,
            head: Mutex::new(POOL_DATA_START as u64),
            freed_regions: AtomicU64::new(0),
        })
    }

    /// Reopens an existing pool file, validating its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open pool file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as usize;

        ensure!(
            file_size >= 2 * POOL_DATA_START,
            "pool file '{}' is truncated ({} bytes)",
            path.display(),
            file_size
        );

        // SAFETY: see `create`; the file is opened read+write and the
        // mapping never outlives the pool or gets remapped.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let header = PoolHeader::ref_from_bytes(&mmap[..POOL_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse pool header: {:?}", e))?;

        ensure!(&header.magic == POOL_MAGIC, "invalid pool magic bytes");
        ensure!(
            header.version.get() == POOL_VERSION,
            "unsupported pool version: {} (expected {})",
            header.version.get(),
            POOL_VERSION
        );
        ensure!(
            header.capacity.get() as usize == file_size,
            "pool header capacity {} does not match file size {}",
            header.capacity.get(),
            file_size
        );

        let head = header.head.get();
        ensure!(
            head >= POOL_DATA_START as u64 && head <= file_size as u64,
            "pool allocation cursor {} out of range",
            head
        );

        let base = mmap.as_mut_ptr();

        Ok(Self {
            _file: file,
            mmap,
            base,
            capacity: file_size,
            head: Mutex::new(head),
            freed_regions: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available for allocation.
    pub fn available(&self) -> usize {
        self.capacity - *self.head.lock() as usize
    }

    /// Number of regions released through `free` since this pool was
    /// opened. Bump allocation does not recycle them.
    pub fn freed_regions(&self) -> u64 {
        self.freed_regions.load(Ordering::Relaxed)
    }

    /// Reads a durable root slot.
    pub fn root(&self, slot: usize) -> RelPtr {
        assert!(slot < ROOT_SLOTS, "root slot {} out of range", slot);
        // SAFETY: the cell lies inside the header, which is always mapped;
        // the read is a plain aligned u64 load.
        unsafe { RelPtr::from_offset(*self.root_cell(slot)) }
    }

    /// Commits a durable root slot with `persist_assign`.
    pub fn set_root(&self, slot: usize, rel: RelPtr) {
        assert!(slot < ROOT_SLOTS, "root slot {} out of range", slot);
        // SAFETY: the cell is an aligned u64 inside the mapped header and
        // this pool is single-writer.
        unsafe { persist_assign(self.root_cell(slot), rel.offset()) };
    }

    /// Raw pointer to a root slot, for callers that commit into the cell
    /// themselves (the write-optimized tree's root pointer lives here).
    pub fn root_cell(&self, slot: usize) -> *mut u64 {
        assert!(slot < ROOT_SLOTS, "root slot {} out of range", slot);
        let offset = offset_of!(PoolHeader, roots) + slot * 8;
        // SAFETY: offset is within the mapped header; alignment is 8.
        unsafe { self.base.add(offset) as *mut u64 }
    }

    /// Flushes the whole mapping to the backing file.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync pool to disk")
    }

    fn head_cell(&self) -> *mut u64 {
        // SAFETY: the head field is an aligned u64 inside the mapped header.
        unsafe { self.base.add(offset_of!(PoolHeader, head)) as *mut u64 }
    }
}

impl PmAlloc for PmPool {
    fn malloc(&self, size: usize) -> Result<RelPtr> {
        ensure!(size > 0, "zero-sized PM allocation");

        let rounded = size.div_ceil(CACHE_LINE_SIZE) * CACHE_LINE_SIZE;
        let mut head = self.head.lock();

        ensure!(
            *head as usize + rounded <= self.capacity,
            "pool exhausted: need {} bytes, {} available",
            rounded,
            self.capacity - *head as usize
        );

        let rel = RelPtr::from_offset(*head);
        *head += rounded as u64;

        // Commit the cursor before handing the region out, so a reopened
        // pool cannot re-allocate it.
        // SAFETY: head_cell is an aligned u64 in the mapped header.
        unsafe { persist_assign(self.head_cell(), *head) };

        Ok(rel)
    }

    fn free(&self, _abs: *mut u8) {
        self.freed_regions.fetch_add(1, Ordering::Relaxed);
    }

    fn absolute(&self, rel: RelPtr) -> *mut u8 {
        debug_assert!(!rel.is_null(), "rehydrating a null relative pointer");
        debug_assert!(
            (rel.offset() as usize) < self.capacity,
            "relative pointer {} beyond pool capacity {}",
            rel.offset(),
            self.capacity
        );
        // SAFETY: the offset is within the mapping (debug-asserted above;
        // persisted pointers are only ever produced by this allocator).
        unsafe { self.base.add(rel.offset() as usize) }
    }

    fn relative(&self, abs: *const u8) -> RelPtr {
        let offset = abs as usize - self.base as usize;
        debug_assert!(offset < self.capacity);
        RelPtr::from_offset(offset as u64)
    }
}
