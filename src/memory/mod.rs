//! Ring memory placement and device-visible buffers
//!
//! Rings live either in the small fast on-chip region, carved out by a bump
//! pointer that only moves forward, or in general coherent memory mapped per
//! ring. Receive/transmit payload buffers are plain heap allocations whose
//! address doubles as their device address.

use crate::fifo::{RingDirection, DESCRIPTOR_SIZE};
use crate::{Error, Result};
use log::{debug, warn};
use memmap2::MmapMut;
use nix::unistd::{sysconf, SysconfVar};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Ring base addresses are aligned to this many bytes
pub const RING_ALIGN: usize = 8;

/// Page size information
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub page_size: usize,
}

impl PageInfo {
    /// Get system page information
    pub fn new() -> Self {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .filter(|size| *size > 0)
            .unwrap_or(4096) as usize;

        Self { page_size }
    }

    pub fn round_up(&self, size: usize) -> usize {
        ((size + self.page_size - 1) / self.page_size) * self.page_size
    }
}

impl Default for PageInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a ring's backing storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    FastMemory,
    GeneralMemory,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::GeneralMemory
    }
}

/// 64-bit device address split the way ring base registers take it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    #[inline]
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Fixed on-chip region handed out by a forward-only bump pointer
struct FastRegion {
    map: MmapMut,
    base: NonNull<u8>,
    dev_base: u64,
    size: usize,
    allocated: Mutex<usize>,
    live: AtomicUsize,
}

// SAFETY: the region is only written through disjoint ring slices handed out
// by the bump allocator, each guarded by its owner's ring lock.
unsafe impl Send for FastRegion {}
unsafe impl Sync for FastRegion {}

impl FastRegion {
    fn new(size: usize, dev_base: u64) -> Result<Self> {
        let mut map = MmapMut::map_anon(size).map_err(|e| {
            Error::MemoryAllocation(format!("fast memory region of {} bytes: {}", size, e))
        })?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::MemoryAllocation("fast memory mapped at null".to_string()))?;

        Ok(Self {
            map,
            base,
            dev_base,
            size,
            allocated: Mutex::new(0),
            live: AtomicUsize::new(0),
        })
    }

    /// First-fit bump allocation; existing rings are never moved
    fn carve(&self, len: usize) -> Result<usize> {
        let mut allocated = self.allocated.lock();
        let offset = (*allocated + RING_ALIGN - 1) & !(RING_ALIGN - 1);
        if offset + len > self.size {
            return Err(Error::FastMemoryExhausted {
                requested: len,
                available: self.size.saturating_sub(offset),
            });
        }
        *allocated = offset + len;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(offset)
    }

    fn used(&self) -> usize {
        *self.allocated.lock()
    }
}

impl fmt::Debug for FastRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastRegion")
            .field("dev_base", &format_args!("{:#x}", self.dev_base))
            .field("size", &self.size)
            .field("mapped", &self.map.len())
            .field("used", &self.used())
            .finish()
    }
}

enum Backing {
    Fast(Arc<FastRegion>),
    General(MmapMut),
}

/// Backing storage of one descriptor ring
///
/// General-memory rings are unmapped when the handle drops; fast-memory
/// rings keep their slice of the region until the allocator is
/// reinitialised.
pub struct RingMemory {
    ptr: NonNull<u8>,
    len: usize,
    dev_addr: DeviceAddress,
    placement: Placement,
    counters: Arc<AllocCounters>,
    backing: Backing,
}

// SAFETY: the memory is exclusively owned by this handle (or a disjoint
// slice of the fast region) and all access goes through the owning ring's
// lock.
unsafe impl Send for RingMemory {}
unsafe impl Sync for RingMemory {}

impl RingMemory {
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn device_address(&self) -> DeviceAddress {
        self.dev_addr
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }
}

impl Drop for RingMemory {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Fast(region) => {
                region.live.fetch_sub(1, Ordering::AcqRel);
            }
            Backing::General(_) => {
                self.counters.general_rings.fetch_sub(1, Ordering::Relaxed);
                self.counters
                    .general_bytes
                    .fetch_sub(self.len, Ordering::Relaxed);
            }
        }
    }
}

impl fmt::Debug for RingMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingMemory")
            .field("dev_addr", &self.dev_addr)
            .field("len", &self.len)
            .field("placement", &self.placement)
            .finish()
    }
}

#[derive(Debug, Default)]
struct AllocCounters {
    fast_rings: AtomicUsize,
    general_rings: AtomicUsize,
    general_bytes: AtomicUsize,
    fast_failures: AtomicUsize,
    fallbacks: AtomicUsize,
}

/// Allocation statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    pub fast_size: usize,
    pub fast_used: usize,
    pub fast_rings: usize,
    pub general_rings: usize,
    pub general_bytes: usize,
    pub fast_failures: usize,
    pub fallbacks: usize,
    pub page_size: usize,
}

/// Places ring storage in fast or general memory
pub struct RingAllocator {
    fast: Mutex<Option<Arc<FastRegion>>>,
    fast_size: usize,
    fast_base: u64,
    page_info: PageInfo,
    counters: Arc<AllocCounters>,
}

impl RingAllocator {
    /// Create an allocator with a fast region of `fast_size` bytes at device
    /// address `fast_base`; a zero size disables fast placement
    pub fn new(fast_size: usize, fast_base: u64) -> Result<Self> {
        let fast = Self::map_fast(fast_size, fast_base)?;

        Ok(Self {
            fast: Mutex::new(fast),
            fast_size,
            fast_base,
            page_info: PageInfo::new(),
            counters: Arc::new(AllocCounters::default()),
        })
    }

    fn map_fast(size: usize, base: u64) -> Result<Option<Arc<FastRegion>>> {
        if size == 0 {
            return Ok(None);
        }
        Ok(Some(Arc::new(FastRegion::new(size, base)?)))
    }

    /// Bytes a ring of `depth` descriptors occupies
    pub fn ring_bytes(depth: usize) -> usize {
        depth * DESCRIPTOR_SIZE
    }

    /// Allocate storage for a ring of `depth` descriptors
    ///
    /// Fast-memory exhaustion is permanent for this allocator; see
    /// [`RingAllocator::allocate_with_fallback`].
    pub fn allocate(
        &self,
        direction: RingDirection,
        depth: usize,
        placement: Placement,
    ) -> Result<RingMemory> {
        if depth == 0 {
            return Err(Error::InvalidDepth(depth));
        }
        let len = Self::ring_bytes(depth);

        let memory = match placement {
            Placement::FastMemory => self.allocate_fast(len)?,
            Placement::GeneralMemory => self.allocate_general(len)?,
        };

        debug!(
            "allocated {:?} ring: depth {} at {} ({:?})",
            direction, depth, memory.dev_addr, placement
        );
        Ok(memory)
    }

    /// Allocate, falling back to general memory when the fast region is full
    pub fn allocate_with_fallback(
        &self,
        direction: RingDirection,
        depth: usize,
        placement: Placement,
    ) -> Result<RingMemory> {
        match self.allocate(direction, depth, placement) {
            Err(Error::FastMemoryExhausted {
                requested,
                available,
            }) => {
                warn!(
                    "fast memory exhausted ({} requested, {} left), placing {:?} ring in general memory",
                    requested, available, direction
                );
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.allocate(direction, depth, Placement::GeneralMemory)
            }
            other => other,
        }
    }

    fn allocate_fast(&self, len: usize) -> Result<RingMemory> {
        let region = self.fast.lock().clone();
        let region = match region {
            Some(region) => region,
            None => {
                self.counters.fast_failures.fetch_add(1, Ordering::Relaxed);
                return Err(Error::FastMemoryExhausted {
                    requested: len,
                    available: 0,
                });
            }
        };

        let offset = match region.carve(len) {
            Ok(offset) => offset,
            Err(err) => {
                self.counters.fast_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        self.counters.fast_rings.fetch_add(1, Ordering::Relaxed);

        // SAFETY: carve() guarantees offset + len <= region size
        let ptr = unsafe { NonNull::new_unchecked(region.base.as_ptr().add(offset)) };
        let dev_addr = DeviceAddress(region.dev_base + offset as u64);

        Ok(RingMemory {
            ptr,
            len,
            dev_addr,
            placement: Placement::FastMemory,
            counters: Arc::clone(&self.counters),
            backing: Backing::Fast(region),
        })
    }

    fn allocate_general(&self, len: usize) -> Result<RingMemory> {
        let mapped = self.page_info.round_up(len);
        let mut map = MmapMut::map_anon(mapped)
            .map_err(|e| Error::MemoryAllocation(format!("ring of {} bytes: {}", len, e)))?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::MemoryAllocation("ring mapped at null".to_string()))?;

        self.counters.general_rings.fetch_add(1, Ordering::Relaxed);
        self.counters.general_bytes.fetch_add(len, Ordering::Relaxed);

        Ok(RingMemory {
            ptr,
            len,
            dev_addr: DeviceAddress(ptr.as_ptr() as u64),
            placement: Placement::GeneralMemory,
            counters: Arc::clone(&self.counters),
            backing: Backing::General(map),
        })
    }

    /// Release a ring's storage
    pub fn release(&self, memory: RingMemory) {
        debug!("released ring at {} ({:?})", memory.dev_addr, memory.placement);
        drop(memory);
    }

    /// Reset the fast region's bump pointer
    ///
    /// Only legal when no fast-memory ring is alive.
    pub fn reinitialize(&self) -> Result<()> {
        let mut fast = self.fast.lock();
        if let Some(region) = fast.as_ref() {
            let live = region.live.load(Ordering::Acquire);
            if live > 0 {
                return Err(Error::InvalidConfig(format!(
                    "cannot reinitialize fast memory with {} live rings",
                    live
                )));
            }
        }
        *fast = Self::map_fast(self.fast_size, self.fast_base)?;
        self.counters.fast_rings.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> AllocationStats {
        let fast_used = self.fast.lock().as_ref().map_or(0, |region| region.used());
        AllocationStats {
            fast_size: self.fast_size,
            fast_used,
            fast_rings: self.counters.fast_rings.load(Ordering::Relaxed),
            general_rings: self.counters.general_rings.load(Ordering::Relaxed),
            general_bytes: self.counters.general_bytes.load(Ordering::Relaxed),
            fast_failures: self.counters.fast_failures.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            page_size: self.page_info.page_size,
        }
    }
}

impl fmt::Debug for RingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingAllocator")
            .field("fast", &*self.fast.lock())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Heap buffer handed to the hardware by address
///
/// The device address is the buffer's virtual address; the memory never
/// moves for the lifetime of the handle.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: DmaBuffer uniquely owns its allocation.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate a zeroed buffer of `len` bytes
    pub fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::MemoryAllocation("zero-length buffer".to_string()));
        }
        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| Error::MemoryAllocation(format!("buffer of {} bytes: {}", len, e)))?;
        data.resize(len, 0);

        let raw = Box::into_raw(data.into_boxed_slice());
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(raw as *mut u8) };
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn dma_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len come from a live boxed slice owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: reconstructs the boxed slice leaked in alloc()
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaBuffer({:#x}, {})", self.dma_addr(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_info() {
        let info = PageInfo::new();
        assert!(info.page_size > 0);
        assert_eq!(info.round_up(1), info.page_size);
        assert_eq!(info.round_up(info.page_size), info.page_size);
    }

    #[test]
    fn test_device_address_halves() {
        let addr = DeviceAddress(0x0000_0001_8000_0040);
        assert_eq!(addr.low(), 0x8000_0040);
        assert_eq!(addr.high(), 0x1);
    }

    #[test]
    fn test_fast_memory_is_bump_allocated() {
        let allocator = RingAllocator::new(2 * RingAllocator::ring_bytes(16), 0x1000_0000).unwrap();
        let a = allocator
            .allocate(RingDirection::Rx, 16, Placement::FastMemory)
            .unwrap();
        let b = allocator
            .allocate(RingDirection::Tx, 16, Placement::FastMemory)
            .unwrap();
        assert_eq!(a.device_address().0, 0x1000_0000);
        assert_eq!(
            b.device_address().0,
            0x1000_0000 + RingAllocator::ring_bytes(16) as u64
        );

        // Freeing a fast ring never rewinds the bump pointer
        drop(a);
        let err = allocator
            .allocate(RingDirection::Rx, 16, Placement::FastMemory)
            .unwrap_err();
        assert!(matches!(err, Error::FastMemoryExhausted { .. }));
        assert_eq!(allocator.stats().fast_failures, 1);
        drop(b);
    }

    #[test]
    fn test_fallback_to_general_memory() {
        let allocator = RingAllocator::new(0, 0).unwrap();
        let ring = allocator
            .allocate_with_fallback(RingDirection::Rx, 8, Placement::FastMemory)
            .unwrap();
        assert_eq!(ring.placement(), Placement::GeneralMemory);
        assert_eq!(ring.len(), 8 * DESCRIPTOR_SIZE);
        let stats = allocator.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.general_rings, 1);

        allocator.release(ring);
        assert_eq!(allocator.stats().general_rings, 0);
    }

    #[test]
    fn test_reinitialize_requires_no_live_rings() {
        let allocator = RingAllocator::new(RingAllocator::ring_bytes(8), 0).unwrap();
        let ring = allocator
            .allocate(RingDirection::Rx, 8, Placement::FastMemory)
            .unwrap();
        assert!(allocator.reinitialize().is_err());
        drop(ring);
        allocator.reinitialize().unwrap();
        assert_eq!(allocator.stats().fast_used, 0);
        assert!(allocator
            .allocate(RingDirection::Rx, 8, Placement::FastMemory)
            .is_ok());
    }

    #[test]
    fn test_dma_buffer() {
        let mut buf = DmaBuffer::alloc(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert_eq!(buf.dma_addr(), buf.as_slice().as_ptr() as u64);
        assert!(DmaBuffer::alloc(0).is_err());
    }
}
