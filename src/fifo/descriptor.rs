//! Hardware descriptor layout and the descriptor ring living in ring memory

use crate::memory::{DeviceAddress, RingMemory};
use crate::queue::{QueueError, RingIndex, RingStats, RingStatsView};
use crate::{Error, Result};
use static_assertions::const_assert_eq;
use std::fmt;

/// Size of one descriptor in ring memory
pub const DESCRIPTOR_SIZE: usize = 24;

/// One in-flight buffer as the hardware sees it
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Device-visible buffer address
    pub address: u64,
    pub length: u32,
    /// Payload start within the buffer
    pub offset: u16,
    pub source_id: u8,
    pub destination_id: u8,
    /// Network id multiplexing several streams over one endpoint
    pub flow_id: u8,
    pub error_code: u8,
    pub interrupt: u8,
    pub reserved: [u8; 5],
}

const_assert_eq!(std::mem::size_of::<Descriptor>(), DESCRIPTOR_SIZE);

impl Descriptor {
    pub fn new(address: u64, length: u32, offset: u16, source_id: u8, destination_id: u8) -> Self {
        Self {
            address,
            length,
            offset,
            source_id,
            destination_id,
            ..Default::default()
        }
    }

    pub fn with_flow(mut self, flow_id: u8) -> Self {
        self.flow_id = flow_id;
        self
    }

    /// A descriptor routed back to its own source
    #[inline]
    pub fn is_self_loop(&self) -> bool {
        self.source_id == self.destination_id
    }
}

/// Circular array of descriptors in ring memory
pub struct DescriptorRing {
    mem: RingMemory,
    index: RingIndex,
    stats: RingStats,
}

impl DescriptorRing {
    pub fn new(mem: RingMemory, depth: usize) -> Result<Self> {
        let index = RingIndex::new(depth)?;
        if mem.len() < depth * DESCRIPTOR_SIZE {
            return Err(Error::MemoryAllocation(format!(
                "ring memory of {} bytes cannot hold {} descriptors",
                mem.len(),
                depth
            )));
        }
        // SAFETY: mem covers depth * DESCRIPTOR_SIZE writable bytes
        unsafe { std::ptr::write_bytes(mem.as_ptr(), 0, depth * DESCRIPTOR_SIZE) };

        Ok(Self {
            mem,
            index,
            stats: RingStats::default(),
        })
    }

    #[inline]
    fn slot_ptr(&self, slot: usize) -> *mut Descriptor {
        debug_assert!(slot < self.index.depth());
        // SAFETY: slot < depth and the memory holds depth descriptors
        unsafe { (self.mem.as_ptr() as *mut Descriptor).add(slot) }
    }

    /// Write one descriptor at the write cursor
    pub fn push(&mut self, desc: Descriptor) -> std::result::Result<(), QueueError> {
        self.push_batch(std::slice::from_ref(&desc))
    }

    /// Write all of `items` or none of them
    pub fn push_batch(&mut self, items: &[Descriptor]) -> std::result::Result<(), QueueError> {
        if let Err(err) = self.index.check_room(items.len()) {
            self.stats.record(err);
            return Err(err);
        }
        for (n, desc) in items.iter().enumerate() {
            let slot = self.index.write_slot_at(n);
            // SAFETY: slot is in range and aligned for Descriptor
            unsafe { std::ptr::write_volatile(self.slot_ptr(slot), *desc) };
        }
        self.index.advance_write(items.len());
        self.stats.record_push(items.len(), self.index.len());
        Ok(())
    }

    /// Read one descriptor at the read cursor
    pub fn pop(&mut self) -> std::result::Result<Descriptor, QueueError> {
        let desc = match self.peek() {
            Some(desc) => desc,
            None => {
                self.stats.record(QueueError::Empty);
                return Err(QueueError::Empty);
            }
        };
        self.index.advance_read(1);
        self.stats.record_pop(1);
        Ok(desc)
    }

    pub fn peek(&self) -> Option<Descriptor> {
        if self.index.is_empty() {
            return None;
        }
        // SAFETY: read slot is in range and was written by a push
        Some(unsafe { std::ptr::read_volatile(self.slot_ptr(self.index.read_slot())) })
    }

    #[inline]
    pub fn index(&self) -> &RingIndex {
        &self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.index.depth()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.index.is_full()
    }

    pub fn base_address(&self) -> DeviceAddress {
        self.mem.device_address()
    }

    pub fn memory(&self) -> &RingMemory {
        &self.mem
    }

    pub fn stats(&self) -> RingStatsView {
        self.stats.snapshot()
    }
}

impl fmt::Debug for DescriptorRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorRing")
            .field("base", &self.base_address())
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::RingDirection;
    use crate::memory::{Placement, RingAllocator};

    fn ring(depth: usize) -> DescriptorRing {
        let allocator = RingAllocator::new(0, 0).unwrap();
        let mem = allocator
            .allocate(RingDirection::Rx, depth, Placement::GeneralMemory)
            .unwrap();
        DescriptorRing::new(mem, depth).unwrap()
    }

    #[test]
    fn test_descriptor_layout() {
        assert_eq!(std::mem::size_of::<Descriptor>(), DESCRIPTOR_SIZE);
        assert_eq!(std::mem::align_of::<Descriptor>(), 8);
        let desc = Descriptor::new(0x1000, 64, 0, 3, 3);
        assert!(desc.is_self_loop());
        assert!(!Descriptor::new(0x1000, 64, 0, 3, 1).is_self_loop());
    }

    #[test]
    fn test_ring_preserves_post_order() {
        let mut ring = ring(8);
        let mut next = 0u64;
        for i in 0..20u64 {
            ring.push(Descriptor::new(i, 1, 0, 1, 2)).unwrap();
            if i % 3 == 2 {
                while let Ok(desc) = ring.pop() {
                    assert_eq!(desc.address, next);
                    next += 1;
                }
            }
        }
        let rest: Vec<u64> = std::iter::from_fn(|| ring.pop().ok())
            .map(|d| d.address)
            .collect();
        assert_eq!(rest, vec![18, 19]);
    }

    #[test]
    fn test_full_ring_is_untouched() {
        let mut ring = ring(4);
        let batch: Vec<Descriptor> = (0..3).map(|i| Descriptor::new(i, 1, 0, 1, 2)).collect();
        ring.push_batch(&batch).unwrap();
        let before = *ring.index();

        assert_eq!(ring.push_batch(&batch), Err(QueueError::Full));
        assert_eq!(*ring.index(), before);
        assert_eq!(ring.peek().map(|d| d.address), Some(0));
        assert_eq!(ring.stats().full_hits, 1);
    }

    #[test]
    fn test_memory_too_small() {
        let allocator = RingAllocator::new(0, 0).unwrap();
        let mem = allocator
            .allocate(RingDirection::Tx, 4, Placement::GeneralMemory)
            .unwrap();
        assert!(DescriptorRing::new(mem, 8).is_err());
    }
}
