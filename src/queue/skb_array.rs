//! Buffer pool of handles awaiting hardware completion

use super::{BoundedRing, QueueError, RingStats, RingStatsView};
use crate::{Error, Result};

/// One pending buffer: the owning handle and the address the hardware saw
#[derive(Debug)]
pub struct SkbSlot<H> {
    pub handle: H,
    pub dma_addr: u64,
}

/// Circular index of buffers posted to a ring, in posting order
///
/// Popping is only legal once the descriptor for the front slot has come
/// back from the hardware; callers compare [`SkbArray::peek_addr`] with the
/// completed descriptor's address before popping.
pub struct SkbArray<H> {
    ring: BoundedRing<SkbSlot<H>>,
    stats: RingStats,
}

impl<H> SkbArray<H> {
    pub fn new(depth: usize) -> Result<Self> {
        Ok(Self {
            ring: BoundedRing::new(depth)?,
            stats: RingStats::default(),
        })
    }

    /// Enqueue a buffer awaiting completion
    ///
    /// Fails with [`Error::PoolFull`] when `wp - rp == depth`; the handle is
    /// handed back so the caller keeps ownership.
    pub fn push(&mut self, handle: H, dma_addr: u64) -> std::result::Result<(), (H, Error)> {
        match self.ring.push(SkbSlot { handle, dma_addr }) {
            Ok(()) => {
                self.stats.record_push(1, self.ring.len());
                Ok(())
            }
            Err(slot) => {
                self.stats.record(QueueError::Full);
                Err((slot.handle, Error::PoolFull))
            }
        }
    }

    /// Dequeue the oldest buffer
    pub fn pop(&mut self) -> Result<(H, u64)> {
        match self.ring.pop() {
            Ok(slot) => {
                self.stats.record_pop(1);
                Ok((slot.handle, slot.dma_addr))
            }
            Err(err) => {
                self.stats.record(err);
                Err(Error::PoolEmpty)
            }
        }
    }

    /// Device address of the oldest buffer, without dequeuing it
    pub fn peek_addr(&self) -> Option<u64> {
        self.ring.peek().map(|slot| slot.dma_addr)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn depth(&self) -> usize {
        self.ring.depth()
    }

    pub fn free(&self) -> usize {
        self.ring.index().free()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn rp(&self) -> u32 {
        self.ring.index().rp()
    }

    pub fn wp(&self) -> u32 {
        self.ring.index().wp()
    }

    pub fn stats(&self) -> RingStatsView {
        self.stats.snapshot()
    }

    /// Release every pending buffer, oldest first
    pub fn drain(&mut self) -> Vec<(H, u64)> {
        self.ring
            .drain()
            .into_iter()
            .map(|slot| (slot.handle, slot.dma_addr))
            .collect()
    }
}
