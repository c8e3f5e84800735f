//! Bounded ring primitives
//!
//! All rings in the fabric share the same cursor arithmetic: free-running
//! `rp`/`wp` counters that wrap on overflow, masked into a power-of-two
//! slot array. The ring is full when `wp - rp == depth` and empty when
//! `rp == wp`.

mod skb_array;

pub use skb_array::{SkbArray, SkbSlot};

use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity signal from a ring primitive
///
/// These are control-flow results rather than faults; owners map them into
/// [`crate::Error`] with their own identity attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Empty,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "ring full"),
            QueueError::Empty => write!(f, "ring empty"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Read/write cursors of a power-of-two ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingIndex {
    rp: u32,
    wp: u32,
    depth: u32,
    mask: u32,
}

impl RingIndex {
    /// Create cursors for a ring of `depth` slots
    ///
    /// `depth` must be a non-zero power of two that fits the 32-bit
    /// hardware cursor registers.
    pub fn new(depth: usize) -> Result<Self> {
        if depth == 0 || !depth.is_power_of_two() || depth > (1 << 31) {
            return Err(Error::InvalidDepth(depth));
        }

        Ok(Self {
            rp: 0,
            wp: 0,
            depth: depth as u32,
            mask: depth as u32 - 1,
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    #[inline]
    pub fn rp(&self) -> u32 {
        self.rp
    }

    #[inline]
    pub fn wp(&self) -> u32 {
        self.wp
    }

    /// Number of occupied slots
    #[inline]
    pub fn len(&self) -> usize {
        self.wp.wrapping_sub(self.rp) as usize
    }

    /// Number of free slots
    #[inline]
    pub fn free(&self) -> usize {
        self.depth() - self.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.depth()
    }

    /// Slot the next write lands in
    #[inline]
    pub fn write_slot(&self) -> usize {
        (self.wp & self.mask) as usize
    }

    /// Slot `n` positions after the write cursor
    #[inline]
    pub fn write_slot_at(&self, n: usize) -> usize {
        (self.wp.wrapping_add(n as u32) & self.mask) as usize
    }

    /// Slot the next read comes from
    #[inline]
    pub fn read_slot(&self) -> usize {
        (self.rp & self.mask) as usize
    }

    /// Reserve room for `n` writes without moving the cursor
    pub fn check_room(&self, n: usize) -> std::result::Result<(), QueueError> {
        if n > self.free() {
            Err(QueueError::Full)
        } else {
            Ok(())
        }
    }

    /// Publish `n` slots written at the write cursor
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.wp = self.wp.wrapping_add(n as u32);
    }

    /// Release `n` slots at the read cursor
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.rp = self.rp.wrapping_add(n as u32);
    }

    /// Reset both cursors to zero
    pub fn reset(&mut self) {
        self.rp = 0;
        self.wp = 0;
    }
}

/// Ring statistics
#[derive(Debug, Default)]
pub struct RingStats {
    pub enqueued: AtomicUsize,
    pub dequeued: AtomicUsize,
    pub full_hits: AtomicUsize,
    pub empty_hits: AtomicUsize,
    pub peak_size: AtomicUsize,
}

impl RingStats {
    pub fn record_push(&self, count: usize, size_after: usize) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
        self.peak_size.fetch_max(size_after, Ordering::Relaxed);
    }

    pub fn record_pop(&self, count: usize) {
        self.dequeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record(&self, err: QueueError) {
        match err {
            QueueError::Full => self.full_hits.fetch_add(1, Ordering::Relaxed),
            QueueError::Empty => self.empty_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> RingStatsView {
        RingStatsView {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            full_hits: self.full_hits.load(Ordering::Relaxed),
            empty_hits: self.empty_hits.load(Ordering::Relaxed),
            peak_size: self.peak_size.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RingStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStatsView {
    pub enqueued: usize,
    pub dequeued: usize,
    pub full_hits: usize,
    pub empty_hits: usize,
    pub peak_size: usize,
}

/// Bounded FIFO ring owning its items
///
/// Not internally synchronised; owners wrap it in the lock that also
/// covers the matching hardware register write.
pub struct BoundedRing<T> {
    slots: Box<[Option<T>]>,
    index: RingIndex,
}

impl<T> BoundedRing<T> {
    pub fn new(depth: usize) -> Result<Self> {
        let index = RingIndex::new(depth)?;
        let slots = (0..depth).map(|_| None).collect::<Vec<_>>().into_boxed_slice();

        Ok(Self { slots, index })
    }

    /// Append an item; a full ring hands it back
    pub fn push(&mut self, item: T) -> std::result::Result<(), T> {
        if self.index.is_full() {
            return Err(item);
        }
        self.slots[self.index.write_slot()] = Some(item);
        self.index.advance_write(1);
        Ok(())
    }

    pub fn pop(&mut self) -> std::result::Result<T, QueueError> {
        if self.index.is_empty() {
            return Err(QueueError::Empty);
        }
        let slot = self.index.read_slot();
        let item = self.slots[slot].take().ok_or(QueueError::Empty)?;
        self.index.advance_read(1);
        Ok(item)
    }

    pub fn peek(&self) -> Option<&T> {
        if self.index.is_empty() {
            return None;
        }
        self.slots[self.index.read_slot()].as_ref()
    }

    pub fn index(&self) -> &RingIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn depth(&self) -> usize {
        self.index.depth()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.index.is_full()
    }

    /// Remove every item in FIFO order
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        while let Ok(item) = self.pop() {
            items.push(item);
        }
        items
    }
}

impl<T> fmt::Debug for BoundedRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedRing")
            .field("index", &self.index)
            .finish()
    }
}
