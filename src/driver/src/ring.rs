//! Cursor and generation bookkeeping for descriptor rings.
//!
//! These types track the driver's view of each ring: producer and consumer
//! cursors, the generation bit, and free-slot accounting. They never touch
//! the DMA memory themselves; the device core reads and writes descriptors
//! and drives these cursors alongside.

use core::ptr::NonNull;

use crate::dma::NUM_TX_DESC;

/// Driver-side state of one RX descriptor ring.
///
/// `producers` and `consumers` stay in `0..size`; the generation bit flips
/// whenever the producer wraps. `unallocated` counts slots not currently
/// posted to the device, so `unallocated == size` means the ring is empty
/// and `unallocated == 0` means every slot is owned by the device.
#[derive(Debug)]
pub struct DescRing {
    /// Ring capacity.
    pub size: u32,
    /// Next slot to fill.
    pub producers: u32,
    /// Next slot the device will complete.
    pub consumers: u32,
    /// Current generation bit, 0 or 1.
    pub generation: u32,
    /// Slots not posted to the device.
    pub unallocated: u32,
}

impl DescRing {
    /// A fresh ring; generation starts at 1, the device expects 1 first.
    pub fn new(size: u32) -> DescRing {
        DescRing {
            size,
            producers: 0,
            consumers: 0,
            generation: 1,
            unallocated: size,
        }
    }

    /// Account one filled slot and advance the producer.
    ///
    /// Returns `true` when the producer wrapped (and the generation
    /// flipped); refill loops stop at the wrap.
    pub fn advance_producer(&mut self) -> bool {
        debug_assert!(self.unallocated > 0);
        self.unallocated -= 1;
        self.producers += 1;
        if self.producers == self.size {
            self.generation ^= 1;
            self.producers = 0;
            return true;
        }
        false
    }

    /// Take the slot index at the consumer cursor and advance it.
    pub fn advance_consumer(&mut self) -> u32 {
        let idx = self.consumers;
        self.consumers += 1;
        if self.consumers == self.size {
            self.consumers = 0;
        }
        idx
    }

    /// Account one slot returned by the device.
    ///
    /// Returns `true` when the ring has fully drained.
    pub fn credit_slot(&mut self) -> bool {
        debug_assert!(self.unallocated < self.size);
        self.unallocated += 1;
        self.unallocated == self.size
    }

    /// Whether no slot is posted to the device.
    pub fn empty(&self) -> bool {
        self.unallocated == self.size
    }
}

/// Driver-side cursor of a completion ring.
#[derive(Debug)]
pub struct CompCursor {
    /// Ring capacity.
    pub size: u32,
    /// Next entry to inspect.
    pub consumers: u32,
    /// Generation bit expected on the next valid entry.
    pub generation: u32,
}

impl CompCursor {
    /// A fresh cursor expecting generation 1.
    pub fn new(size: u32) -> CompCursor {
        CompCursor {
            size,
            consumers: 0,
            generation: 1,
        }
    }

    /// Advance past one consumed entry, flipping the expected generation
    /// on wrap.
    pub fn advance(&mut self) {
        self.consumers += 1;
        if self.consumers == self.size {
            self.generation ^= 1;
            self.consumers = 0;
        }
    }
}

/// State of the single TX ring.
///
/// Cursors run free (only reduced mod [`NUM_TX_DESC`] when indexing), so
/// `producers - consumers` is the in-flight count and bit log2(N) of each
/// cursor doubles as that side's generation parity. One slot stays
/// reserved to distinguish full from empty.
pub struct TxRing {
    /// Total descriptors produced.
    pub producers: u32,
    /// Total completions consumed.
    pub consumers: u32,
    /// Producer value last published through the doorbell.
    pub flushvalue: u32,
    /// Buffer owned by each in-flight slot.
    pub buffers: [Option<NonNull<u8>>; NUM_TX_DESC],
}

// SAFETY: the slot handles are exclusively owned buffers; the ring itself
// is only ever touched under the driver's state lock.
unsafe impl Send for TxRing {}

impl TxRing {
    /// An empty TX ring.
    pub fn new() -> TxRing {
        TxRing {
            producers: 0,
            consumers: 0,
            flushvalue: 0,
            buffers: [None; NUM_TX_DESC],
        }
    }

    /// Descriptors that can still be filled before the ring is full.
    pub fn tokens_free(&self) -> u32 {
        (NUM_TX_DESC as u32 - 1) - self.producers.wrapping_sub(self.consumers)
    }

    /// Producer advance not yet published to the device.
    pub fn flush_diff(&self) -> u32 {
        self.producers.wrapping_sub(self.flushvalue)
    }
}

impl Default for TxRing {
    fn default() -> Self {
        TxRing::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_ring_fill_and_wrap() {
        let mut ring = DescRing::new(4);
        assert!(ring.empty());
        assert_eq!(ring.generation, 1);

        // Fill all four slots; only the last advance wraps.
        for i in 0..3 {
            assert_eq!(ring.producers, i);
            assert!(!ring.advance_producer());
        }
        assert!(ring.advance_producer());
        assert_eq!(ring.producers, 0);
        assert_eq!(ring.generation, 0);
        assert_eq!(ring.unallocated, 0);
    }

    #[test]
    fn test_desc_ring_accounting_invariant() {
        let mut ring = DescRing::new(8);
        for _ in 0..5 {
            ring.advance_producer();
        }
        // unallocated + in-flight == size at every step.
        assert_eq!(ring.unallocated + (ring.producers - ring.consumers), 8);

        ring.advance_consumer();
        ring.credit_slot();
        assert_eq!(ring.unallocated, 4);
        assert_eq!(ring.consumers, 1);
        assert!(ring.generation == 0 || ring.generation == 1);
    }

    #[test]
    fn test_desc_ring_drain_detection() {
        let mut ring = DescRing::new(2);
        ring.advance_producer();
        ring.advance_producer();
        ring.advance_consumer();
        assert!(!ring.credit_slot());
        ring.advance_consumer();
        assert!(ring.credit_slot());
        assert!(ring.empty());
    }

    #[test]
    fn test_comp_cursor_generation_flip() {
        let mut comp = CompCursor::new(3);
        assert_eq!(comp.generation, 1);
        comp.advance();
        comp.advance();
        comp.advance();
        assert_eq!(comp.consumers, 0);
        assert_eq!(comp.generation, 0);
        comp.advance();
        assert_eq!(comp.consumers, 1);
        assert_eq!(comp.generation, 0);
    }

    #[test]
    fn test_tx_tokens_reserved_slot() {
        let mut tx = TxRing::new();
        assert_eq!(tx.tokens_free(), NUM_TX_DESC as u32 - 1);

        // Fill to the one-reserved-slot limit.
        tx.producers += NUM_TX_DESC as u32 - 1;
        assert_eq!(tx.tokens_free(), 0);

        tx.consumers += 10;
        assert_eq!(tx.tokens_free(), 10);
    }

    #[test]
    fn test_tx_flush_diff() {
        let mut tx = TxRing::new();
        assert_eq!(tx.flush_diff(), 0);
        tx.producers = 10;
        assert_eq!(tx.flush_diff(), 10);
        tx.flushvalue = 10;
        assert_eq!(tx.flush_diff(), 0);
    }

    #[test]
    fn test_tx_generation_parity() {
        // Bit log2(N) of the producer cursor selects the generation.
        let n = NUM_TX_DESC as u32;
        assert_eq!(0 & n, 0);
        assert_ne!(n & n, 0);
        assert_eq!((2 * n) & n, 0);
    }
}
