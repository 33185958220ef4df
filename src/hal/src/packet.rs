//! Zero-copy packet type backed by a buffer-store buffer.
//!
//! A [`Packet`] owns one fixed-size buffer for its whole life. The payload
//! is a window into that buffer; link layers prepend headers by moving the
//! window start into the reserved headroom, never by copying. Dropping a
//! packet returns its buffer to the store it came from, wherever in the
//! stack the drop happens.
//!
//! Outbound packets can be chained into an ordered sequence; the driver
//! walks the chain element by element at transmit time.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::slice;

use crate::BufferStore;

/// An owned network packet inside a buffer-store buffer.
pub struct Packet {
    /// Base of the underlying buffer.
    buf: NonNull<u8>,
    /// Total buffer size.
    bufsize: u32,
    /// Payload start, relative to `buf`.
    offset: u32,
    /// Payload length.
    len: u32,
    /// Store the buffer returns to on drop.
    store: Arc<dyn BufferStore>,
    /// Next packet in an outbound chain.
    next: Option<Box<Packet>>,
}

// SAFETY: A Packet exclusively owns its buffer; the raw pointer is never
// aliased while the packet is alive, and the store is Send + Sync.
unsafe impl Send for Packet {}

impl Packet {
    /// Wrap a raw buffer as a packet.
    ///
    /// # Safety
    ///
    /// `buf` must point to a live buffer of `store.bufsize()` bytes handed
    /// out by `store`, exclusively owned by the caller, and
    /// `offset + len <= store.bufsize()`.
    pub unsafe fn from_raw(
        buf: NonNull<u8>,
        offset: u32,
        len: u32,
        store: Arc<dyn BufferStore>,
    ) -> Packet {
        let bufsize = store.bufsize() as u32;
        debug_assert!(offset + len <= bufsize);
        Packet {
            buf,
            bufsize,
            offset,
            len,
            store,
            next: None,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available for the payload at the current offset.
    pub fn capacity(&self) -> usize {
        (self.bufsize - self.offset) as usize
    }

    /// Grow or shrink the payload window.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the remaining capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len as u32;
    }

    /// Pointer to the start of the payload.
    pub fn payload_ptr(&self) -> NonNull<u8> {
        // SAFETY: offset is within the buffer by construction.
        unsafe { NonNull::new_unchecked(self.buf.as_ptr().add(self.offset as usize)) }
    }

    /// Base pointer of the underlying buffer.
    pub fn buffer_base(&self) -> NonNull<u8> {
        self.buf
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the payload window lies within the exclusively owned buffer.
        unsafe { slice::from_raw_parts(self.payload_ptr().as_ptr(), self.len as usize) }
    }

    /// Mutable payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `payload`, plus we hold `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.payload_ptr().as_ptr(), self.len as usize) }
    }

    /// Append a packet to the end of this chain.
    pub fn chain(&mut self, packet: Packet) {
        match self.next {
            Some(ref mut next) => next.chain(packet),
            None => self.next = Some(Box::new(packet)),
        }
    }

    /// Split off everything after this packet.
    pub fn detach_tail(&mut self) -> Option<Packet> {
        self.next.take().map(|boxed| *boxed)
    }

    /// Number of packets in the chain, including this one.
    pub fn chain_length(&self) -> usize {
        let mut count = 1;
        let mut cursor = self.next.as_deref();
        while let Some(p) = cursor {
            count += 1;
            cursor = p.next.as_deref();
        }
        count
    }

    /// Take the buffer out of the packet without returning it to the store.
    ///
    /// Used when buffer ownership moves into a descriptor ring; the caller
    /// becomes responsible for eventually releasing the buffer. Any chained
    /// tail is dropped normally.
    pub fn into_buffer_raw(self) -> NonNull<u8> {
        let mut this = ManuallyDrop::new(self);
        let buf = this.buf;
        // SAFETY: `this` is never dropped, so store and next are read out
        // exactly once and dropped here.
        unsafe {
            core::ptr::drop_in_place(&mut this.store);
            core::ptr::drop_in_place(&mut this.next);
        }
        buf
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.store.release(self.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Store handing out leaked fixed buffers and counting releases.
    struct CountingStore {
        bufsize: usize,
        outstanding: AtomicUsize,
    }

    impl CountingStore {
        fn new(bufsize: usize) -> Arc<Self> {
            Arc::new(CountingStore {
                bufsize,
                outstanding: AtomicUsize::new(0),
            })
        }

        fn take(self: &Arc<Self>) -> Packet {
            let buf = Box::leak(alloc::vec![0u8; self.bufsize].into_boxed_slice());
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
            // SAFETY: freshly leaked allocation of bufsize bytes.
            unsafe { Packet::from_raw(ptr, 16, 0, self.clone()) }
        }
    }

    impl BufferStore for CountingStore {
        fn get_buffer(&self) -> Option<NonNull<u8>> {
            None
        }
        fn release(&self, _buf: NonNull<u8>) {
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
        fn bufsize(&self) -> usize {
            self.bufsize
        }
        fn buffers_in_use(&self) -> usize {
            self.outstanding.load(Ordering::Relaxed)
        }
        fn move_to_this_cpu(&self) {}
    }

    #[test]
    fn test_payload_window() {
        let store = CountingStore::new(256);
        let mut pkt = store.take();
        assert_eq!(pkt.capacity(), 240);

        pkt.set_len(4);
        pkt.payload_mut().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(pkt.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_releases_buffer() {
        let store = CountingStore::new(64);
        let pkt = store.take();
        assert_eq!(store.buffers_in_use(), 1);
        drop(pkt);
        assert_eq!(store.buffers_in_use(), 0);
    }

    #[test]
    fn test_chain_walk() {
        let store = CountingStore::new(64);
        let mut head = store.take();
        head.chain(store.take());
        head.chain(store.take());
        assert_eq!(head.chain_length(), 3);

        let tail = head.detach_tail().unwrap();
        assert_eq!(head.chain_length(), 1);
        assert_eq!(tail.chain_length(), 2);
        drop(head);
        drop(tail);
        assert_eq!(store.buffers_in_use(), 0);
    }

    #[test]
    fn test_into_buffer_raw_skips_release() {
        let store = CountingStore::new(64);
        let pkt = store.take();
        let buf = pkt.into_buffer_raw();
        assert_eq!(store.buffers_in_use(), 1);
        store.release(buf);
        assert_eq!(store.buffers_in_use(), 0);
    }
}
