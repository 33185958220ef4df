//! Slab-backed store of fixed-size packet buffers.
//!
//! Buffers are carved out of large slab allocations and recycled through a
//! free list. The store grows by whole slabs when the free list runs dry;
//! bounding how many buffers leave the store is the upper stack's job, via
//! its admission predicate, not the allocator's.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use spin::Mutex;
use vmxnet3_hal::BufferStore;

/// Buffer alignment; keeps payloads cacheline-aligned.
const BUFFER_ALIGN: usize = 64;

/// One slab allocation.
struct Slab {
    base: NonNull<u8>,
    layout: Layout,
}

struct PoolInner {
    /// Backing slabs, freed together when the store drops.
    slabs: Vec<Slab>,
    /// Free buffer addresses.
    free: Vec<NonNull<u8>>,
    /// Total buffers carved out so far.
    total: usize,
}

/// A growable pool of equally sized packet buffers.
pub struct BufferPool {
    bufsize: usize,
    /// Buffers added per growth step.
    slab_buffers: usize,
    inner: Mutex<PoolInner>,
}

// SAFETY: all pointer state is behind the Mutex; buffers handed out are
// exclusively owned by the taker until released.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool and carve out an initial slab of `slab_buffers`
    /// buffers of `bufsize` bytes each.
    pub fn new(slab_buffers: usize, bufsize: usize) -> Arc<BufferPool> {
        assert!(bufsize % 16 == 0);
        let pool = BufferPool {
            bufsize,
            slab_buffers,
            inner: Mutex::new(PoolInner {
                slabs: Vec::new(),
                free: Vec::new(),
                total: 0,
            }),
        };
        pool.grow(&mut pool.inner.lock());
        Arc::new(pool)
    }

    /// Add one slab's worth of buffers to the free list.
    fn grow(&self, inner: &mut PoolInner) {
        let size = self.bufsize * self.slab_buffers;
        let layout = match Layout::from_size_align(size, BUFFER_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("bad buffer pool layout"),
        };
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        for i in 0..self.slab_buffers {
            // SAFETY: offset stays inside the slab allocation.
            let buf = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * self.bufsize)) };
            inner.free.push(buf);
        }
        inner.total += self.slab_buffers;
        inner.slabs.push(Slab { base, layout });
    }
}

impl BufferStore for BufferPool {
    fn get_buffer(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            self.grow(&mut inner);
        }
        inner.free.pop()
    }

    fn release(&self, buf: NonNull<u8>) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner
                .slabs
                .iter()
                .any(|slab| {
                    let off = (buf.as_ptr() as usize).wrapping_sub(slab.base.as_ptr() as usize);
                    off < self.bufsize * self.slab_buffers && off % self.bufsize == 0
                }),
            "released buffer does not belong to this pool"
        );
        inner.free.push(buf);
    }

    fn bufsize(&self) -> usize {
        self.bufsize
    }

    fn buffers_in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner.total - inner.free.len()
    }

    fn move_to_this_cpu(&self) {
        // The slabs are plain memory, valid from any CPU; reattachment is
        // bookkeeping for per-CPU accounting only.
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for slab in inner.slabs.drain(..) {
            // SAFETY: allocated in `grow` with this layout.
            unsafe { alloc::alloc::dealloc(slab.base.as_ptr(), slab.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_and_release() {
        let pool = BufferPool::new(4, 64);
        assert_eq!(pool.bufsize(), 64);
        assert_eq!(pool.buffers_in_use(), 0);

        let a = pool.get_buffer().unwrap();
        let b = pool.get_buffer().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.buffers_in_use(), 2);

        pool.release(a);
        assert_eq!(pool.buffers_in_use(), 1);
        pool.release(b);
        assert_eq!(pool.buffers_in_use(), 0);
    }

    #[test]
    fn test_grows_past_initial_slab() {
        let pool = BufferPool::new(2, 32);
        let bufs: Vec<_> = (0..5).map(|_| pool.get_buffer().unwrap()).collect();
        assert_eq!(pool.buffers_in_use(), 5);
        for buf in bufs {
            pool.release(buf);
        }
        assert_eq!(pool.buffers_in_use(), 0);
    }

    #[test]
    fn test_buffers_are_aligned() {
        let pool = BufferPool::new(2, 48);
        let buf = pool.get_buffer().unwrap();
        assert_eq!(buf.as_ptr() as usize % 16, 0);
        pool.release(buf);
    }
}
