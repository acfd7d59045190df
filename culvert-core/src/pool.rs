use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::ShiftBuf;

/// Creates and destroys items on behalf of a [`MasterPool`]
///
/// `destroy` exists for items that need teardown beyond `Drop`; the default
/// implementation just drops.
pub trait PoolAllocator<T>: Send + Sync {
    /// Produce a fresh item
    fn create(&self) -> T;

    /// Dispose of an item the pool will not store
    fn destroy(&self, item: T) {
        drop(item);
    }
}

/// A capacity-bounded object pool shared between worker threads
///
/// Worker-local pools keep running out of (or overflowing with) items when
/// connections hand buffers across threads, so they fall back to this shared
/// pool instead of the allocator: a full charge moves in one batch under a
/// single mutex acquisition. The `len` counter is read without the lock so
/// the empty and full cases stay lock-free.
///
/// `acquire` never fails; when the shelf runs dry the allocator callback
/// makes up the difference. `release` beyond capacity destroys the surplus
/// immediately rather than queueing it, which bounds memory.
pub struct MasterPool<T> {
    capacity: usize,
    /// Mirror of `items.len()`, readable without the lock. May lag the
    /// locked truth; both fast paths tolerate that.
    len: AtomicUsize,
    items: Mutex<Vec<T>>,
    alloc: Box<dyn PoolAllocator<T>>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl<T> MasterPool<T> {
    /// Create a pool storing at most `capacity` idle items
    pub fn new(capacity: usize, alloc: Box<dyn PoolAllocator<T>>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            len: AtomicUsize::new(0),
            items: Mutex::new(Vec::with_capacity(capacity)),
            alloc,
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        })
    }

    /// Move exactly `count` items into `out`, most recently released first
    pub fn acquire(&self, out: &mut Vec<T>, count: usize) {
        let mut taken = 0;
        if self.len.load(Ordering::Relaxed) > 0 {
            let mut items = self.items.lock().unwrap();
            taken = items.len().min(count);
            let at = items.len() - taken;
            out.extend(items.drain(at..));
            self.len.store(items.len(), Ordering::Relaxed);
        }
        for _ in taken..count {
            self.created.fetch_add(1, Ordering::Relaxed);
            out.push(self.alloc.create());
        }
    }

    /// Return items for reuse; whatever exceeds capacity is destroyed
    pub fn release(&self, items: &mut Vec<T>) {
        if self.capacity > self.len.load(Ordering::Relaxed) {
            let mut stored = self.items.lock().unwrap();
            let room = self.capacity - stored.len();
            let keep = room.min(items.len());
            stored.extend(items.drain(..keep));
            self.len.store(stored.len(), Ordering::Relaxed);
        }
        for item in items.drain(..) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.alloc.destroy(item);
        }
    }

    /// Number of idle items, approximate under concurrency
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the shelf is currently empty, approximate under concurrency
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of idle items stored
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items produced by the allocator so far
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Total items handed back to the allocator so far
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl<T> Drop for MasterPool<T> {
    fn drop(&mut self) {
        let items = self.items.get_mut().unwrap();
        for item in items.drain(..) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.alloc.destroy(item);
        }
    }
}

/// Sizing knobs for buffer pools
///
/// Defaults suit a mid-sized deployment; embedders with many workers or tight
/// memory can dial the capacities down.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub(crate) small_capacity: usize,
    pub(crate) large_capacity: usize,
    pub(crate) left_padding: usize,
    pub(crate) local_target: usize,
    pub(crate) master_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            small_capacity: 2048,
            large_capacity: 16384,
            left_padding: 0,
            local_target: 64,
            master_capacity: 512,
        }
    }
}

impl BufferConfig {
    /// Payload capacity of the small size class, used for datagram-sized
    /// reads
    pub fn small_capacity(&mut self, value: usize) -> &mut Self {
        self.small_capacity = value;
        self
    }

    /// Payload capacity of the large size class, used for stream reads
    pub fn large_capacity(&mut self, value: usize) -> &mut Self {
        self.large_capacity = value;
        self
    }

    /// Left reserve allocated into every pooled buffer
    ///
    /// The engine raises this to the largest cumulative header reserve any
    /// configured chain requires.
    pub fn left_padding(&mut self, value: usize) -> &mut Self {
        self.left_padding = value.max(self.left_padding);
        self
    }

    /// How many idle buffers a worker keeps per size class before handing
    /// surplus back to the master pool
    pub fn local_target(&mut self, value: usize) -> &mut Self {
        self.local_target = value.max(2);
        self
    }

    /// How many idle buffers each shared master pool stores
    pub fn master_capacity(&mut self, value: usize) -> &mut Self {
        self.master_capacity = value;
        self
    }

    /// Build the pair of shared master pools this configuration describes
    pub fn build_masters(&self) -> (Arc<MasterPool<ShiftBuf>>, Arc<MasterPool<ShiftBuf>>) {
        let small = MasterPool::new(
            self.master_capacity,
            Box::new(BufAllocator {
                capacity: self.small_capacity,
                left_padding: self.left_padding,
            }),
        );
        let large = MasterPool::new(
            self.master_capacity,
            Box::new(BufAllocator {
                capacity: self.large_capacity,
                left_padding: self.left_padding,
            }),
        );
        (small, large)
    }
}

struct BufAllocator {
    capacity: usize,
    left_padding: usize,
}

impl PoolAllocator<ShiftBuf> for BufAllocator {
    fn create(&self) -> ShiftBuf {
        ShiftBuf::with_padding(self.capacity, self.left_padding)
    }
}

/// A worker-local buffer recycler, size-classed and backed by master pools
///
/// `get_small`/`get_large` pop from the local free list and charge a batch
/// from the master pool only when it runs dry; `reuse` pushes back and
/// discharges a batch when the list overfills. A buffer obtained here may be
/// legally returned to any pool of the same size class — the master pools
/// mediate cross-thread traffic.
pub struct BufferPool {
    small: Vec<ShiftBuf>,
    large: Vec<ShiftBuf>,
    master_small: Arc<MasterPool<ShiftBuf>>,
    master_large: Arc<MasterPool<ShiftBuf>>,
    large_class_floor: usize,
    target: usize,
    taken: u64,
    returned: u64,
}

impl BufferPool {
    /// Create a pool charged from the given master pools
    pub fn new(
        master_small: Arc<MasterPool<ShiftBuf>>,
        master_large: Arc<MasterPool<ShiftBuf>>,
        config: &BufferConfig,
    ) -> Self {
        Self {
            small: Vec::with_capacity(config.local_target * 2),
            large: Vec::with_capacity(config.local_target * 2),
            master_small,
            master_large,
            large_class_floor: config.large_capacity,
            target: config.local_target,
            taken: 0,
            returned: 0,
        }
    }

    /// Take a small-class buffer
    pub fn get_small(&mut self) -> ShiftBuf {
        if self.small.is_empty() {
            self.master_small.acquire(&mut self.small, self.target / 2);
        }
        self.taken += 1;
        self.small.pop().unwrap()
    }

    /// Take a large-class buffer
    pub fn get_large(&mut self) -> ShiftBuf {
        if self.large.is_empty() {
            self.master_large.acquire(&mut self.large, self.target / 2);
        }
        self.taken += 1;
        self.large.pop().unwrap()
    }

    /// Return a buffer to whichever size class fits it
    pub fn reuse(&mut self, mut buf: ShiftBuf) {
        self.returned += 1;
        buf.reset();
        if buf.data_capacity() >= self.large_class_floor {
            self.large.push(buf);
            if self.large.len() > self.target * 2 {
                let at = self.large.len() - self.target;
                let mut surplus: Vec<_> = self.large.drain(at..).collect();
                self.master_large.release(&mut surplus);
            }
        } else {
            self.small.push(buf);
            if self.small.len() > self.target * 2 {
                let at = self.small.len() - self.target;
                let mut surplus: Vec<_> = self.small.drain(at..).collect();
                self.master_small.release(&mut surplus);
            }
        }
    }

    /// Buffers taken from this pool and not yet returned to one
    pub fn in_flight(&self) -> u64 {
        self.taken - self.returned
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.master_small.release(&mut self.small);
        self.master_large.release(&mut self.large);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        live: Arc<AtomicUsize>,
    }

    impl PoolAllocator<u32> for Counting {
        fn create(&self) -> u32 {
            self.live.fetch_add(1, Ordering::SeqCst);
            0
        }

        fn destroy(&self, _item: u32) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn acquire_never_fails() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = MasterPool::new(4, Box::new(Counting { live: live.clone() }));
        let mut out = Vec::new();
        pool.acquire(&mut out, 10);
        assert_eq!(out.len(), 10);
        assert_eq!(live.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn release_beyond_capacity_destroys_surplus() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = MasterPool::new(4, Box::new(Counting { live: live.clone() }));
        let mut out = Vec::new();
        pool.acquire(&mut out, 10);
        pool.release(&mut out);
        assert!(out.is_empty());
        assert_eq!(pool.len(), 4);
        assert_eq!(live.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn conservation_across_acquire_release_cycles() {
        let live = Arc::new(AtomicUsize::new(0));
        let pool = MasterPool::new(8, Box::new(Counting { live: live.clone() }));
        let mut held = Vec::new();
        for round in 1..=5 {
            pool.acquire(&mut held, round * 3);
            assert!(pool.len() <= pool.capacity());
            // created - destroyed accounts for everything in flight or shelved
            let outstanding = pool.created() - pool.destroyed();
            assert_eq!(outstanding as usize, held.len() + pool.len());
            pool.release(&mut held);
            let outstanding = pool.created() - pool.destroyed();
            assert_eq!(outstanding as usize, pool.len());
        }
        drop(pool);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn most_recently_released_comes_back_first() {
        struct Seq(AtomicUsize);
        impl PoolAllocator<usize> for Seq {
            fn create(&self) -> usize {
                self.0.fetch_add(1, Ordering::SeqCst)
            }
        }
        let pool = MasterPool::new(8, Box::new(Seq(AtomicUsize::new(0))));
        let mut items = Vec::new();
        pool.acquire(&mut items, 3);
        pool.release(&mut items); // shelved as [0, 1, 2]
        let mut out = Vec::new();
        pool.acquire(&mut out, 1);
        assert_eq!(out.pop(), Some(2));
    }

    #[test]
    fn buffer_pool_recycles_and_accounts() {
        let mut config = BufferConfig::default();
        config.local_target(4).master_capacity(16);
        let (small, large) = config.build_masters();
        let mut pool = BufferPool::new(small, large, &config);

        let a = pool.get_small();
        let b = pool.get_large();
        assert_eq!(pool.in_flight(), 2);
        pool.reuse(a);
        pool.reuse(b);
        assert_eq!(pool.in_flight(), 0);

        // a reused large-class buffer must come back out via get_large
        let c = pool.get_large();
        assert!(c.data_capacity() >= 16384);
        pool.reuse(c);
    }

    #[test]
    fn cross_pool_return_goes_through_master() {
        let mut config = BufferConfig::default();
        config.local_target(2).master_capacity(16);
        let (small, large) = config.build_masters();
        let mut a = BufferPool::new(small.clone(), large.clone(), &config);
        let mut b = BufferPool::new(small.clone(), large, &config);

        let buf = a.get_small();
        b.reuse(buf);
        drop(a);
        drop(b);
        // every buffer either sits on a master shelf or was destroyed
        assert_eq!(
            small.created() - small.destroyed(),
            small.len() as u64
        );
    }
}
