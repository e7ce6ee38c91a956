/*!
Bounded page caches for physical memory, page tables and paged memory.

Each cache table maps 4 KiB-aligned physical addresses to page contents.
A table is split into a fixed number of shards; each shard holds a small
bucket array plus an age list ordered most-recently-published first.
Eviction reclaims from the age tail, half a shard at a time, in
round-robin shard order.

Page buffers circulate through a per-table pool: `reserve` hands out an
unpublished page for the caller to fill, `publish` moves it into its
shard, and dropping the last reference to a page (shard eviction plus
all callers) posts the buffer back to the pool.
*/

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::types::{Address, PAGE_SIZE};

/// Number of shards per cache table.
pub const CACHE_REGIONS: usize = 17;
/// Number of buckets per shard.
pub const CACHE_BUCKETS: usize = 17;
/// Maximum number of page buffers a single table hands out.
pub const CACHE_MAX_ENTRIES: usize = 0x4000;
/// Reclaim never shrinks a shard below this count (unless total).
const CACHE_RECLAIM_FLOOR: usize = 0x10;

/// Identifies one of the three cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTag {
    /// Arbitrary physical pages.
    Phys,
    /// Verified page-table pages (not the CPU TLB).
    Tlb,
    /// Reconstructed paged-out pages.
    Paging,
}

#[inline]
fn shard_of(addr: Address) -> usize {
    (addr.page_number() % CACHE_REGIONS as u64) as usize
}

#[inline]
fn bucket_of(addr: Address) -> usize {
    (addr.page_number() % CACHE_BUCKETS as u64) as usize
}

/// Shared buffer pool of a cache table.
///
/// `total` counts every page buffer in circulation: pooled, published in
/// a shard, or held by a caller through a reserve or a page reference.
struct CachePool {
    empty: Mutex<Vec<Box<[u8]>>>,
    total: AtomicUsize,
    max_entries: usize,
    active: AtomicBool,
}

impl CachePool {
    fn release(&self, buf: Box<[u8]>) {
        if buf.len() != PAGE_SIZE {
            // buffer was moved out of the page before the drop
            return;
        }
        if !self.active.load(Ordering::Acquire) {
            self.total.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        self.empty.lock().unwrap().push(buf);
    }
}

/// A published cache page.
///
/// Immutable once published. The buffer returns to the owning table's
/// pool when the last reference (shard membership plus callers) drops.
pub struct CachePage {
    addr: Address,
    data: Box<[u8]>,
    pool: Weak<CachePool>,
}

impl CachePage {
    #[inline]
    pub fn addr(&self) -> Address {
        self.addr
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for CachePage {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.data);
        if let Some(pool) = self.pool.upgrade() {
            pool.release(buf);
        }
    }
}

/// An unpublished page obtained from [`CacheTable::reserve`].
///
/// The caller sets `addr`, fills the buffer and flips `valid`, then hands
/// the reserve to [`CacheTable::publish`]. Dropping an unpublished
/// reserve returns the buffer to the pool.
pub struct PageReserve {
    pub addr: Address,
    pub valid: bool,
    data: Box<[u8]>,
    pool: Weak<CachePool>,
}

impl PageReserve {
    #[inline]
    pub fn buf(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Moves the page buffer out, e.g. to back a scatter unit.
    ///
    /// The reserve must not be published until the buffer is restored.
    pub fn take_buf(&mut self) -> Box<[u8]> {
        mem::take(&mut self.data)
    }

    pub fn restore_buf(&mut self, buf: Box<[u8]>) {
        self.data = buf;
    }
}

impl Drop for PageReserve {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.data);
        if let Some(pool) = self.pool.upgrade() {
            pool.release(buf);
        }
    }
}

struct CacheShard {
    buckets: Vec<Vec<Arc<CachePage>>>,
    /// front = most recently published, back = eviction candidate.
    age: VecDeque<Arc<CachePage>>,
}

impl CacheShard {
    fn new() -> Self {
        Self {
            buckets: (0..CACHE_BUCKETS).map(|_| Vec::new()).collect(),
            age: VecDeque::new(),
        }
    }

    fn detach_from_bucket(&mut self, page: &Arc<CachePage>) {
        let bucket = &mut self.buckets[bucket_of(page.addr)];
        if let Some(pos) = bucket.iter().position(|p| Arc::ptr_eq(p, page)) {
            bucket.remove(pos);
        } else {
            warn!("cache page {:x} missing from its bucket", page.addr);
        }
    }
}

/// One cache table (see [`CacheTag`]).
pub struct CacheTable {
    tag: CacheTag,
    shards: Vec<Mutex<CacheShard>>,
    pool: Arc<CachePool>,
    reclaim_last: AtomicUsize,
}

impl CacheTable {
    pub fn new(tag: CacheTag) -> Self {
        Self::with_max_entries(tag, CACHE_MAX_ENTRIES)
    }

    pub(crate) fn with_max_entries(tag: CacheTag, max_entries: usize) -> Self {
        Self {
            tag,
            shards: (0..CACHE_REGIONS)
                .map(|_| Mutex::new(CacheShard::new()))
                .collect(),
            pool: Arc::new(CachePool {
                empty: Mutex::new(Vec::new()),
                total: AtomicUsize::new(0),
                max_entries,
                active: AtomicBool::new(true),
            }),
            reclaim_last: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn tag(&self) -> CacheTag {
        self.tag
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.pool.active.load(Ordering::Acquire)
    }

    /// Looks up a published page. Takes only the shard lock; bucket scan
    /// is linear and returns the most recently published match.
    pub fn get(&self, addr: Address) -> Option<Arc<CachePage>> {
        if !self.is_active() {
            return None;
        }
        let shard = self.shards[shard_of(addr)].lock().unwrap();
        shard.buckets[bucket_of(addr)]
            .iter()
            .find(|p| p.addr == addr)
            .cloned()
    }

    pub fn exists(&self, addr: Address) -> bool {
        self.get(addr).is_some()
    }

    /// Obtains an unpublished page buffer for the caller to fill.
    ///
    /// Pops the pool; below the table ceiling a fresh page is allocated
    /// instead. Under pressure half of a round-robin shard is reclaimed
    /// and the pop retried; after a full round of shards the thread
    /// logs, sleeps briefly and starts over. Returns `None` only during
    /// teardown.
    pub fn reserve(&self) -> Option<PageReserve> {
        let mut rounds = 0;
        loop {
            if !self.is_active() {
                return None;
            }
            if let Some(buf) = self.pool.empty.lock().unwrap().pop() {
                return Some(self.wrap_reserve(buf));
            }
            let total = self.pool.total.load(Ordering::Acquire);
            if total < self.pool.max_entries {
                if self
                    .pool
                    .total
                    .compare_exchange(total, total + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(self.wrap_reserve(vec![0u8; PAGE_SIZE].into_boxed_slice()));
                }
                continue;
            }
            let next = self.reclaim_last.fetch_add(1, Ordering::Relaxed);
            self.reclaim(next % CACHE_REGIONS, false);
            rounds += 1;
            if rounds == CACHE_REGIONS {
                warn!("cache {:?} drained of entries", self.tag);
                thread::sleep(Duration::from_millis(10));
                rounds = 0;
            }
        }
    }

    fn wrap_reserve(&self, buf: Box<[u8]>) -> PageReserve {
        PageReserve {
            addr: Address::INVALID,
            valid: false,
            data: buf,
            pool: Arc::downgrade(&self.pool),
        }
    }

    /// Publishes a filled reserve into its shard.
    ///
    /// Only valid pages with a valid address enter the table; anything
    /// else is released back to the pool. Returns the published page so
    /// the caller can keep using it without a second lookup.
    pub fn publish(&self, mut reserve: PageReserve) -> Option<Arc<CachePage>> {
        if !reserve.valid || !reserve.addr.is_valid() || !self.is_active() {
            return None;
        }
        let addr = reserve.addr;
        let page = Arc::new(CachePage {
            addr,
            data: reserve.take_buf(),
            pool: Arc::downgrade(&self.pool),
        });
        let mut shard = self.shards[shard_of(addr)].lock().unwrap();
        shard.buckets[bucket_of(addr)].insert(0, page.clone());
        shard.age.push_front(page.clone());
        Some(page)
    }

    /// Detaches and releases every entry matching `addr`.
    pub fn invalidate(&self, addr: Address) {
        if !self.is_active() {
            return;
        }
        let mut shard = self.shards[shard_of(addr)].lock().unwrap();
        let bucket = &mut shard.buckets[bucket_of(addr)];
        let mut removed = Vec::new();
        bucket.retain(|p| {
            if p.addr == addr {
                removed.push(p.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            shard
                .age
                .retain(|p| !removed.iter().any(|r| Arc::ptr_eq(p, r)));
        }
    }

    /// Reclaims a shard from the age tail.
    ///
    /// Stops when the shard is empty (`total`) or when its count has been
    /// halved, but never below the reclaim floor.
    pub(crate) fn reclaim(&self, shard_index: usize, total: bool) {
        let mut shard = self.shards[shard_index].lock().unwrap();
        let threshold = if total {
            0
        } else {
            std::cmp::max(CACHE_RECLAIM_FLOOR, shard.age.len() / 2)
        };
        while shard.age.len() > threshold {
            let page = match shard.age.pop_back() {
                Some(p) => p,
                None => {
                    warn!("cache {:?} age list empty during reclaim", self.tag);
                    break;
                }
            };
            shard.detach_from_bucket(&page);
        }
    }

    /// Reclaims every shard totally.
    pub fn clear(&self) {
        for i in 0..CACHE_REGIONS {
            self.reclaim(i, true);
        }
    }

    /// Marks the table inactive, reclaims all shards and drains the pool.
    ///
    /// Buffers still held by callers are destroyed as their references
    /// drop.
    pub fn close(&self) {
        if !self.pool.active.swap(false, Ordering::AcqRel) {
            return;
        }
        for i in 0..CACHE_REGIONS {
            self.reclaim(i, true);
        }
        let drained = {
            let mut empty = self.pool.empty.lock().unwrap();
            mem::take(&mut *empty)
        };
        self.pool.total.fetch_sub(drained.len(), Ordering::AcqRel);
    }

    /// Returns `(total, pooled, published)` buffer counts.
    ///
    /// At quiescence `total == pooled + published`.
    pub fn counts(&self) -> (usize, usize, usize) {
        let total = self.pool.total.load(Ordering::Acquire);
        let pooled = self.pool.empty.lock().unwrap().len();
        let published = self
            .shards
            .iter()
            .map(|s| s.lock().unwrap().age.len())
            .sum();
        (total, pooled, published)
    }

    /// Number of published entries in a single shard.
    #[cfg(test)]
    fn shard_len(&self, shard_index: usize) -> usize {
        self.shards[shard_index].lock().unwrap().age.len()
    }
}

impl Drop for CacheTable {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_page(table: &CacheTable, addr: u64, fill: u8) -> Arc<CachePage> {
        let mut reserve = table.reserve().unwrap();
        reserve.addr = Address::from(addr);
        reserve.buf_mut().iter_mut().for_each(|b| *b = fill);
        reserve.valid = true;
        table.publish(reserve).unwrap()
    }

    #[test]
    fn publish_get_roundtrip() {
        let table = CacheTable::new(CacheTag::Phys);
        publish_page(&table, 0x1000, 0xaa);
        let page = table.get(Address::from(0x1000u64)).unwrap();
        assert_eq!(page.addr(), Address::from(0x1000u64));
        assert!(page.data().iter().all(|&b| b == 0xaa));
        assert!(table.get(Address::from(0x2000u64)).is_none());
    }

    #[test]
    fn invalid_reserve_is_not_published() {
        let table = CacheTable::new(CacheTag::Phys);
        let mut reserve = table.reserve().unwrap();
        reserve.addr = Address::from(0x1000u64);
        // valid stays false
        assert!(table.publish(reserve).is_none());
        assert!(table.get(Address::from(0x1000u64)).is_none());
        let (total, pooled, published) = table.counts();
        assert_eq!(total, 1);
        assert_eq!(pooled, 1);
        assert_eq!(published, 0);
    }

    #[test]
    fn invalidate_until_reinsert() {
        let table = CacheTable::new(CacheTag::Phys);
        publish_page(&table, 0x5000, 1);
        table.invalidate(Address::from(0x5000u64));
        assert!(table.get(Address::from(0x5000u64)).is_none());
        // second invalidate is a no-op
        table.invalidate(Address::from(0x5000u64));
        assert!(table.get(Address::from(0x5000u64)).is_none());
        publish_page(&table, 0x5000, 2);
        assert_eq!(table.get(Address::from(0x5000u64)).unwrap().data()[0], 2);
    }

    #[test]
    fn duplicate_publish_returns_newest() {
        let table = CacheTable::new(CacheTag::Phys);
        publish_page(&table, 0x3000, 1);
        publish_page(&table, 0x3000, 2);
        assert_eq!(table.get(Address::from(0x3000u64)).unwrap().data()[0], 2);
        table.invalidate(Address::from(0x3000u64));
        assert!(table.get(Address::from(0x3000u64)).is_none());
    }

    #[test]
    fn count_conservation() {
        let table = CacheTable::new(CacheTag::Phys);
        let held: Vec<_> = (0..64)
            .map(|i| publish_page(&table, i * PAGE_SIZE as u64, i as u8))
            .collect();
        let (total, pooled, published) = table.counts();
        assert_eq!(total, 64);
        assert_eq!(published, 64);
        assert_eq!(pooled, 0);
        drop(held);
        table.clear();
        let (total, pooled, published) = table.counts();
        assert_eq!(total, 64);
        assert_eq!(pooled, 64);
        assert_eq!(published, 0);
    }

    #[test]
    fn shard_and_bucket_placement() {
        let table = CacheTable::new(CacheTag::Phys);
        for i in 0..100u64 {
            publish_page(&table, i * PAGE_SIZE as u64, 0);
        }
        for i in 0..100u64 {
            let addr = Address::from(i * PAGE_SIZE as u64);
            let shard = table.shards[shard_of(addr)].lock().unwrap();
            assert!(shard.buckets[bucket_of(addr)].iter().any(|p| p.addr == addr));
            assert!(shard.age.iter().any(|p| p.addr == addr));
        }
    }

    #[test]
    fn reclaim_halves_but_keeps_floor() {
        let table = CacheTable::new(CacheTag::Phys);
        // shard 0 receives pages whose page number is a multiple of 17
        let stride = (CACHE_REGIONS * PAGE_SIZE) as u64;
        for i in 0..64u64 {
            publish_page(&table, i * stride, 0);
        }
        assert_eq!(table.shard_len(0), 64);
        table.reclaim(0, false);
        assert_eq!(table.shard_len(0), 32);
        table.reclaim(0, false);
        assert_eq!(table.shard_len(0), CACHE_RECLAIM_FLOOR);
        // below the floor nothing is evicted
        table.reclaim(0, false);
        assert_eq!(table.shard_len(0), CACHE_RECLAIM_FLOOR);
        table.reclaim(0, true);
        assert_eq!(table.shard_len(0), 0);
    }

    #[test]
    fn eviction_is_lru_from_tail() {
        let table = CacheTable::new(CacheTag::Phys);
        let stride = (CACHE_REGIONS * PAGE_SIZE) as u64;
        for i in 0..40u64 {
            publish_page(&table, i * stride, 0);
        }
        table.reclaim(0, false);
        // oldest 20 evicted, newest 20 remain
        for i in 0..20u64 {
            assert!(table.get(Address::from(i * stride)).is_none());
        }
        for i in 20..40u64 {
            assert!(table.get(Address::from(i * stride)).is_some());
        }
    }

    #[test]
    fn reserve_under_pressure_reclaims() {
        let table = CacheTable::with_max_entries(CacheTag::Phys, 64);
        // all pages land in shard 0 so the halving reclaim can free some
        let stride = (CACHE_REGIONS * PAGE_SIZE) as u64;
        for i in 0..64u64 {
            publish_page(&table, i * stride, 0);
        }
        let (total, _, published) = table.counts();
        assert_eq!(total, 64);
        assert_eq!(published, 64);
        // table is at its ceiling; the next reserve must reclaim
        let reserve = table.reserve().unwrap();
        let (total, _, _) = table.counts();
        assert_eq!(total, 64);
        drop(reserve);
    }

    #[test]
    fn caller_reference_keeps_page_alive() {
        let table = CacheTable::new(CacheTag::Phys);
        let page = publish_page(&table, 0x7000, 7);
        table.clear();
        assert!(table.get(Address::from(0x7000u64)).is_none());
        // the caller still holds the page contents
        assert_eq!(page.data()[0], 7);
        let (_, pooled, _) = table.counts();
        assert_eq!(pooled, 0);
        drop(page);
        let (_, pooled, _) = table.counts();
        assert_eq!(pooled, 1);
    }

    #[test]
    fn close_drains_everything() {
        let table = CacheTable::new(CacheTag::Tlb);
        for i in 0..8u64 {
            publish_page(&table, i * PAGE_SIZE as u64, 0);
        }
        table.close();
        assert!(!table.is_active());
        assert!(table.reserve().is_none());
        assert!(table.get(Address::from(0u64)).is_none());
        let (total, pooled, published) = table.counts();
        assert_eq!((total, pooled, published), (0, 0, 0));
    }
}
