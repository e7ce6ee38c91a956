/*!
Page-table page acquisition and cache warming.

The Tlb cache holds verified page-table pages keyed by physical address
(not the CPU TLB). For a single address the order is Tlb cache, Phys
cache, device; batches consume cached entries before touching the
device, and a speculative miss never displaces a successful read.
*/

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::mem::cache::{CachePage, CacheTag};
use crate::mem::scatter::MemScatter;
use crate::process::Process;
use crate::types::{Address, PAGE_SIZE};
use crate::vmm::{Vmm, VmmFlags};

/// Maximum page-table pages fetched per prefetch round.
const TLB_PREFETCH_MAX_PAGES: usize = 0x2000;

impl Vmm {
    /// Retrieves a page-table page for a physical address.
    ///
    /// On a cache miss (unless `cache_only`) the page is fetched through
    /// the Phys cache or the device, published into the Tlb table and
    /// structurally verified by the memory model; pages failing
    /// verification are released and not returned.
    pub fn tlb_page_table(&self, pa: Address, cache_only: bool) -> Option<Arc<CachePage>> {
        let pa = pa.page_align();
        if let Some(page) = self.cache_tlb.get(pa) {
            self.stats.tlb_cache_hit.fetch_add(1, Ordering::Relaxed);
            return Some(page);
        }
        if cache_only {
            return None;
        }
        let page = match self.cache_get_from_device_on_miss(CacheTag::Tlb, Some(CacheTag::Phys), pa)
        {
            Some(page) => page,
            None => {
                self.stats.tlb_read_fail.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        self.stats.tlb_read_success.fetch_add(1, Ordering::Relaxed);
        if self.model.verify_page_table(self, page.data(), pa, false) {
            Some(page)
        } else {
            None
        }
    }

    /// Prefetches a set of page-table pages into the Tlb cache.
    ///
    /// Batches device reads in rounds of at most `0x2000` pages, runs
    /// the page-table verifier on each result and publishes only pages
    /// passing verification.
    pub fn tlb_prefetch(&self, addrs: &[Address]) {
        for round in addrs.chunks(TLB_PREFETCH_MAX_PAGES) {
            let mut reserves = Vec::with_capacity(round.len());
            let mut units = Vec::with_capacity(round.len());
            for &pa in round {
                if let Some(mut reserve) = self.cache_tlb.reserve() {
                    reserve.addr = pa.page_align();
                    units.push(MemScatter::owned(reserve.addr, reserve.take_buf()));
                    reserves.push(reserve);
                }
            }
            if units.is_empty() {
                continue;
            }
            {
                let mut io: Vec<&mut MemScatter<'_>> = units.iter_mut().collect();
                self.device.read_scatter(&mut io);
            }
            for (mut reserve, unit) in reserves.into_iter().zip(units.into_iter()) {
                let addr = reserve.addr;
                let valid = unit.valid && self.model.verify_page_table(self, unit.buf(), addr, false);
                if let Some(buf) = unit.into_owned_buf() {
                    reserve.restore_buf(buf);
                }
                reserve.valid = valid;
                self.cache_tlb.publish(reserve);
            }
        }
    }

    /// Warms the caches with a set of addresses, each spanning
    /// `bytes_per_item` bytes (0 is treated as a single page).
    ///
    /// Items are page aligned, expanded over their spans, deduplicated
    /// and read in one scatter call whose only purpose is the cache
    /// publish on the way back. No-op when caching is disabled.
    pub fn prefetch<I>(
        &self,
        process: Option<&Process>,
        addrs: I,
        bytes_per_item: usize,
        flags: VmmFlags,
    ) where
        I: IntoIterator<Item = Address>,
    {
        if (flags | self.flags).contains(VmmFlags::NOCACHE) {
            return;
        }
        let span = std::cmp::max(bytes_per_item, 1);
        let mut pages = BTreeSet::new();
        for addr in addrs {
            if addr.is_null() || !addr.is_valid() {
                continue;
            }
            let first = addr.page_align().as_u64();
            let last = (addr + (span - 1)).page_align().as_u64();
            let mut page = first;
            loop {
                pages.insert(page);
                if page >= last {
                    break;
                }
                page += PAGE_SIZE as u64;
            }
        }
        if pages.is_empty() {
            return;
        }
        let mut units: Vec<MemScatter<'_>> = pages
            .into_iter()
            .map(|pa| MemScatter::alloc_page(Address::from(pa)))
            .collect();
        match process {
            Some(process) => self.read_scatter_virtual(process, &mut units, flags),
            None => self.read_scatter_physical(&mut units, flags),
        }
    }
}
