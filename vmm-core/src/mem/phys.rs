/*!
Physical side of the scatter pipeline.

Reads consult the Phys cache first, expand small requests with
speculative neighbor pages, issue a single device round-trip for the
remainder and publish what came back. Writes pass through to the device
and invalidate written pages in the Phys and Tlb caches.
*/

use std::sync::atomic::Ordering;

use crate::mem::cache::PageReserve;
use crate::mem::scatter::MemScatter;
use crate::types::{Address, PAGE_SIZE};
use crate::vmm::{Vmm, VmmFlags};

/// Upper bound of units taking part in one speculatively expanded read.
const SPECULATIVE_MAX: usize = 0x18;

// unit classes threaded through the aux stack during a physical read
const CLASS_NORMAL: u64 = 1;
const CLASS_CACHE_HIT: u64 = 2;
const CLASS_ALREADY_VALID: u64 = 3;
const CLASS_SPECULATIVE: u64 = 4;

impl Vmm {
    /// Batched physical read.
    ///
    /// Phase A probes the cache and classifies units; if everything is
    /// serviced, or `FORCECACHE_READ` is set, no device I/O happens.
    /// Phase B pads small requests with speculative pages continuing
    /// after the last original unclassified unit (speculative entries
    /// never anchor further speculation). Phase C is a single device
    /// scatter call. Phase D counts results and applies
    /// `ZEROPAD_ON_FAIL` within device bounds. Phase E publishes fetched
    /// pages unless `NOCACHEPUT` is set.
    pub fn read_scatter_physical<'a>(&self, mems: &mut [MemScatter<'a>], flags: VmmFlags) {
        let flags = flags | self.flags;
        let use_cache = !flags.contains(VmmFlags::NOCACHE);
        let pa_max = self.device.pa_max();
        let mut finished = 0usize;
        let mut normal = 0usize;
        let mut last_normal_addr = Address::INVALID;

        // phase A: cache probe
        if use_cache {
            for mem in mems.iter_mut() {
                if mem.valid {
                    mem.stack_push(CLASS_ALREADY_VALID);
                    finished += 1;
                    continue;
                }
                if mem.len() == PAGE_SIZE {
                    if let Some(page) = self.cache_phys.get(mem.addr) {
                        mem.buf_mut().copy_from_slice(page.data());
                        mem.valid = true;
                        mem.stack_push(CLASS_CACHE_HIT);
                        self.stats.phys_cache_hit.fetch_add(1, Ordering::Relaxed);
                        finished += 1;
                        continue;
                    }
                }
                mem.stack_push(CLASS_NORMAL);
                if normal < SPECULATIVE_MAX {
                    last_normal_addr = mem.addr;
                }
                normal += 1;
            }
            if finished == mems.len() || flags.contains(VmmFlags::FORCECACHE_READ) {
                for mem in mems.iter_mut() {
                    mem.stack_pop();
                }
                return;
            }
        }

        // phase B: speculative expansion
        let expand = use_cache && normal > 0 && normal < SPECULATIVE_MAX;
        let mut spec_reserves: Vec<PageReserve> = Vec::new();
        let mut spec_units: Vec<MemScatter<'a>> = Vec::new();
        if expand {
            // units not taking part in the device round are done; balance
            // their stacks now
            for mem in mems.iter_mut() {
                if mem.stack_peek(1) != CLASS_NORMAL {
                    mem.stack_pop();
                }
            }
            let mut next = last_normal_addr.page_align() + PAGE_SIZE;
            while normal + spec_units.len() < SPECULATIVE_MAX {
                match self.cache_phys.reserve() {
                    Some(mut reserve) => {
                        reserve.addr = next;
                        let mut unit = MemScatter::owned(next, reserve.take_buf());
                        unit.stack_push(CLASS_SPECULATIVE);
                        spec_units.push(unit);
                        spec_reserves.push(reserve);
                        next = next + PAGE_SIZE;
                    }
                    None => break,
                }
            }
        }

        {
            let mut io: Vec<&mut MemScatter<'a>> = if expand {
                mems.iter_mut()
                    .filter(|m| m.stack_peek(1) == CLASS_NORMAL)
                    .chain(spec_units.iter_mut())
                    .collect()
            } else {
                mems.iter_mut().collect()
            };

            // phase C: device round-trip
            self.device.read_scatter(&mut io);

            // phase D: statistics and zero pad
            for mem in io.iter_mut() {
                if mem.valid {
                    self.stats.phys_read_success.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.phys_read_fail.fetch_add(1, Ordering::Relaxed);
                    if flags.contains(VmmFlags::ZEROPAD_ON_FAIL) && mem.addr < pa_max {
                        mem.buf_mut().iter_mut().for_each(|b| *b = 0);
                        mem.valid = true;
                    }
                }
            }

            // phase E: cache put of fetched pages
            if use_cache {
                for mem in io.iter_mut() {
                    let class = mem.stack_pop();
                    if flags.contains(VmmFlags::NOCACHEPUT) {
                        continue;
                    }
                    if class == CLASS_NORMAL && mem.valid && mem.len() == PAGE_SIZE {
                        if let Some(mut reserve) = self.cache_phys.reserve() {
                            reserve.addr = mem.addr;
                            reserve.buf_mut().copy_from_slice(mem.buf());
                            reserve.valid = true;
                            self.cache_phys.publish(reserve);
                        }
                    }
                }
            }
        }

        // publish speculative pages as observed; invalid ones return
        // their buffer to the pool
        for (mut reserve, unit) in spec_reserves.into_iter().zip(spec_units.into_iter()) {
            let valid = unit.valid;
            if let Some(buf) = unit.into_owned_buf() {
                reserve.restore_buf(buf);
            }
            reserve.valid = valid;
            if !flags.contains(VmmFlags::NOCACHEPUT) {
                self.cache_phys.publish(reserve);
            }
        }
    }

    /// Batched physical write: device pass-through, then cache
    /// invalidation of every successfully written page. Invalidation
    /// happens-after the device write returns.
    pub fn write_scatter_physical(&self, mems: &mut [MemScatter<'_>]) {
        {
            let mut io: Vec<&mut MemScatter<'_>> = mems.iter_mut().collect();
            self.device.write_scatter(&mut io);
        }
        for mem in mems.iter() {
            self.stats.phys_write.fetch_add(1, Ordering::Relaxed);
            if mem.valid && mem.addr.is_valid() {
                self.cache_invalidate(mem.addr.page_align());
            }
        }
    }
}
