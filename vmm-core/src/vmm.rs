/*!
The engine context tying the caches, the scatter pipeline, the process
table and the worker pool together.

A [`Vmm`] is constructed once per analyzed target via [`VmmBuilder`] and
shared behind an [`Arc`]; all operations take `&self`. Teardown is
deterministic through [`Vmm::close`] (also invoked on drop).
*/

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::map::{NetMap, OsPlugin, PhysMemMap, UserMap};
use crate::mem::cache::{CachePage, CacheTable, CacheTag, PageReserve};
use crate::mem::device::MemDevice;
use crate::mem::scatter::MemScatter;
use crate::model::{MemoryModel, SystemType};
use crate::process::table::ProcessTable;
use crate::types::Address;
use crate::work::WorkPool;

bitflags! {
    /// Flags steering reads, writes and process lookups.
    ///
    /// Per-call flags are OR'd with the ambient flags of the context.
    pub struct VmmFlags: u64 {
        /// Do not use the cache for this call.
        const NOCACHE = 0x0001;
        /// Zero-fill failed pages within device bounds and mark them valid.
        const ZEROPAD_ON_FAIL = 0x0002;
        /// Serve only cache hits; never touch the device.
        const FORCECACHE_READ = 0x0008;
        /// Do not consult the paged-read hook on translation failure.
        const NOPAGING = 0x0010;
        /// Do not put fetched pages back into the cache.
        const NOCACHEPUT = 0x0100;
        /// The unit addresses are PTE values, not virtual addresses.
        const ALTADDR_VA_PTE = 0x0200;
        /// Include terminated processes in enumerations.
        const PROCESS_SHOW_TERMINATED = 0x0400;
        /// Force on-demand token initialization on process lookups.
        const PROCESS_TOKEN = 0x0800;
    }
}

/// Monotonic counters kept by the engine.
#[derive(Default)]
pub struct VmmStats {
    pub phys_read_success: AtomicU64,
    pub phys_read_fail: AtomicU64,
    pub phys_write: AtomicU64,
    pub phys_cache_hit: AtomicU64,
    pub tlb_cache_hit: AtomicU64,
    pub tlb_read_success: AtomicU64,
    pub tlb_read_fail: AtomicU64,
}

/// The engine context.
pub struct Vmm {
    pub(crate) device: Arc<dyn MemDevice>,
    pub(crate) model: Box<dyn MemoryModel>,
    pub(crate) os: Arc<dyn OsPlugin>,
    pub system: SystemType,
    pub flags: VmmFlags,
    pub stats: VmmStats,
    pub(crate) cache_phys: CacheTable,
    pub(crate) cache_tlb: CacheTable,
    pub(crate) cache_paging: CacheTable,
    pub(crate) processes: Mutex<Arc<ProcessTable>>,
    pub(crate) work: WorkPool,
    pub(crate) lock_master: Mutex<()>,
    pub(crate) lock_update_map: Mutex<()>,
    pub(crate) lock_update_module: Mutex<()>,
    pub(crate) map_physmem: Mutex<Option<Arc<PhysMemMap>>>,
    pub(crate) map_user: Mutex<Option<Arc<UserMap>>>,
    pub(crate) map_net: Mutex<Option<Arc<NetMap>>>,
    self_ref: Weak<Vmm>,
    closed: AtomicBool,
}

impl Vmm {
    /// Returns a new builder for an engine context.
    pub fn builder(device: Arc<dyn MemDevice>) -> VmmBuilder {
        VmmBuilder::new(device)
    }

    /// A strong handle to this context, used when handing work to the
    /// pool. `None` during teardown.
    pub(crate) fn handle(&self) -> Option<Arc<Vmm>> {
        self.self_ref.upgrade()
    }

    #[inline]
    pub(crate) fn cache(&self, tag: CacheTag) -> &CacheTable {
        match tag {
            CacheTag::Phys => &self.cache_phys,
            CacheTag::Tlb => &self.cache_tlb,
            CacheTag::Paging => &self.cache_paging,
        }
    }

    /// Cache lookup, shard lock only.
    pub fn cache_get(&self, tag: CacheTag, pa: Address) -> Option<Arc<CachePage>> {
        self.cache(tag).get(pa)
    }

    pub fn cache_exists(&self, tag: CacheTag, pa: Address) -> bool {
        self.cache(tag).exists(pa)
    }

    /// Obtains an unpublished page to fill; see [`CacheTable::reserve`].
    pub fn cache_reserve(&self, tag: CacheTag) -> Option<PageReserve> {
        self.cache(tag).reserve()
    }

    /// Publishes a filled reserve; see [`CacheTable::publish`].
    pub fn cache_publish(&self, tag: CacheTag, reserve: PageReserve) -> Option<Arc<CachePage>> {
        self.cache(tag).publish(reserve)
    }

    /// Invalidates a physical address in the Phys and Tlb tables.
    pub fn cache_invalidate(&self, pa: Address) {
        self.cache_tlb.invalidate(pa);
        self.cache_phys.invalidate(pa);
    }

    /// Clears a cache table entirely.
    ///
    /// Clearing the Tlb table also resets the tlb-spidered flag of every
    /// process, since their page-table walks are no longer cached.
    pub fn cache_clear(&self, tag: CacheTag) {
        self.cache(tag).clear();
        if tag == CacheTag::Tlb {
            let mut process = self.process_next(None, VmmFlags::PROCESS_SHOW_TERMINATED);
            while let Some(p) = process {
                if p.tlb_spidered() {
                    let _guard = p.lock_update();
                    p.set_tlb_spidered(false);
                }
                process = self.process_next(Some(p), VmmFlags::PROCESS_SHOW_TERMINATED);
            }
        }
    }

    /// Fetches a page preferring cache over device: `tag` table first,
    /// then the optional secondary table, then a single-page device read
    /// published into `tag`.
    pub(crate) fn cache_get_from_device_on_miss(
        &self,
        tag: CacheTag,
        secondary: Option<CacheTag>,
        pa: Address,
    ) -> Option<Arc<CachePage>> {
        if let Some(page) = self.cache(tag).get(pa) {
            return Some(page);
        }
        let mut reserve = self.cache(tag).reserve()?;
        reserve.addr = pa;
        if let Some(page) = secondary.and_then(|t| self.cache(t).get(pa)) {
            reserve.buf_mut().copy_from_slice(page.data());
            reserve.valid = true;
        }
        if !reserve.valid {
            let mut unit = MemScatter::owned(pa, reserve.take_buf());
            self.device.read_scatter(&mut [&mut unit]);
            let valid = unit.valid;
            if let Some(buf) = unit.into_owned_buf() {
                reserve.restore_buf(buf);
            }
            reserve.valid = valid;
        }
        self.cache(tag).publish(reserve)
    }

    /// True for addresses in the kernel half of the address space.
    pub(crate) fn is_kernel_address(&self, va: Address) -> bool {
        if self.system.is_32bit() {
            va.as_u64() & 0x8000_0000 != 0
        } else {
            va.as_u64() >> 47 == 0x1ffff
        }
    }

    /// Deterministic teardown: collaborator close hooks, worker pool
    /// shutdown, cache close, release of the process table and the
    /// system maps. Idempotent; also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.os.close();
        self.work.close();
        self.model.close();
        self.cache_phys.close();
        self.cache_tlb.close();
        self.cache_paging.close();
        *self.processes.lock().unwrap() = Arc::new(ProcessTable::empty());
        *self.map_physmem.lock().unwrap() = None;
        *self.map_user.lock().unwrap() = None;
        *self.map_net.lock().unwrap() = None;
    }
}

impl Drop for Vmm {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder for the engine context.
pub struct VmmBuilder {
    device: Arc<dyn MemDevice>,
    model: Option<Box<dyn MemoryModel>>,
    os: Option<Arc<dyn OsPlugin>>,
    system: SystemType,
    flags: VmmFlags,
    work_threads: usize,
}

impl VmmBuilder {
    pub fn new(device: Arc<dyn MemDevice>) -> Self {
        Self {
            device,
            model: None,
            os: None,
            system: SystemType::None,
            flags: VmmFlags::empty(),
            work_threads: crate::work::WORK_THREADPOOL_THREADS,
        }
    }

    /// Sets the system type; also selects the default memory model.
    pub fn system(mut self, system: SystemType) -> Self {
        self.system = system;
        self
    }

    /// Overrides the memory model collaborator.
    pub fn memory_model(mut self, model: Box<dyn MemoryModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Sets the OS-specific enumerator collaborator.
    pub fn os_plugin(mut self, os: Arc<dyn OsPlugin>) -> Self {
        self.os = Some(os);
        self
    }

    /// Sets the ambient flags OR'd into every call.
    pub fn flags(mut self, flags: VmmFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Number of worker pool threads.
    pub fn work_threads(mut self, threads: usize) -> Self {
        self.work_threads = threads;
        self
    }

    pub fn build(self) -> Result<Arc<Vmm>> {
        if self.work_threads == 0 {
            return Err(Error::Initialization("work_threads must be non-zero"));
        }
        let model = match self.model {
            Some(model) => model,
            None => self.system.default_model()?,
        };
        let os = self
            .os
            .unwrap_or_else(|| Arc::new(crate::map::NoOsPlugin) as Arc<dyn OsPlugin>);
        let device = self.device;
        let system = self.system;
        let flags = self.flags;
        let work_threads = self.work_threads;
        Ok(Arc::new_cyclic(|self_ref| Vmm {
            device,
            model,
            os,
            system,
            flags,
            stats: VmmStats::default(),
            cache_phys: CacheTable::new(CacheTag::Phys),
            cache_tlb: CacheTable::new(CacheTag::Tlb),
            cache_paging: CacheTable::new(CacheTag::Paging),
            processes: Mutex::new(Arc::new(ProcessTable::empty())),
            work: WorkPool::new(work_threads),
            lock_master: Mutex::new(()),
            lock_update_map: Mutex::new(()),
            lock_update_module: Mutex::new(()),
            map_physmem: Mutex::new(None),
            map_user: Mutex::new(None),
            map_net: Mutex::new(None),
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}
