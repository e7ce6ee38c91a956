/*!
Semantic maps: lazily initialized, immutable-once-published views of a
process (modules, VADs, threads, handles, heaps, page-table entries)
and of the system (physical memory, users, network).

Per-process maps are published on the process object under its update
lock; system maps live in container cells on the context. Entry lookups
binary search address-sorted entry arrays, modules additionally through
a side array sorted by upper-cased basename hash.
*/

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::process::table::TokenOffsets;
use crate::process::{Pid, Process};
use crate::types::Address;
use crate::vmm::Vmm;

/// Result cap of a phys2virt search.
pub const PHYS2VIRT_MAX_RESULTS: usize = 4;

/// One run of page-table entries with identical protection.
#[derive(Debug, Clone)]
pub struct PteEntry {
    pub va_base: Address,
    /// Number of 4 KiB pages in the run.
    pub pages: u64,
    /// Raw protection bits (write/user/nx subset of the PTE).
    pub flags: u64,
    /// Optional extended text (module backing etc).
    pub tag: Option<String>,
}

impl PteEntry {
    #[inline]
    pub fn va_end(&self) -> Address {
        self.va_base + (self.pages << 12)
    }
}

/// Flattened, deduplicated view of a process's page tables.
pub struct PteMap {
    entries: Vec<PteEntry>,
    extended: bool,
}

impl PteMap {
    pub(crate) fn new(mut entries: Vec<PteEntry>, extended: bool) -> Self {
        entries.sort_by_key(|e| e.va_base);
        Self { entries, extended }
    }

    pub fn entries(&self) -> &[PteEntry] {
        &self.entries
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Finds the entry whose run contains `va`.
    pub fn find_entry(&self, va: Address) -> Option<&PteEntry> {
        find_by_range(&self.entries, va, |e| e.va_base, |e| e.va_end())
    }
}

/// A committed virtual address range of a process.
#[derive(Debug, Clone)]
pub struct VadEntry {
    pub va_start: Address,
    /// Inclusive end of the range.
    pub va_end: Address,
    pub protection: u32,
    pub image: bool,
    pub text: String,
}

pub struct VadMap {
    entries: Vec<VadEntry>,
}

impl VadMap {
    pub fn new(mut entries: Vec<VadEntry>) -> Self {
        entries.sort_by_key(|e| e.va_start);
        Self { entries }
    }

    pub fn entries(&self) -> &[VadEntry] {
        &self.entries
    }

    pub fn find_entry(&self, va: Address) -> Option<&VadEntry> {
        find_by_range(&self.entries, va, |e| e.va_start, |e| e.va_end + 1u64)
    }
}

#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub tid: u32,
    pub va_ethread: Address,
    pub va_start_address: Address,
    pub state: u32,
}

pub struct ThreadMap {
    entries: Vec<ThreadEntry>,
}

impl ThreadMap {
    pub fn new(mut entries: Vec<ThreadEntry>) -> Self {
        entries.sort_by_key(|e| e.tid);
        Self { entries }
    }

    pub fn entries(&self) -> &[ThreadEntry] {
        &self.entries
    }

    pub fn find_entry(&self, tid: u32) -> Option<&ThreadEntry> {
        self.entries
            .binary_search_by_key(&tid, |e| e.tid)
            .ok()
            .map(|i| &self.entries[i])
    }
}

#[derive(Debug, Clone)]
pub struct ModuleEntry {
    pub base: Address,
    pub image_size: usize,
    pub entry_point: Address,
    pub name: String,
}

/// Loaded modules of a process with a hash-sorted name lookup table.
pub struct ModuleMap {
    entries: Vec<ModuleEntry>,
    /// `(hash of upper-cased basename, index into entries)` sorted by hash.
    hash_lookup: Vec<(u32, u32)>,
}

impl ModuleMap {
    pub fn new(mut entries: Vec<ModuleEntry>) -> Self {
        entries.sort_by_key(|e| e.base);
        let mut hash_lookup: Vec<(u32, u32)> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (hash_name_upper(&e.name), i as u32))
            .collect();
        hash_lookup.sort_unstable();
        Self {
            entries,
            hash_lookup,
        }
    }

    pub fn entries(&self) -> &[ModuleEntry] {
        &self.entries
    }

    /// Finds a module by (case-insensitive) basename.
    pub fn find_entry(&self, name: &str) -> Option<&ModuleEntry> {
        let hash = hash_name_upper(name);
        let mut i = self
            .hash_lookup
            .binary_search_by_key(&hash, |&(h, _)| h)
            .ok()?;
        // rewind over equal hashes, then compare names to rule out collisions
        while i > 0 && self.hash_lookup[i - 1].0 == hash {
            i -= 1;
        }
        self.hash_lookup[i..]
            .iter()
            .take_while(|&&(h, _)| h == hash)
            .map(|&(_, idx)| &self.entries[idx as usize])
            .find(|e| e.name.eq_ignore_ascii_case(name) || basename(&e.name).eq_ignore_ascii_case(basename(name)))
    }

    /// Finds the module containing `va`.
    pub fn find_entry_by_va(&self, va: Address) -> Option<&ModuleEntry> {
        find_by_range(&self.entries, va, |e| e.base, |e| e.base + e.image_size)
    }
}

#[derive(Debug, Clone)]
pub struct HandleEntry {
    pub handle_id: u32,
    pub va_object: Address,
    pub access: u32,
    pub type_name: String,
    pub text: String,
}

pub struct HandleMap {
    entries: Vec<HandleEntry>,
}

impl HandleMap {
    pub fn new(mut entries: Vec<HandleEntry>) -> Self {
        entries.sort_by_key(|e| e.handle_id);
        Self { entries }
    }

    pub fn entries(&self) -> &[HandleEntry] {
        &self.entries
    }

    pub fn find_entry(&self, handle_id: u32) -> Option<&HandleEntry> {
        self.entries
            .binary_search_by_key(&handle_id, |e| e.handle_id)
            .ok()
            .map(|i| &self.entries[i])
    }
}

#[derive(Debug, Clone)]
pub struct HeapEntry {
    pub va: Address,
    pub index: u32,
    pub primary: bool,
}

pub struct HeapMap {
    entries: Vec<HeapEntry>,
}

impl HeapMap {
    pub fn new(mut entries: Vec<HeapEntry>) -> Self {
        entries.sort_by_key(|e| e.va);
        Self { entries }
    }

    pub fn entries(&self) -> &[HeapEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone)]
pub struct PhysMemEntry {
    pub base: Address,
    pub size: u64,
}

pub struct PhysMemMap {
    pub entries: Vec<PhysMemEntry>,
}

#[derive(Debug, Clone)]
pub struct UserEntry {
    pub name: String,
    pub sid: String,
    pub va_reg_hive: Address,
}

pub struct UserMap {
    pub entries: Vec<UserEntry>,
}

#[derive(Debug, Clone)]
pub struct NetEntry {
    pub pid: Pid,
    pub protocol: String,
    pub state: String,
    pub src: String,
    pub dst: String,
}

pub struct NetMap {
    pub entries: Vec<NetEntry>,
}

/// Virtual addresses mapping a targeted physical address.
#[derive(Debug, Clone)]
pub struct Phys2VirtInformation {
    pub pa_target: Address,
    pub pid: Pid,
    pub vas: Vec<Address>,
}

/// Binary search over an address-sorted entry array by half-open range.
fn find_by_range<T>(
    entries: &[T],
    va: Address,
    start: impl Fn(&T) -> Address,
    end: impl Fn(&T) -> Address,
) -> Option<&T> {
    let mut lo = 0usize;
    let mut hi = entries.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let entry = &entries[mid];
        if va < start(entry) {
            hi = mid;
        } else if va >= end(entry) {
            lo = mid + 1;
        } else {
            return Some(entry);
        }
    }
    None
}

fn basename(path: &str) -> &str {
    path.rsplit(|c| c == '\\' || c == '/').next().unwrap_or(path)
}

/// Rolling hash over the upper-cased basename, used by the module name
/// lookup table.
pub fn hash_name_upper(name: &str) -> u32 {
    basename(name)
        .bytes()
        .map(|b| b.to_ascii_uppercase())
        .fold(0u32, |h, b| {
            h.rotate_right(13).wrapping_add(u32::from(b))
        })
}

/// OS-specific enumerator collaborator populating the semantic maps.
///
/// Initializers run under the owning process's update lock (the thread
/// map under its own sub-lock) and return `None` on failure; the
/// accessor then stays unpublished and retries on the next call.
pub trait OsPlugin: Send + Sync {
    fn init_module_map(&self, vmm: &Vmm, process: &Process) -> Option<ModuleMap>;
    fn init_vad_map(&self, vmm: &Vmm, process: &Process, extended: bool) -> Option<VadMap>;
    fn init_thread_map(&self, vmm: &Vmm, process: &Process) -> Option<ThreadMap>;
    fn init_handle_map(&self, vmm: &Vmm, process: &Process, extended: bool) -> Option<HandleMap>;
    fn init_heap_map(&self, vmm: &Vmm, process: &Process) -> Option<HeapMap>;

    /// Fills the extended text of an already-built PTE map.
    fn init_pte_text(&self, vmm: &Vmm, process: &Process, entries: &mut [PteEntry]) -> bool;

    fn init_physmem_map(&self, vmm: &Vmm) -> Option<PhysMemMap>;
    fn init_user_map(&self, vmm: &Vmm) -> Option<UserMap>;
    fn init_net_map(&self, vmm: &Vmm) -> Option<NetMap>;

    /// Offsets for on-demand token initialization, if known.
    fn token_offsets(&self) -> Option<TokenOffsets> {
        None
    }

    fn close(&self) {}
}

/// Plugin used when no OS layer has been attached; enumerates nothing.
pub struct NoOsPlugin;

impl OsPlugin for NoOsPlugin {
    fn init_module_map(&self, _vmm: &Vmm, _process: &Process) -> Option<ModuleMap> {
        None
    }
    fn init_vad_map(&self, _vmm: &Vmm, _process: &Process, _extended: bool) -> Option<VadMap> {
        None
    }
    fn init_thread_map(&self, _vmm: &Vmm, _process: &Process) -> Option<ThreadMap> {
        None
    }
    fn init_handle_map(&self, _vmm: &Vmm, _process: &Process, _extended: bool) -> Option<HandleMap> {
        None
    }
    fn init_heap_map(&self, _vmm: &Vmm, _process: &Process) -> Option<HeapMap> {
        None
    }
    fn init_pte_text(&self, _vmm: &Vmm, _process: &Process, _entries: &mut [PteEntry]) -> bool {
        false
    }
    fn init_physmem_map(&self, _vmm: &Vmm) -> Option<PhysMemMap> {
        None
    }
    fn init_user_map(&self, _vmm: &Vmm) -> Option<UserMap> {
        None
    }
    fn init_net_map(&self, _vmm: &Vmm) -> Option<NetMap> {
        None
    }
}

macro_rules! published_or_init {
    ($slot:expr, $lock:expr, $init:expr) => {{
        if let Some(map) = $slot.lock().unwrap().clone() {
            return Some(map);
        }
        let _guard = $lock;
        if let Some(map) = $slot.lock().unwrap().clone() {
            return Some(map);
        }
        let map = Arc::new($init?);
        *$slot.lock().unwrap() = Some(map.clone());
        Some(map)
    }};
}

impl Vmm {
    /// Module map of a process, initialized on first access.
    pub fn map_module(&self, process: &Process) -> Option<Arc<ModuleMap>> {
        published_or_init!(
            process.maps.module,
            process.lock_update(),
            self.os.init_module_map(self, process)
        )
    }

    /// VAD map of a process.
    pub fn map_vad(&self, process: &Process, extended: bool) -> Option<Arc<VadMap>> {
        published_or_init!(
            process.maps.vad,
            process.lock_update(),
            self.os.init_vad_map(self, process, extended)
        )
    }

    /// Thread map of a process; population runs under its own sub-lock
    /// so it does not stall other map initializers.
    pub fn map_thread(&self, process: &Process) -> Option<Arc<ThreadMap>> {
        published_or_init!(
            process.maps.thread,
            process.maps.lock_thread.lock().unwrap(),
            self.os.init_thread_map(self, process)
        )
    }

    /// Starts asynchronous thread map population on the worker pool.
    ///
    /// Useful ahead of time for processes with large thread counts; a
    /// later [`Vmm::map_thread`] call then finds the map published.
    pub fn map_thread_async(&self, process: &Arc<Process>) {
        let vmm = match self.handle() {
            Some(vmm) => vmm,
            None => return,
        };
        let process = Arc::clone(process);
        self.work.submit(
            move || {
                vmm.map_thread(&process);
            },
            None,
        );
    }

    /// Handle map of a process.
    pub fn map_handle(&self, process: &Process, extended: bool) -> Option<Arc<HandleMap>> {
        published_or_init!(
            process.maps.handle,
            process.lock_update(),
            self.os.init_handle_map(self, process, extended)
        )
    }

    /// Heap map of a process.
    pub fn map_heap(&self, process: &Process) -> Option<Arc<HeapMap>> {
        published_or_init!(
            process.maps.heap,
            process.lock_update(),
            self.os.init_heap_map(self, process)
        )
    }

    /// PTE map of a process, built by the memory model; `extended`
    /// upgrades a published map with per-entry text.
    pub fn map_pte(&self, process: &Process, extended: bool) -> Option<Arc<PteMap>> {
        let published = process.maps.pte.lock().unwrap().clone();
        let map = match published {
            Some(map) => map,
            None => {
                let _guard = process.lock_update();
                let retry = process.maps.pte.lock().unwrap().clone();
                match retry {
                    Some(map) => map,
                    None => {
                        let entries = self.model.pte_map_initialize(self, process)?;
                        let map = Arc::new(PteMap::new(entries, false));
                        *process.maps.pte.lock().unwrap() = Some(map.clone());
                        map
                    }
                }
            }
        };
        if !extended || map.is_extended() {
            return Some(map);
        }
        let _guard = process.maps.lock_extended.lock().unwrap();
        let current = process.maps.pte.lock().unwrap().clone();
        if let Some(map) = &current {
            if map.is_extended() {
                return current;
            }
        }
        let mut entries = map.entries().to_vec();
        if !self.os.init_pte_text(self, process, &mut entries) {
            return Some(map);
        }
        let upgraded = Arc::new(PteMap::new(entries, true));
        *process.maps.pte.lock().unwrap() = Some(upgraded.clone());
        Some(upgraded)
    }

    /// System-wide physical memory map.
    pub fn map_physmem(&self) -> Option<Arc<PhysMemMap>> {
        published_or_init!(
            self.map_physmem,
            self.lock_update_map.lock().unwrap(),
            self.os.init_physmem_map(self)
        )
    }

    /// System-wide user map.
    pub fn map_user(&self) -> Option<Arc<UserMap>> {
        published_or_init!(
            self.map_user,
            self.lock_update_map.lock().unwrap(),
            self.os.init_user_map(self)
        )
    }

    /// System-wide network connection map.
    pub fn map_net(&self) -> Option<Arc<NetMap>> {
        published_or_init!(
            self.map_net,
            self.lock_update_module.lock().unwrap(),
            self.os.init_net_map(self)
        )
    }

    /// Physical-to-virtual information for a process.
    ///
    /// A non-null `pa_target` replaces the sticky per-PID target kept on
    /// the persistent sub-object; a null target reuses it. The result is
    /// published on the process and recomputed only when the target
    /// changes.
    pub fn phys2virt_information(
        &self,
        process: &Arc<Process>,
        pa_target: Address,
    ) -> Arc<Phys2VirtInformation> {
        let target = if pa_target.is_null() {
            Address::from(process.persistent.phys2virt_target.load(Ordering::Acquire))
        } else {
            process
                .persistent
                .phys2virt_target
                .store(pa_target.as_u64(), Ordering::Release);
            pa_target
        };
        if let Some(info) = process.phys2virt.lock().unwrap().clone() {
            if target.is_null() || info.pa_target == target {
                return info;
            }
        }
        let _guard = process.lock_update();
        if let Some(info) = process.phys2virt.lock().unwrap().clone() {
            if target.is_null() || info.pa_target == target {
                return info;
            }
        }
        let mut info = Phys2VirtInformation {
            pa_target: target,
            pid: process.pid,
            vas: Vec::new(),
        };
        if !target.is_null() {
            self.model.phys_to_virt_information(self, process, &mut info);
        }
        let info = Arc::new(info);
        *process.phys2virt.lock().unwrap() = Some(info.clone());
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_map_range_lookup() {
        let map = PteMap::new(
            vec![
                PteEntry {
                    va_base: Address::from(0x1000u64),
                    pages: 2,
                    flags: 0,
                    tag: None,
                },
                PteEntry {
                    va_base: Address::from(0x10000u64),
                    pages: 1,
                    flags: 0,
                    tag: None,
                },
            ],
            false,
        );
        assert_eq!(
            map.find_entry(Address::from(0x2fffu64)).unwrap().va_base,
            Address::from(0x1000u64)
        );
        assert!(map.find_entry(Address::from(0x3000u64)).is_none());
        assert!(map.find_entry(Address::from(0x10aaau64)).is_some());
        assert!(map.find_entry(Address::from(0xfffu64)).is_none());
    }

    #[test]
    fn vad_map_inclusive_end() {
        let map = VadMap::new(vec![VadEntry {
            va_start: Address::from(0x7000_0000u64),
            va_end: Address::from(0x7000_ffffu64),
            protection: 0,
            image: false,
            text: String::new(),
        }]);
        assert!(map.find_entry(Address::from(0x7000_ffffu64)).is_some());
        assert!(map.find_entry(Address::from(0x7001_0000u64)).is_none());
    }

    #[test]
    fn thread_map_by_tid() {
        let map = ThreadMap::new(vec![
            ThreadEntry {
                tid: 8,
                va_ethread: Address::NULL,
                va_start_address: Address::NULL,
                state: 0,
            },
            ThreadEntry {
                tid: 4,
                va_ethread: Address::NULL,
                va_start_address: Address::NULL,
                state: 0,
            },
        ]);
        assert_eq!(map.find_entry(4).unwrap().tid, 4);
        assert_eq!(map.find_entry(8).unwrap().tid, 8);
        assert!(map.find_entry(12).is_none());
    }

    #[test]
    fn module_lookup_by_name_hash() {
        let map = ModuleMap::new(vec![
            ModuleEntry {
                base: Address::from(0x7ff0_0000u64),
                image_size: 0x10000,
                entry_point: Address::NULL,
                name: "ntdll.dll".to_string(),
            },
            ModuleEntry {
                base: Address::from(0x7fe0_0000u64),
                image_size: 0x20000,
                entry_point: Address::NULL,
                name: "kernel32.dll".to_string(),
            },
        ]);
        assert_eq!(
            map.find_entry("NTDLL.DLL").unwrap().base,
            Address::from(0x7ff0_0000u64)
        );
        assert_eq!(
            map.find_entry("C:\\Windows\\System32\\kernel32.dll")
                .unwrap()
                .base,
            Address::from(0x7fe0_0000u64)
        );
        assert!(map.find_entry("missing.dll").is_none());
        assert_eq!(
            map.find_entry_by_va(Address::from(0x7ff0_8000u64))
                .unwrap()
                .name,
            "ntdll.dll"
        );
    }
}
