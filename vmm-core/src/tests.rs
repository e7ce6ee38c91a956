//! End-to-end tests driving the engine against the in-memory device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::dummy::{DummyDevice, DummyMemory};
use crate::map::{
    HandleMap, HeapMap, ModuleEntry, ModuleMap, OsPlugin, PhysMemMap, PteEntry, ThreadMap,
    UserMap, VadMap,
};
use crate::mem::cache::CacheTag;
use crate::model::SystemType;
use crate::process::table::TokenOffsets;
use crate::process::Process;
use crate::types::{size, Address, PAGE_SIZE};
use crate::vmm::{Vmm, VmmFlags};
use crate::map::NetMap;

fn test_vmm(device: Arc<DummyDevice>) -> Arc<Vmm> {
    Vmm::builder(device)
        .system(SystemType::X64)
        .work_threads(8)
        .build()
        .unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn phys_read_populates_cache_and_speculates() {
    let device = Arc::new(DummyDevice::new(size::mb(4)));
    let data = pattern(PAGE_SIZE, 1);
    device.phys_write_raw(Address::from(0x4000u64), &data);
    let vmm = test_vmm(device.clone());

    let mut out = vec![0u8; PAGE_SIZE];
    assert_eq!(
        vmm.read_ex(None, Address::from(0x4000u64), &mut out, VmmFlags::empty()),
        PAGE_SIZE
    );
    assert_eq!(out, data);
    assert_eq!(device.read_call_count(), 1);

    // same page again: served from cache
    assert_eq!(
        vmm.read_ex(None, Address::from(0x4000u64), &mut out, VmmFlags::empty()),
        PAGE_SIZE
    );
    assert_eq!(device.read_call_count(), 1);

    // neighbor pages were read speculatively in the same round-trip
    assert_eq!(
        vmm.read_ex(None, Address::from(0x5000u64), &mut out, VmmFlags::empty()),
        PAGE_SIZE
    );
    assert_eq!(device.read_call_count(), 1);
    vmm.close();
}

#[test]
fn forcecache_read_never_touches_device() {
    let device = Arc::new(DummyDevice::new(size::mb(1)));
    let vmm = test_vmm(device.clone());
    let mut out = vec![0u8; PAGE_SIZE];
    let read = vmm.read_ex(
        None,
        Address::from(0x3000u64),
        &mut out,
        VmmFlags::FORCECACHE_READ,
    );
    assert_eq!(read, 0);
    assert_eq!(device.read_call_count(), 0);

    // warm the cache, then force-cache reads succeed without I/O
    vmm.read_ex(None, Address::from(0x3000u64), &mut out, VmmFlags::empty());
    let calls = device.read_call_count();
    let read = vmm.read_ex(
        None,
        Address::from(0x3000u64),
        &mut out,
        VmmFlags::FORCECACHE_READ,
    );
    assert_eq!(read, PAGE_SIZE);
    assert_eq!(device.read_call_count(), calls);
    vmm.close();
}

#[test]
fn nocache_skips_cache_entirely() {
    let device = Arc::new(DummyDevice::new(size::mb(1)));
    let vmm = test_vmm(device.clone());
    let mut out = vec![0u8; PAGE_SIZE];
    vmm.read_ex(None, Address::from(0x2000u64), &mut out, VmmFlags::NOCACHE);
    assert!(!vmm.cache_exists(CacheTag::Phys, Address::from(0x2000u64)));
    vmm.read_ex(None, Address::from(0x2000u64), &mut out, VmmFlags::NOCACHE);
    assert_eq!(device.read_call_count(), 2);
    vmm.close();
}

#[test]
fn read_crossing_device_bound_is_partial() {
    let device = Arc::new(DummyDevice::new(size::mb(1)));
    let top = size::mb(1) as u64;
    let data = pattern(0x1800, 3);
    device.phys_write_raw(Address::from(top - 0x1800), &data);
    let vmm = test_vmm(device.clone());

    // spans four pages, the last two beyond the device
    let mut out = vec![0xffu8; 0x3000];
    let read = vmm.read_ex(
        None,
        Address::from(top - 0x1800),
        &mut out,
        VmmFlags::ZEROPAD_ON_FAIL,
    );
    assert_eq!(read, 0x1800);
    assert_eq!(&out[..0x1800], &data[..]);
    // failed tail is zero filled in the output buffer
    assert!(out[0x1800..].iter().all(|&b| b == 0));
    vmm.close();
}

#[test]
fn write_invalidates_written_pages() {
    let device = Arc::new(DummyDevice::new(size::mb(1)));
    let vmm = test_vmm(device.clone());

    let addr = Address::from(0x12000u64);
    let mut out = vec![0u8; PAGE_SIZE];
    vmm.read_ex(None, addr, &mut out, VmmFlags::empty());
    assert!(vmm.cache_exists(CacheTag::Phys, addr));
    let calls = device.read_call_count();

    // an 8 byte write at 0x12340 invalidates page 0x12000
    vmm.write(None, Address::from(0x12340u64), &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();
    assert_eq!(device.write_call_count(), 1);
    assert!(!vmm.cache_exists(CacheTag::Phys, addr));

    // the next read goes back to the device and sees the new bytes
    vmm.read_ex(None, addr, &mut out, VmmFlags::empty());
    assert!(device.read_call_count() > calls);
    assert_eq!(&out[0x340..0x348], &[1, 2, 3, 4, 5, 6, 7, 8]);
    vmm.close();
}

#[test]
fn phys_roundtrip_read_after_write() {
    let device = Arc::new(DummyDevice::new(size::mb(1)));
    let vmm = test_vmm(device);
    let data = pattern(100, 9);
    vmm.write(None, Address::from(0x8123u64), &data).unwrap();
    let mut out = vec![0u8; 100];
    vmm.read(None, Address::from(0x8123u64), &mut out).unwrap();
    assert_eq!(out, data);
    vmm.close();
}

#[test]
fn tlb_prefetch_rejects_unverifiable_pages() {
    let mut dummy = DummyMemory::with_seed(size::mb(4), 1);
    // two legitimate page-table pages
    let dtb1 = dummy.alloc_dtb();
    let dtb2 = dummy.alloc_dtb();
    // two garbage pages that cannot be page tables
    let garbage1 = Address::from(0x20000u64);
    let garbage2 = Address::from(0x21000u64);
    let junk = vec![0xffu8; PAGE_SIZE];
    dummy.device().phys_write_raw(garbage1, &junk);
    dummy.device().phys_write_raw(garbage2, &junk);

    let device = dummy.device();
    let vmm = test_vmm(device.clone());
    let calls = device.read_call_count();
    vmm.tlb_prefetch(&[dtb1, dtb2, garbage1, garbage2]);
    assert_eq!(device.read_call_count(), calls + 1);
    assert!(vmm.cache_exists(CacheTag::Tlb, dtb1));
    assert!(vmm.cache_exists(CacheTag::Tlb, dtb2));
    assert!(!vmm.cache_exists(CacheTag::Tlb, garbage1));
    assert!(!vmm.cache_exists(CacheTag::Tlb, garbage2));
    vmm.close();
}

fn spawn_process(
    dummy: &mut DummyMemory,
    vmm: &Arc<Vmm>,
    pid: u32,
    va: u64,
    data: &[u8],
) -> Arc<Process> {
    let dtb = dummy.alloc_address_space(va, data, true);
    let process = vmm
        .process_create_entry(false, pid, 4, 0, dtb, Address::NULL, "test.exe", true, &[])
        .unwrap();
    vmm.process_create_finish();
    process
}

#[test]
fn virtual_read_through_page_tables() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 2);
    let device = dummy.device();
    let vmm = test_vmm(device.clone());

    let va = dummy.random_virt_base();
    let data = pattern(3 * PAGE_SIZE, 5);
    let process = spawn_process(&mut dummy, &vmm, 100, va, &data);

    // cold read: page tables and data come from the device
    let mut out = vec![0u8; data.len()];
    assert_eq!(
        vmm.read_ex(Some(&process), Address::from(va), &mut out, VmmFlags::empty()),
        data.len()
    );
    assert_eq!(out, data);

    // warm read: everything is cached, zero further device round-trips
    let calls = device.read_call_count();
    let mut out2 = vec![0u8; data.len()];
    assert_eq!(
        vmm.read_ex(Some(&process), Address::from(va), &mut out2, VmmFlags::empty()),
        data.len()
    );
    assert_eq!(out2, data);
    assert_eq!(device.read_call_count(), calls);
    vmm.close();
}

#[test]
fn virtual_read_unmapped_is_zero_filled() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 3);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let data = pattern(PAGE_SIZE, 7);
    let process = spawn_process(&mut dummy, &vmm, 100, va, &data);

    // one mapped page followed by an unmapped one
    let mut out = vec![0xaau8; 2 * PAGE_SIZE];
    let read = vmm.read_ex(
        Some(&process),
        Address::from(va),
        &mut out,
        VmmFlags::ZEROPAD_ON_FAIL,
    );
    assert_eq!(read, PAGE_SIZE);
    assert_eq!(&out[..PAGE_SIZE], &data[..]);
    assert!(out[PAGE_SIZE..].iter().all(|&b| b == 0));
    vmm.close();
}

#[test]
fn virtual_write_roundtrip() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 4);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let process = spawn_process(&mut dummy, &vmm, 100, va, &pattern(PAGE_SIZE, 0));

    let data = pattern(200, 11);
    vmm.write(Some(&process), Address::from(va + 0x123), &data)
        .unwrap();
    let mut out = vec![0u8; 200];
    vmm.read(Some(&process), Address::from(va + 0x123), &mut out)
        .unwrap();
    assert_eq!(out, data);
    vmm.close();
}

#[test]
fn user_process_cannot_see_kernel_pages_but_kernel_view_can() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 5);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let dtb = dummy.alloc_address_space(va, &pattern(PAGE_SIZE, 1), true);

    // a supervisor page in the same address space
    let kva = 0xffff_8000_0040_0000u64;
    let kdata = pattern(PAGE_SIZE, 13);
    let kpa = dummy.alloc_data_page();
    dummy.device().phys_write_raw(kpa, &kdata);
    dummy.map_page(dtb, kva, kpa, false, true, false);

    let process = vmm
        .process_create_entry(false, 100, 4, 0, dtb, Address::NULL, "test.exe", true, &[])
        .unwrap();
    vmm.process_create_finish();

    let mut out = vec![0u8; 32];
    assert!(vmm.read(Some(&process), Address::from(kva), &mut out).is_err());

    let kernel = process.kernel_view().unwrap();
    vmm.read(Some(&kernel), Address::from(kva), &mut out).unwrap();
    assert_eq!(&out[..], &kdata[..32]);
    vmm.close();
}

#[test]
fn generational_refresh_identity_and_persistence() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 6);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let dtb = dummy.alloc_address_space(va, &pattern(PAGE_SIZE, 2), true);

    let first = vmm
        .process_create_entry(false, 100, 4, 0, dtb, Address::NULL, "proc", true, &[])
        .unwrap();
    vmm.process_create_finish();
    assert!(Arc::ptr_eq(&vmm.process(100).unwrap(), &first));

    // next generation: pid 100 carried forward, pid 200 newly staged
    let carried = vmm
        .process_create_entry(false, 100, 4, 0, dtb, Address::NULL, "proc", true, &[])
        .unwrap();
    assert!(Arc::ptr_eq(&carried, &first));
    let staged = vmm
        .process_create_entry(false, 200, 4, 0, dtb, Address::NULL, "other", true, &[])
        .unwrap();
    // duplicate staging of the same pid is rejected
    assert!(vmm
        .process_create_entry(false, 200, 4, 0, dtb, Address::NULL, "other", true, &[])
        .is_none());
    // not visible until commit
    assert!(vmm.process(200).is_none());
    vmm.process_create_finish();
    assert!(Arc::ptr_eq(&vmm.process(200).unwrap(), &staged));
    assert!(Arc::ptr_eq(&vmm.process(100).unwrap(), &first));

    // total refresh produces a fresh object but keeps the persistent
    // per-pid state; processes not re-staged vanish
    let refreshed = vmm
        .process_create_entry(true, 100, 4, 0, dtb, Address::NULL, "proc", true, &[])
        .unwrap();
    assert!(!Arc::ptr_eq(&refreshed, &first));
    assert!(Arc::ptr_eq(refreshed.persistent(), first.persistent()));
    vmm.process_create_finish();
    assert!(Arc::ptr_eq(&vmm.process(100).unwrap(), &refreshed));
    assert!(vmm.process(200).is_none());
    vmm.close();
}

#[test]
fn process_enumeration_skips_terminated() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 7);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let dtb = dummy.alloc_address_space(va, &pattern(PAGE_SIZE, 2), true);

    vmm.process_create_entry(false, 10, 4, 0, dtb, Address::NULL, "alive", true, &[])
        .unwrap();
    // terminated processes skip DTB verification
    vmm.process_create_entry(false, 20, 4, 1, Address::NULL, Address::NULL, "dead", true, &[])
        .unwrap();
    vmm.process_create_entry(false, 30, 4, 0, dtb, Address::NULL, "alive2", true, &[])
        .unwrap();
    vmm.process_create_finish();

    let active = vmm.process_list(VmmFlags::empty());
    assert_eq!(active.len(), 2);
    assert!(!active.contains(&20));
    let all = vmm.process_list(VmmFlags::PROCESS_SHOW_TERMINATED);
    assert_eq!(all.len(), 3);
    assert_eq!(vmm.process_count(VmmFlags::empty()), 2);
    assert_eq!(vmm.process_count(VmmFlags::PROCESS_SHOW_TERMINATED), 3);

    let mut seen = Vec::new();
    let mut process = vmm.process_next(None, VmmFlags::empty());
    while let Some(p) = process {
        seen.push(p.pid);
        process = vmm.process_next(Some(p), VmmFlags::empty());
    }
    assert_eq!(seen, vec![30, 10]);
    vmm.close();
}

#[test]
fn rejects_process_with_garbage_dtb() {
    let dummy = DummyMemory::with_seed(size::mb(8), 8);
    let vmm = test_vmm(dummy.device());
    let garbage = Address::from(0x13000u64);
    dummy
        .device()
        .phys_write_raw(garbage, &vec![0xffu8; PAGE_SIZE]);
    assert!(vmm
        .process_create_entry(false, 100, 4, 0, garbage, Address::NULL, "bad", true, &[])
        .is_none());
    vmm.close();
}

#[test]
fn foreach_parallel_visits_every_process_once() {
    let mut dummy = DummyMemory::with_seed(size::mb(16), 9);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let dtb = dummy.alloc_address_space(va, &pattern(PAGE_SIZE, 2), true);
    for pid in 1..=100u32 {
        vmm.process_create_entry(false, pid, 4, 0, dtb, Address::NULL, "proc", true, &[])
            .unwrap();
    }
    vmm.process_create_finish();

    let visited = Arc::new(Mutex::new(Vec::new()));
    {
        let visited = visited.clone();
        vmm.process_foreach_parallel(Some(&crate::work::criteria_active_only), move |_vmm, p| {
            visited.lock().unwrap().push(p.pid);
        });
    }
    let mut pids = visited.lock().unwrap().clone();
    pids.sort_unstable();
    assert_eq!(pids, (1..=100).collect::<Vec<_>>());
    vmm.close();
}

#[test]
fn tlb_clear_resets_spidered_flags() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 10);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let process = spawn_process(&mut dummy, &vmm, 100, va, &pattern(PAGE_SIZE, 2));

    // building the pte map spiders the page tables
    let map = vmm.map_pte(&process, false).unwrap();
    assert!(map
        .find_entry(Address::from(va))
        .map(|e| e.pages >= 1)
        .unwrap_or(false));
    assert!(process.tlb_spidered());

    vmm.cache_clear(CacheTag::Tlb);
    assert!(!process.tlb_spidered());
    assert!(!vmm.cache_exists(CacheTag::Tlb, process.dtb));
    vmm.close();
}

#[test]
fn phys2virt_finds_mapping() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 11);
    let vmm = test_vmm(dummy.device());
    let va = dummy.random_virt_base();
    let process = spawn_process(&mut dummy, &vmm, 100, va, &pattern(PAGE_SIZE, 2));

    let pa = vmm
        .model
        .virt_to_phys(&vmm, &process, Address::from(va + 0x123))
        .unwrap();
    let info = vmm.phys2virt_information(&process, pa);
    assert_eq!(info.pa_target, pa);
    assert!(info.vas.contains(&Address::from(va + 0x123)));
    // the result is memoized for the sticky target
    let again = vmm.phys2virt_information(&process, Address::NULL);
    assert!(Arc::ptr_eq(&info, &again));
    vmm.close();
}

/// OS plugin stub counting initializer invocations.
#[derive(Default)]
struct StubOs {
    module_inits: AtomicU64,
}

impl OsPlugin for StubOs {
    fn init_module_map(&self, _vmm: &Vmm, _process: &Process) -> Option<ModuleMap> {
        self.module_inits.fetch_add(1, Ordering::SeqCst);
        Some(ModuleMap::new(vec![ModuleEntry {
            base: Address::from(0x7ff0_0000u64),
            image_size: 0x1000,
            entry_point: Address::NULL,
            name: "stub.dll".to_string(),
        }]))
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
    fn init_pte_text(&self, _vmm: &Vmm, _process: &Process, entries: &mut [PteEntry]) -> bool {
        for entry in entries.iter_mut() {
            entry.tag = Some("stub".to_string());
        }
        true
    }
    fn init_physmem_map(&self, _vmm: &Vmm) -> Option<PhysMemMap> {
        Some(PhysMemMap {
            entries: Vec::new(),
        })
    }
    fn init_user_map(&self, _vmm: &Vmm) -> Option<UserMap> {
        None
    }
    fn init_net_map(&self, _vmm: &Vmm) -> Option<NetMap> {
        None
    }
    fn token_offsets(&self) -> Option<TokenOffsets> {
        Some(TokenOffsets {
            eprocess_token: 8,
            token_id: 0x10,
            session_id: 0x18,
            user_and_groups: 0x28,
        })
    }
}

#[test]
fn map_accessors_memoize() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 12);
    let os = Arc::new(StubOs::default());
    let vmm = Vmm::builder(dummy.device())
        .system(SystemType::X64)
        .os_plugin(os.clone())
        .work_threads(4)
        .build()
        .unwrap();
    let va = dummy.random_virt_base();
    let process = spawn_process(&mut dummy, &vmm, 100, va, &pattern(PAGE_SIZE, 2));

    let first = vmm.map_module(&process).unwrap();
    let second = vmm.map_module(&process).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(os.module_inits.load(Ordering::SeqCst), 1);
    assert!(first.find_entry("STUB.DLL").is_some());

    // maps the plugin cannot provide stay unpublished
    assert!(vmm.map_vad(&process, false).is_none());
    assert!(vmm.map_user().is_none());
    assert!(vmm.map_physmem().is_some());

    // pte map upgrade with extended text keeps entries
    let pte = vmm.map_pte(&process, false).unwrap();
    assert!(!pte.is_extended());
    let extended = vmm.map_pte(&process, true).unwrap();
    assert!(extended.is_extended());
    assert_eq!(pte.entries().len(), extended.entries().len());
    assert!(extended.entries().iter().all(|e| e.tag.is_some()));
    vmm.close();
}

#[test]
fn token_initialization_in_batched_passes() {
    let mut dummy = DummyMemory::with_seed(size::mb(8), 13);
    let os = Arc::new(StubOs::default());
    let vmm = Vmm::builder(dummy.device())
        .system(SystemType::X64)
        .os_plugin(os)
        .work_threads(4)
        .build()
        .unwrap();

    // kernel page holding the token object, the user-and-groups array
    // and the SID
    let kbase = 0xffff_8000_0010_0000u64;
    let kpa = dummy.alloc_data_page();
    let device = dummy.device();

    // token body at +0x160 (16-byte aligned), preceded by a 0x5c byte
    // object header carrying the pool tag
    let token_va = kbase + 0x160;
    device.phys_write_raw(kpa + 0x114usize, b"Toke");
    device.phys_write_raw(kpa + 0x170usize, &0xdead_beefu64.to_le_bytes());
    device.phys_write_raw(kpa + 0x178usize, &2u32.to_le_bytes());
    // user-and-groups pointer -> sid pointer -> sid
    device.phys_write_raw(kpa + 0x188usize, &(kbase + 0x200).to_le_bytes());
    device.phys_write_raw(kpa + 0x200usize, &(kbase + 0x300).to_le_bytes());
    let mut sid = vec![1u8, 2, 0, 0, 0, 0, 0, 5];
    sid.extend_from_slice(&32u32.to_le_bytes());
    sid.extend_from_slice(&544u32.to_le_bytes());
    device.phys_write_raw(kpa + 0x300usize, &sid);

    // system process (pid 4) owning the kernel mapping
    let uva = dummy.random_virt_base();
    let sys_dtb = dummy.alloc_address_space(uva, &pattern(PAGE_SIZE, 1), false);
    dummy.map_page(sys_dtb, kbase, kpa, false, true, false);
    let mut eprocess = vec![0u8; 0x20];
    eprocess[8..16].copy_from_slice(&token_va.to_le_bytes());
    vmm.process_create_entry(false, 4, 0, 0, sys_dtb, Address::NULL, "System", false, &eprocess)
        .unwrap();
    // a second process sharing the same token
    vmm.process_create_entry(
        false,
        100,
        4,
        0,
        sys_dtb,
        Address::NULL,
        "proc",
        false,
        &eprocess,
    )
    .unwrap();
    vmm.process_create_finish();

    let process = vmm.process_get(100, VmmFlags::PROCESS_TOKEN).unwrap();
    assert!(process.token_initialized());
    let token = process.token();
    assert_eq!(token.luid, 0xdead_beef);
    assert_eq!(token.session_id, 2);
    assert!(token.sid_valid);
    assert_eq!(token.sid_string.as_deref(), Some("S-1-5-32-544"));

    // the table-wide pass initialized the system process too
    assert!(vmm.process(4).unwrap().token_initialized());
    vmm.close();
}

#[test]
fn close_is_idempotent_and_disables_caches() {
    let device = Arc::new(DummyDevice::new(size::mb(1)));
    let vmm = test_vmm(device);
    let mut out = vec![0u8; 16];
    vmm.read_ex(None, Address::from(0x1000u64), &mut out, VmmFlags::empty());
    vmm.close();
    vmm.close();
    assert!(vmm.cache_reserve(CacheTag::Phys).is_none());
    assert!(vmm.process(4).is_none());
}
