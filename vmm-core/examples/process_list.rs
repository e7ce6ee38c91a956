/// Builds a tiny synthetic x64 target in memory, registers a few
/// processes and walks the process table, reading the first bytes of
/// each process image through the translation pipeline.
use vmm_core::dummy::DummyMemory;
use vmm_core::model::SystemType;
use vmm_core::types::{size, Address, PAGE_SIZE};
use vmm_core::vmm::{Vmm, VmmFlags};

fn main() {
    simple_logger::init_with_level(log::Level::Info).unwrap();

    let mut dummy = DummyMemory::new(size::mb(16));
    let vmm = Vmm::builder(dummy.device())
        .system(SystemType::X64)
        .build()
        .unwrap();

    let mut bases = Vec::new();
    for (pid, name) in [(4u32, "System"), (432, "winlogon.exe"), (1337, "notepad.exe")].iter() {
        let va = dummy.random_virt_base();
        let image: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i as u8) ^ (*pid as u8)).collect();
        let dtb = dummy.alloc_address_space(va, &image, *pid != 4);
        vmm.process_create_entry(false, *pid, 4, 0, dtb, Address::NULL, name, *pid != 4, &[])
            .expect("staging process");
        bases.push((*pid, va));
    }
    vmm.process_create_finish();

    let mut process = vmm.process_next(None, VmmFlags::empty());
    while let Some(p) = process {
        let va = bases
            .iter()
            .find(|(pid, _)| *pid == p.pid)
            .map(|(_, va)| *va)
            .unwrap_or_default();
        let mut head = [0u8; 16];
        vmm.read(Some(&p), Address::from(va), &mut head)
            .expect("image read");
        println!(
            "{:>6} {:<16} dtb={:x} va={:x} head={:02x?}",
            p.pid, p.name, p.dtb, va, head
        );
        process = vmm.process_next(Some(p), VmmFlags::empty());
    }

    let stats = &vmm.stats;
    println!(
        "reads: {} ok / {} failed, cache hits: {}",
        stats
            .phys_read_success
            .load(std::sync::atomic::Ordering::Relaxed),
        stats
            .phys_read_fail
            .load(std::sync::atomic::Ordering::Relaxed),
        stats
            .phys_cache_hit
            .load(std::sync::atomic::Ordering::Relaxed),
    );
    vmm.close();
}
