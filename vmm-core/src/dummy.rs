/*!
In-memory acquisition device and address-space builder for tests and
examples.

`DummyDevice` backs the engine with a plain host buffer and counts
device round-trips, which the tests use to assert cache behavior.
`DummyMemory` builds 4-level x64 page tables inside that buffer so
virtual reads exercise the full translation path.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::{thread_rng, Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::mem::device::MemDevice;
use crate::mem::scatter::MemScatter;
use crate::model::x64::{PTE_ADDR_MASK, PTE_NX, PTE_PRESENT, PTE_USER, PTE_WRITE};
use crate::types::{Address, PAGE_SIZE};

/// An acquisition device backed by host memory.
pub struct DummyDevice {
    mem: RwLock<Vec<u8>>,
    /// Scatter read round-trips issued against the device.
    pub read_calls: AtomicU64,
    /// Scatter write round-trips issued against the device.
    pub write_calls: AtomicU64,
}

impl DummyDevice {
    pub fn new(size: usize) -> Self {
        Self {
            mem: RwLock::new(vec![0u8; size]),
            read_calls: AtomicU64::new(0),
            write_calls: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.mem.read().unwrap().len()
    }

    pub fn read_call_count(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn write_call_count(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Raw write bypassing the engine (test setup).
    pub fn phys_write_raw(&self, addr: Address, data: &[u8]) {
        let mut mem = self.mem.write().unwrap();
        let start = addr.as_usize();
        if start + data.len() <= mem.len() {
            mem[start..start + data.len()].copy_from_slice(data);
        }
    }

    /// Raw read bypassing the engine (test assertions).
    pub fn phys_read_raw(&self, addr: Address, out: &mut [u8]) {
        let mem = self.mem.read().unwrap();
        let start = addr.as_usize();
        if start + out.len() <= mem.len() {
            out.copy_from_slice(&mem[start..start + out.len()]);
        }
    }

    fn peek_u64(&self, addr: Address) -> u64 {
        let mut raw = [0u8; 8];
        self.phys_read_raw(addr, &mut raw);
        u64::from_le_bytes(raw)
    }

    fn poke_u64(&self, addr: Address, value: u64) {
        self.phys_write_raw(addr, &value.to_le_bytes());
    }
}

impl MemDevice for DummyDevice {
    fn read_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let mem = self.mem.read().unwrap();
        for unit in mems.iter_mut() {
            if unit.valid || !unit.addr.is_valid() {
                continue;
            }
            let start = unit.addr.as_usize();
            let end = match start.checked_add(unit.len()) {
                Some(end) if end <= mem.len() => end,
                _ => continue,
            };
            unit.buf_mut().copy_from_slice(&mem[start..end]);
            unit.valid = true;
        }
    }

    fn write_scatter(&self, mems: &mut [&mut MemScatter<'_>]) {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut mem = self.mem.write().unwrap();
        for unit in mems.iter_mut() {
            if unit.valid || !unit.addr.is_valid() {
                continue;
            }
            let start = unit.addr.as_usize();
            let end = match start.checked_add(unit.len()) {
                Some(end) if end <= mem.len() => end,
                _ => continue,
            };
            mem[start..end].copy_from_slice(unit.buf());
            unit.valid = true;
        }
    }

    fn pa_max(&self) -> Address {
        Address::from(self.size())
    }
}

/// Builds x64 address spaces inside a [`DummyDevice`].
///
/// Page-table pages are allocated from the top of physical memory
/// downward, data pages from a low watermark upward, so the two never
/// collide.
pub struct DummyMemory {
    device: Arc<DummyDevice>,
    next_pt_page: u64,
    next_data_page: u64,
    rng: XorShiftRng,
}

impl DummyMemory {
    pub fn new(size: usize) -> Self {
        Self::with_rng(size, SeedableRng::from_rng(thread_rng()).unwrap())
    }

    pub fn with_seed(size: usize, seed: u64) -> Self {
        Self::with_rng(size, SeedableRng::seed_from_u64(seed))
    }

    fn with_rng(size: usize, rng: XorShiftRng) -> Self {
        assert!(size >= 32 * PAGE_SIZE);
        Self {
            device: Arc::new(DummyDevice::new(size)),
            next_pt_page: (size - PAGE_SIZE) as u64,
            next_data_page: 0x10000,
            rng,
        }
    }

    pub fn device(&self) -> Arc<DummyDevice> {
        self.device.clone()
    }

    /// Allocates a zeroed page-table page.
    pub fn alloc_pt_page(&mut self) -> Address {
        let pa = self.next_pt_page;
        self.next_pt_page -= PAGE_SIZE as u64;
        Address::from(pa)
    }

    /// Allocates a data page.
    pub fn alloc_data_page(&mut self) -> Address {
        let pa = self.next_data_page;
        self.next_data_page += PAGE_SIZE as u64;
        Address::from(pa)
    }

    /// A page-aligned user-space base address away from the low ranges.
    pub fn random_virt_base(&mut self) -> u64 {
        self.rng.gen_range(0x0001_0000_0000u64, 0x0000_7ff0_0000_0000u64) & !0x1f_ffff
    }

    /// Allocates a directory table base carrying the self-referencing
    /// entry the x64 verifier demands.
    pub fn alloc_dtb(&mut self) -> Address {
        let dtb = self.alloc_pt_page();
        self.device
            .poke_u64(dtb + 510usize * 8, dtb.as_u64() | PTE_PRESENT | PTE_WRITE);
        dtb
    }

    /// Maps a single 4 KiB page, creating intermediate tables on demand.
    pub fn map_page(&mut self, dtb: Address, va: u64, pa: Address, user: bool, write: bool, nx: bool) {
        let mut table = dtb;
        for level in (2..=4).rev() {
            let shift = 12 + 9 * (level - 1);
            let index = ((va >> shift) & 0x1ff) as usize;
            let entry_addr = table + index * 8;
            let mut entry = self.device.peek_u64(entry_addr);
            if entry & PTE_PRESENT == 0 {
                let next = self.alloc_pt_page();
                entry = next.as_u64() | PTE_PRESENT | PTE_WRITE;
                if user {
                    entry |= PTE_USER;
                }
                self.device.poke_u64(entry_addr, entry);
            } else if user && entry & PTE_USER == 0 {
                self.device.poke_u64(entry_addr, entry | PTE_USER);
                entry |= PTE_USER;
            }
            table = Address::from(entry & PTE_ADDR_MASK);
        }
        let index = ((va >> 12) & 0x1ff) as usize;
        let mut leaf = pa.as_u64() | PTE_PRESENT;
        if write {
            leaf |= PTE_WRITE;
        }
        if user {
            leaf |= PTE_USER;
        }
        if nx {
            leaf |= PTE_NX;
        }
        self.device.poke_u64(table + index * 8, leaf);
    }

    /// Maps `data` (padded to whole pages) at `va`, allocating and
    /// filling fresh data pages. Returns the number of pages mapped.
    pub fn map_range(&mut self, dtb: Address, va: u64, data: &[u8], user: bool) -> usize {
        let mut mapped = 0;
        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            let pa = self.alloc_data_page();
            self.device.phys_write_raw(pa, chunk);
            self.map_page(dtb, va + (i * PAGE_SIZE) as u64, pa, user, true, false);
            mapped += 1;
        }
        mapped
    }

    /// Builds a fresh address space mapping `data` at `va` and returns
    /// its directory table base.
    pub fn alloc_address_space(&mut self, va: u64, data: &[u8], user: bool) -> Address {
        let dtb = self.alloc_dtb();
        self.map_range(dtb, va, data, user);
        dtb
    }
}
