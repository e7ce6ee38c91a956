/*!
Software walker for 4-level x64 long-mode page tables.

All table pages are fetched through the engine's Tlb cache, so a full
walk of a process doubles as a TLB spider.
*/

use super::{MemoryModel, PagedReadResult};
use crate::map::{Phys2VirtInformation, PteEntry, PHYS2VIRT_MAX_RESULTS};
use crate::process::Process;
use crate::types::{Address, PAGE_SIZE};
use crate::vmm::{Vmm, VmmFlags};

pub const PTE_PRESENT: u64 = 0x0000_0000_0000_0001;
pub const PTE_WRITE: u64 = 0x0000_0000_0000_0002;
pub const PTE_USER: u64 = 0x0000_0000_0000_0004;
pub const PTE_PS: u64 = 0x0000_0000_0000_0080;
pub const PTE_NX: u64 = 0x8000_0000_0000_0000;
pub const PTE_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

const PT_ENTRIES: usize = 512;
/// Present entries pointing outside the device before a page stops
/// looking like a page table.
const VERIFY_MAX_BAD: usize = 0x10;

#[inline]
fn pte_at(page: &[u8], index: usize) -> u64 {
    let offset = index * 8;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn is_canonical(va: u64) -> bool {
    let sign = va >> 47;
    sign == 0 || sign == 0x1_ffff
}

/// Memory model for x64 long mode targets.
pub struct X64Model;

impl X64Model {
    fn pte_walk(
        &self,
        vmm: &Vmm,
        process: &Process,
        pt_pa: Address,
        level: u32,
        va_base: u64,
        entries: &mut Vec<PteEntry>,
    ) {
        let page = match vmm.tlb_page_table(pt_pa, false) {
            Some(page) => page,
            None => return,
        };
        let user_only = process.user_only;
        for i in 0..PT_ENTRIES {
            let e = pte_at(page.data(), i);
            if e & PTE_PRESENT == 0 {
                continue;
            }
            if user_only && e & PTE_USER == 0 {
                continue;
            }
            let shift = 12 + 9 * (level - 1);
            let mut va = va_base + ((i as u64) << shift);
            if level == 4 && i >= PT_ENTRIES / 2 {
                va |= 0xffff_0000_0000_0000;
            }
            if level == 1 || e & PTE_PS != 0 {
                if level == 4 {
                    continue;
                }
                let pages = 1u64 << (9 * (level - 1));
                push_run(entries, va, pages, e);
            } else {
                self.pte_walk(
                    vmm,
                    process,
                    Address::from(e & PTE_ADDR_MASK),
                    level - 1,
                    va,
                    entries,
                );
            }
        }
    }

    fn phys_to_virt_walk(
        &self,
        vmm: &Vmm,
        process: &Process,
        pt_pa: Address,
        level: u32,
        va_base: u64,
        target: u64,
        out: &mut Vec<Address>,
    ) {
        if out.len() >= PHYS2VIRT_MAX_RESULTS {
            return;
        }
        let page = match vmm.tlb_page_table(pt_pa, false) {
            Some(page) => page,
            None => return,
        };
        let user_only = process.user_only;
        for i in 0..PT_ENTRIES {
            if out.len() >= PHYS2VIRT_MAX_RESULTS {
                return;
            }
            let e = pte_at(page.data(), i);
            if e & PTE_PRESENT == 0 {
                continue;
            }
            if user_only && e & PTE_USER == 0 {
                continue;
            }
            let shift = 12 + 9 * (level - 1);
            let mut va = va_base + ((i as u64) << shift);
            if level == 4 && i >= PT_ENTRIES / 2 {
                va |= 0xffff_0000_0000_0000;
            }
            if level == 1 || (level < 4 && e & PTE_PS != 0) {
                let span = 1u64 << shift;
                let base = e & PTE_ADDR_MASK & !(span - 1);
                if target >= base && target < base + span {
                    out.push(Address::from(va + (target - base)));
                }
            } else if e & PTE_PS == 0 {
                self.phys_to_virt_walk(
                    vmm,
                    process,
                    Address::from(e & PTE_ADDR_MASK),
                    level - 1,
                    va,
                    target,
                    out,
                );
            }
        }
    }
}

fn push_run(entries: &mut Vec<PteEntry>, va: u64, pages: u64, e: u64) {
    let flags = e & (PTE_WRITE | PTE_USER | PTE_NX);
    if let Some(last) = entries.last_mut() {
        if last.flags == flags && last.va_base.as_u64() + (last.pages << 12) == va {
            last.pages += pages;
            return;
        }
    }
    entries.push(PteEntry {
        va_base: Address::from(va),
        pages,
        flags,
        tag: None,
    });
}

impl MemoryModel for X64Model {
    fn virt_to_phys(&self, vmm: &Vmm, process: &Process, va: Address) -> Option<Address> {
        if !is_canonical(va.as_u64()) {
            return None;
        }
        let user_only = process.user_only;
        let mut pt = vmm.tlb_page_table(process.dtb.page_align(), false)?;
        let mut level = 4u32;
        loop {
            let shift = 12 + 9 * (level - 1);
            let index = ((va.as_u64() >> shift) & 0x1ff) as usize;
            let e = pte_at(pt.data(), index);
            if e & PTE_PRESENT == 0 {
                return None;
            }
            if user_only && e & PTE_USER == 0 {
                return None;
            }
            if level == 1 {
                return Some(Address::from(
                    (e & PTE_ADDR_MASK) | (va.as_u64() & 0xfff),
                ));
            }
            if e & PTE_PS != 0 {
                if level == 4 {
                    return None;
                }
                let mask = (1u64 << shift) - 1;
                let base = e & PTE_ADDR_MASK & !mask;
                return Some(Address::from(base | (va.as_u64() & mask)));
            }
            pt = vmm.tlb_page_table(Address::from(e & PTE_ADDR_MASK), false)?;
            level -= 1;
        }
    }

    fn verify_page_table(
        &self,
        vmm: &Vmm,
        page: &[u8],
        pa: Address,
        require_self_ref: bool,
    ) -> bool {
        if page.len() != PAGE_SIZE {
            return false;
        }
        let pa_max = vmm.device.pa_max().as_u64();
        let mut bad = 0usize;
        let mut self_ref = false;
        for i in 0..PT_ENTRIES {
            let e = pte_at(page, i);
            if e & PTE_PRESENT == 0 {
                continue;
            }
            let addr = e & PTE_ADDR_MASK;
            if addr >= pa_max {
                bad += 1;
                if bad >= VERIFY_MAX_BAD {
                    return false;
                }
            }
            if addr == pa.as_u64() && e & PTE_WRITE != 0 {
                self_ref = true;
            }
        }
        !require_self_ref || self_ref
    }

    fn paged_read(
        &self,
        _vmm: &Vmm,
        _process: &Process,
        _va: Address,
        _pte: u64,
        _out: Option<&mut [u8]>,
        _flags: VmmFlags,
    ) -> PagedReadResult {
        // paged-out memory reconstruction is an OS-level concern;
        // the bare walker cannot resolve swapped pages
        PagedReadResult::Fail
    }

    fn pte_map_initialize(&self, vmm: &Vmm, process: &Process) -> Option<Vec<PteEntry>> {
        let mut entries = Vec::new();
        vmm.tlb_page_table(process.dtb.page_align(), false)?;
        self.pte_walk(
            vmm,
            process,
            process.dtb.page_align(),
            4,
            0,
            &mut entries,
        );
        process.set_tlb_spidered(true);
        Some(entries)
    }

    fn phys_to_virt_information(
        &self,
        vmm: &Vmm,
        process: &Process,
        info: &mut Phys2VirtInformation,
    ) {
        let mut vas = Vec::new();
        self.phys_to_virt_walk(
            vmm,
            process,
            process.dtb.page_align(),
            4,
            0,
            info.pa_target.as_u64(),
            &mut vas,
        );
        info.vas = vas;
    }
}
