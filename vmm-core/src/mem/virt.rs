/*!
Virtual side of the scatter pipeline plus the byte-oriented wrappers.

Virtual units are translated through the active memory model (with a
paged-memory fallback for 4 KiB units), collected into a physical
request vector sharing the caller buffers, run through the physical
pipeline and restored.
*/

use std::mem::MaybeUninit;

use bumpalo::{collections::Vec as BumpVec, Bump};
use dataview::Pod;

use crate::error::{Error, Result};
use crate::mem::scatter::MemScatter;
use crate::model::PagedReadResult;
use crate::process::Process;
use crate::types::{Address, PAGE_SIZE};
use crate::vmm::{Vmm, VmmFlags};

impl Vmm {
    /// Batched virtual read in the context of a process.
    ///
    /// Units that fail translation (and the paged fallback) stay invalid;
    /// with `ZEROPAD_ON_FAIL` their buffers are zeroed but the units are
    /// still reported failed, unlike physical zero padding.
    pub fn read_scatter_virtual(
        &self,
        process: &Process,
        mems: &mut [MemScatter<'_>],
        flags: VmmFlags,
    ) {
        let eff = flags | self.flags;
        let paging = !eff.contains(VmmFlags::NOPAGING);
        let alt_pte = flags.contains(VmmFlags::ALTADDR_VA_PTE);
        let zeropad = eff.contains(VmmFlags::ZEROPAD_ON_FAIL);
        let arena = Bump::new();
        let mut phys_units = BumpVec::new_in(&arena);

        for (index, mem) in mems.iter_mut().enumerate() {
            if mem.valid || mem.addr.is_null() || !mem.addr.is_valid() {
                if !mem.valid && zeropad {
                    mem.buf_mut().iter_mut().for_each(|b| *b = 0);
                }
                continue;
            }
            let mut pa = if alt_pte {
                None
            } else {
                self.model.virt_to_phys(self, process, mem.addr)
            };
            if pa.is_none() && paging && mem.len() == PAGE_SIZE {
                let (va, pte) = if alt_pte {
                    (Address::NULL, mem.addr.as_u64())
                } else {
                    (mem.addr, 0)
                };
                match self
                    .model
                    .paged_read(self, process, va, pte, Some(mem.buf_mut()), eff)
                {
                    PagedReadResult::Done => {
                        mem.valid = true;
                        continue;
                    }
                    PagedReadResult::TranslatedTo(paged_pa) => pa = Some(paged_pa),
                    PagedReadResult::Fail => {}
                }
            }
            let pa = match pa {
                Some(pa) => pa,
                None => {
                    if zeropad {
                        mem.buf_mut().iter_mut().for_each(|b| *b = 0);
                    }
                    continue;
                }
            };
            let mut unit = mem.alias_at(pa);
            unit.stack_push(index as u64);
            phys_units.push(unit);
        }

        if !phys_units.is_empty() {
            self.read_scatter_physical(&mut phys_units, flags);
            let mut results = BumpVec::new_in(&arena);
            for unit in phys_units.iter_mut() {
                results.push((unit.stack_pop() as usize, unit.valid));
            }
            drop(phys_units);
            for (index, valid) in results {
                mems[index].valid = valid;
            }
        }
    }

    /// Batched virtual write: translate each unit (with the paged
    /// fallback supplying physical addresses for transition and
    /// prototype pages), delegate to the physical write, restore the
    /// virtual addresses.
    pub fn write_scatter_virtual(&self, process: &Process, mems: &mut [MemScatter<'_>]) {
        for mem in mems.iter_mut() {
            let original = mem.addr.as_u64();
            mem.stack_push(original);
            if mem.valid || !mem.addr.is_valid() {
                mem.addr = Address::INVALID;
                continue;
            }
            if let Some(pa) = self.model.virt_to_phys(self, process, mem.addr) {
                mem.addr = pa;
                continue;
            }
            mem.addr =
                match self
                    .model
                    .paged_read(self, process, mem.addr, 0, None, VmmFlags::empty())
                {
                    PagedReadResult::TranslatedTo(pa) => pa,
                    _ => Address::INVALID,
                };
        }
        self.write_scatter_physical(mems);
        for mem in mems.iter_mut() {
            let original = mem.stack_pop();
            mem.addr = Address::from(original);
        }
    }

    /// Byte-oriented read. Splits the buffer into a leading partial page,
    /// zero-copy full middle pages and a trailing partial page (partial
    /// edges go through bounce pages), zero-fills failed portions and
    /// returns the number of bytes read.
    pub fn read_ex(
        &self,
        process: Option<&Process>,
        addr: Address,
        out: &mut [u8],
        flags: VmmFlags,
    ) -> usize {
        let cb = out.len();
        if cb == 0 {
            return 0;
        }
        let offset = addr.page_offset();
        let count = (offset + cb + 0xfff) >> 12;
        let base = addr.page_align();
        let mut bounce = vec![0u8; 2 * PAGE_SIZE];
        let (head_buf, tail_buf) = bounce.split_at_mut(PAGE_SIZE);

        let first_len = std::cmp::min(cb, PAGE_SIZE - offset);
        let (first_part, rest) = out.split_at_mut(first_len);

        let mut units: Vec<MemScatter<'_>> = Vec::with_capacity(count);
        units.push(MemScatter::new(base, head_buf));
        let mut last_part: Option<&mut [u8]> = None;
        if count > 1 {
            let mid_len = (count - 2) * PAGE_SIZE;
            let (mid, last) = rest.split_at_mut(mid_len);
            for (k, chunk) in mid.chunks_mut(PAGE_SIZE).enumerate() {
                units.push(MemScatter::new(base + (k + 1) * PAGE_SIZE, chunk));
            }
            units.push(MemScatter::new(base + (count - 1) * PAGE_SIZE, tail_buf));
            last_part = Some(last);
        }

        match process {
            Some(process) => self.read_scatter_virtual(process, &mut units, flags),
            None => self.read_scatter_physical(&mut units, flags),
        }

        let mut read = 0usize;
        // middle pages alias the output buffer directly
        for unit in units.iter_mut().take(count - 1).skip(1) {
            if unit.valid {
                read += PAGE_SIZE;
            } else {
                unit.buf_mut().iter_mut().for_each(|b| *b = 0);
            }
        }
        if units[0].valid {
            first_part.copy_from_slice(&units[0].buf()[offset..offset + first_len]);
            read += first_len;
        } else {
            first_part.iter_mut().for_each(|b| *b = 0);
        }
        if let Some(last) = last_part {
            let last_len = last.len();
            let tail = &units[count - 1];
            if tail.valid {
                last.copy_from_slice(&tail.buf()[..last_len]);
                read += last_len;
            } else {
                last.iter_mut().for_each(|b| *b = 0);
            }
        }
        read
    }

    /// Reads exactly `out.len()` bytes or fails with [`Error::Partial`].
    pub fn read(&self, process: Option<&Process>, addr: Address, out: &mut [u8]) -> Result<()> {
        self.read_flags(process, addr, out, VmmFlags::empty())
    }

    pub fn read_flags(
        &self,
        process: Option<&Process>,
        addr: Address,
        out: &mut [u8],
        flags: VmmFlags,
    ) -> Result<()> {
        if self.read_ex(process, addr, out, flags) == out.len() {
            Ok(())
        } else {
            Err(Error::Partial)
        }
    }

    /// Reads a whole 4 KiB page.
    pub fn read_page(&self, process: Option<&Process>, addr: Address) -> Result<Box<[u8]>> {
        let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
        self.read(process, addr, &mut page)?;
        Ok(page)
    }

    /// Reads `len` bytes into a fresh buffer.
    pub fn read_vec(
        &self,
        process: Option<&Process>,
        addr: Address,
        len: usize,
        flags: VmmFlags,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_flags(process, addr, &mut buf, flags)?;
        Ok(buf)
    }

    /// Reads into a plain-old-data value in place.
    pub fn read_into<T: Pod + ?Sized>(
        &self,
        process: Option<&Process>,
        addr: Address,
        out: &mut T,
    ) -> Result<()> {
        self.read(process, addr, out.as_bytes_mut())
    }

    /// Reads a plain-old-data value.
    ///
    /// # Safety
    ///
    /// The value is fully overwritten before use, so starting from an
    /// uninitialized buffer is fine for `#[repr(C)]` pod structs.
    #[allow(clippy::uninit_assumed_init)]
    pub fn read_pod<T: Pod + Sized>(&self, process: Option<&Process>, addr: Address) -> Result<T> {
        let mut obj: T = unsafe { MaybeUninit::uninit().assume_init() };
        self.read_into(process, addr, &mut obj)?;
        Ok(obj)
    }

    /// Byte-oriented write; returns the number of bytes written.
    pub fn write_ex(&self, process: Option<&Process>, addr: Address, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut units: Vec<MemScatter<'_>> = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let cur = addr + offset;
            let chunk = std::cmp::min(PAGE_SIZE - cur.page_offset(), data.len() - offset);
            units.push(MemScatter::owned(
                cur,
                data[offset..offset + chunk].to_vec().into_boxed_slice(),
            ));
            offset += chunk;
        }
        match process {
            Some(process) => self.write_scatter_virtual(process, &mut units),
            None => self.write_scatter_physical(&mut units),
        }
        units.iter().filter(|u| u.valid).map(|u| u.len()).sum()
    }

    /// Writes all of `data` or fails with [`Error::Partial`].
    pub fn write(&self, process: Option<&Process>, addr: Address, data: &[u8]) -> Result<()> {
        if self.write_ex(process, addr, data) == data.len() {
            Ok(())
        } else {
            Err(Error::Partial)
        }
    }

    /// Writes a plain-old-data value.
    pub fn write_pod<T: Pod + ?Sized>(
        &self,
        process: Option<&Process>,
        addr: Address,
        data: &T,
    ) -> Result<()> {
        self.write(process, addr, data.as_bytes())
    }
}
