/*!
Contract of the per-architecture memory model and the built-in x64
implementation.

The model owns virtual-to-physical translation, structural page-table
verification, the paged-memory read hook and the PTE map initializer.
Page-table walks go through the engine's Tlb cache.
*/

pub mod x64;
pub use x64::X64Model;

use crate::error::{Error, Result};
use crate::map::{Phys2VirtInformation, PteEntry};
use crate::process::Process;
use crate::types::Address;
use crate::vmm::{Vmm, VmmFlags};

/// System type of the analyzed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemType {
    None,
    X86,
    X86Pae,
    X64,
}

impl SystemType {
    #[inline]
    pub fn is_32bit(self) -> bool {
        matches!(self, SystemType::X86 | SystemType::X86Pae)
    }

    pub(crate) fn default_model(self) -> Result<Box<dyn MemoryModel>> {
        match self {
            SystemType::X64 => Ok(Box::new(X64Model)),
            SystemType::None => Ok(Box::new(NoneModel)),
            _ => Err(Error::Initialization(
                "no built-in memory model for this system type",
            )),
        }
    }
}

/// Outcome of the paged-memory read hook.
///
/// A single return channel: either the hook fully satisfied the read
/// into the caller buffer, or it resolved a physical address for a
/// transition/prototype page, or it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagedReadResult {
    /// The hook wrote the page into the caller buffer.
    Done,
    /// The page lives at this physical address; read it normally.
    TranslatedTo(Address),
    Fail,
}

/// Per-architecture memory model collaborator.
pub trait MemoryModel: Send + Sync {
    /// Translates a virtual address in the context of a process.
    fn virt_to_phys(&self, vmm: &Vmm, process: &Process, va: Address) -> Option<Address>;

    /// Structural check that a page plausibly is a page-table page.
    ///
    /// `require_self_ref` additionally demands a self-referencing entry
    /// (used when validating an x64 directory table base).
    fn verify_page_table(
        &self,
        vmm: &Vmm,
        page: &[u8],
        pa: Address,
        require_self_ref: bool,
    ) -> bool;

    /// Attempts to satisfy a read of a page that is not validly mapped
    /// (paged out, transition, prototype).
    ///
    /// Exactly one of `va` / `pte` is meaningful: `va` for an ordinary
    /// paged read, `pte` when the caller passed `ALTADDR_VA_PTE`.
    fn paged_read(
        &self,
        vmm: &Vmm,
        process: &Process,
        va: Address,
        pte: u64,
        out: Option<&mut [u8]>,
        flags: VmmFlags,
    ) -> PagedReadResult;

    /// Produces the flattened, deduplicated page-table entry map of a
    /// process, or `None` on failure.
    fn pte_map_initialize(&self, vmm: &Vmm, process: &Process) -> Option<Vec<PteEntry>>;

    /// Fills in the virtual addresses mapping a targeted physical
    /// address within the process address space.
    fn phys_to_virt_information(
        &self,
        vmm: &Vmm,
        process: &Process,
        info: &mut Phys2VirtInformation,
    );

    fn close(&self) {}
}

/// Placeholder model used before a system type has been identified.
/// Translates nothing and verifies nothing.
pub struct NoneModel;

impl MemoryModel for NoneModel {
    fn virt_to_phys(&self, _vmm: &Vmm, _process: &Process, _va: Address) -> Option<Address> {
        None
    }

    fn verify_page_table(
        &self,
        _vmm: &Vmm,
        _page: &[u8],
        _pa: Address,
        _require_self_ref: bool,
    ) -> bool {
        false
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
        PagedReadResult::Fail
    }

    fn pte_map_initialize(&self, _vmm: &Vmm, _process: &Process) -> Option<Vec<PteEntry>> {
        None
    }

    fn phys_to_virt_information(
        &self,
        _vmm: &Vmm,
        _process: &Process,
        _info: &mut Phys2VirtInformation,
    ) {
    }
}
