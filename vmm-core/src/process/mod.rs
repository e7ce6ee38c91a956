/*!
The process object.

A process represents one address space observed in the analyzed target.
Processes are refcounted (`Arc`) and live in the generational process
table; semantic maps hang off the process and are published at most once
per generation. A persistent sub-object keyed by PID survives total
refreshes.
*/

pub mod table;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use crate::map::{
    HandleMap, HeapMap, ModuleMap, Phys2VirtInformation, PteMap, ThreadMap, VadMap,
};
use crate::types::Address;

pub type Pid = u32;

/// Size of the opaque OS-specific process descriptor snapshot kept on
/// the process (e.g. EPROCESS bytes).
pub const PROCESS_OS_HEADER_MAX: usize = 0x800;

/// Largest SID the token carries, matching `SECURITY_MAX_SID_SIZE`.
pub const SID_MAX_SIZE: usize = 68;

/// Access token attributes of a process.
#[derive(Clone)]
pub struct ProcessToken {
    pub va: Address,
    pub luid: u64,
    pub session_id: u32,
    pub sid: [u8; SID_MAX_SIZE],
    pub sid_valid: bool,
    pub sid_string: Option<String>,
}

impl Default for ProcessToken {
    fn default() -> Self {
        Self {
            va: Address::NULL,
            luid: 0,
            session_id: 0,
            sid: [0u8; SID_MAX_SIZE],
            sid_valid: false,
            sid_string: None,
        }
    }
}

/// Per-PID state shared by every incarnation of a process across
/// refreshes: prefetch address hints for the OS enumerators and the
/// sticky phys2virt target.
#[derive(Default)]
pub struct ProcessPersistent {
    pub pid: Pid,
    pub(crate) phys2virt_target: AtomicU64,
    pub vad_prefetch: Mutex<Option<Arc<Vec<Address>>>>,
    pub module_prefetch32: Mutex<Option<Arc<Vec<Address>>>>,
    pub module_prefetch64: Mutex<Option<Arc<Vec<Address>>>>,
    pub thread_prefetch: Mutex<Option<Arc<Vec<Address>>>>,
}

impl ProcessPersistent {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }
}

/// Lazily published per-process maps. Immutable once published, until
/// the next total refresh replaces the process object.
#[derive(Default)]
pub(crate) struct ProcessMaps {
    pub module: Mutex<Option<Arc<ModuleMap>>>,
    pub vad: Mutex<Option<Arc<VadMap>>>,
    pub thread: Mutex<Option<Arc<ThreadMap>>>,
    pub handle: Mutex<Option<Arc<HandleMap>>>,
    pub heap: Mutex<Option<Arc<HeapMap>>>,
    pub pte: Mutex<Option<Arc<PteMap>>>,
    /// serializes thread map population separately from the update lock
    pub lock_thread: Mutex<()>,
    /// serializes extended-info (map text) population
    pub lock_extended: Mutex<()>,
}

impl ProcessMaps {
    fn shallow_clone(&self) -> Self {
        Self {
            module: Mutex::new(self.module.lock().unwrap().clone()),
            vad: Mutex::new(self.vad.lock().unwrap().clone()),
            thread: Mutex::new(self.thread.lock().unwrap().clone()),
            handle: Mutex::new(self.handle.lock().unwrap().clone()),
            heap: Mutex::new(self.heap.lock().unwrap().clone()),
            pte: Mutex::new(self.pte.lock().unwrap().clone()),
            lock_thread: Mutex::new(()),
            lock_extended: Mutex::new(()),
        }
    }
}

/// A process in the analyzed target.
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    /// 0 = active, non-zero = terminated.
    pub state: u32,
    /// Directory table base of the process page tables.
    pub dtb: Address,
    /// Optional secondary DTB covering the user half (KVA shadowing).
    pub dtb_user: Address,
    /// Hide supervisor pages from view for this process.
    pub user_only: bool,
    /// Short process name (truncated to 15 bytes).
    pub name: String,
    /// Opaque OS-specific descriptor snapshot; immutable after creation.
    pub eprocess: Box<[u8]>,
    pub(crate) persistent: Arc<ProcessPersistent>,
    pub(crate) maps: ProcessMaps,
    pub(crate) token: Mutex<ProcessToken>,
    pub(crate) token_initialized: AtomicBool,
    tlb_spidered: AtomicBool,
    lock_update: Mutex<()>,
    pub(crate) lock_plugin: Mutex<()>,
    pub(crate) phys2virt: Mutex<Option<Arc<Phys2VirtInformation>>>,
    kernel_clone: bool,
}

impl Process {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pid: Pid,
        ppid: Pid,
        state: u32,
        dtb: Address,
        dtb_user: Address,
        name: &str,
        user_only: bool,
        eprocess: &[u8],
        persistent: Arc<ProcessPersistent>,
    ) -> Self {
        let eprocess = &eprocess[..eprocess.len().min(PROCESS_OS_HEADER_MAX)];
        let mut name = name.to_string();
        name.truncate(15);
        Self {
            pid,
            ppid,
            state,
            dtb,
            dtb_user,
            user_only,
            name,
            eprocess: eprocess.to_vec().into_boxed_slice(),
            persistent,
            maps: ProcessMaps::default(),
            token: Mutex::new(ProcessToken::default()),
            token_initialized: AtomicBool::new(false),
            tlb_spidered: AtomicBool::new(false),
            lock_update: Mutex::new(()),
            lock_plugin: Mutex::new(()),
            phys2virt: Mutex::new(None),
            kernel_clone: false,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == 0
    }

    /// The persistent per-PID sub-object shared across refreshes.
    pub fn persistent(&self) -> &Arc<ProcessPersistent> {
        &self.persistent
    }

    /// Snapshot of the process token. Meaningful once token
    /// initialization ran (see `PROCESS_TOKEN`).
    pub fn token(&self) -> ProcessToken {
        self.token.lock().unwrap().clone()
    }

    pub fn token_initialized(&self) -> bool {
        self.token_initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tlb_spidered(&self) -> bool {
        self.tlb_spidered.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_tlb_spidered(&self, spidered: bool) {
        self.tlb_spidered.store(spidered, Ordering::Release);
    }

    /// Serializes mutation of the process maps and token.
    pub(crate) fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.lock_update.lock().unwrap()
    }

    /// Serializes plugin-owned per-process state. The engine takes no
    /// part in plugin mutation; external plugin layers lock this around
    /// theirs.
    pub fn lock_plugin(&self) -> MutexGuard<'_, ()> {
        self.lock_plugin.lock().unwrap()
    }

    /// Returns a shallow clone of this process with kernel memory in
    /// view: same DTB, persistent state and currently published maps,
    /// but `user_only` cleared.
    ///
    /// Cloning a clone is refused.
    pub fn kernel_view(&self) -> Option<Arc<Process>> {
        if self.kernel_clone {
            warn!("refusing nested kernel view of process {}", self.pid);
            return None;
        }
        Some(Arc::new(Process {
            pid: self.pid,
            ppid: self.ppid,
            state: self.state,
            dtb: self.dtb,
            dtb_user: self.dtb_user,
            user_only: false,
            name: self.name.clone(),
            eprocess: self.eprocess.clone(),
            persistent: self.persistent.clone(),
            maps: self.maps.shallow_clone(),
            token: Mutex::new(self.token.lock().unwrap().clone()),
            token_initialized: AtomicBool::new(self.token_initialized()),
            tlb_spidered: AtomicBool::new(self.tlb_spidered()),
            lock_update: Mutex::new(()),
            lock_plugin: Mutex::new(()),
            phys2virt: Mutex::new(self.phys2virt.lock().unwrap().clone()),
            kernel_clone: true,
        }))
    }

    pub fn is_kernel_view(&self) -> bool {
        self.kernel_clone
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Process {{ pid: {}, ppid: {}, state: {}, dtb: {:x}, name: {} }}",
            self.pid, self.ppid, self.state, self.dtb, self.name
        )
    }
}

/// Renders a binary security identifier as its `S-1-...` string form.
///
/// Returns `None` for structurally invalid SIDs (bad revision or
/// sub-authority count).
pub fn sid_to_string(sid: &[u8]) -> Option<String> {
    if sid.len() < 8 {
        return None;
    }
    let revision = sid[0];
    let sub_count = sid[1] as usize;
    if revision != 1 || sub_count == 0 || sub_count > 15 {
        return None;
    }
    if sid.len() < 8 + sub_count * 4 {
        return None;
    }
    let mut authority = 0u64;
    for &b in &sid[2..8] {
        authority = (authority << 8) | u64::from(b);
    }
    let mut out = format!("S-{}-{}", revision, authority);
    for i in 0..sub_count {
        let offset = 8 + i * 4;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&sid[offset..offset + 4]);
        out.push_str(&format!("-{}", u32::from_le_bytes(raw)));
    }
    Some(out)
}
