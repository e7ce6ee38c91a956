/*!
The generational process table.

Lookups run against an immutable published table; refreshes build a
pending table next to it and commit with a single swap of the table
handle, so concurrent lookups always observe one consistent generation.

Slots are open addressed from `pid % N` with linear probing; an
intrusive forward chain enumerates occupied slots newest-first.
*/

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use super::{sid_to_string, Pid, Process, ProcessPersistent, SID_MAX_SIZE};
use crate::model::SystemType;
use crate::types::Address;
use crate::vmm::{Vmm, VmmFlags};

/// Capacity of a process table generation.
pub const PROCESS_TABLE_ENTRIES: usize = 0x1000;

const LINK_NONE: u16 = u16::MAX;

/// One table generation. Immutable once published.
pub(crate) struct TableInner {
    slots: Vec<Option<Arc<Process>>>,
    next_link: Vec<u16>,
    first_link: u16,
    count: usize,
    count_active: usize,
}

impl TableInner {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![None; PROCESS_TABLE_ENTRIES],
            next_link: vec![LINK_NONE; PROCESS_TABLE_ENTRIES],
            first_link: LINK_NONE,
            count: 0,
            count_active: 0,
        }
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        let start = pid as usize % PROCESS_TABLE_ENTRIES;
        let mut i = start;
        loop {
            match &self.slots[i] {
                None => return None,
                Some(p) if p.pid == pid => return Some(i),
                Some(_) => {}
            }
            i = (i + 1) % PROCESS_TABLE_ENTRIES;
            if i == start {
                return None;
            }
        }
    }

    pub(crate) fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.slot_of(pid).and_then(|i| self.slots[i].clone())
    }

    /// Places a process by linear probing from `pid % N` and links it at
    /// the head of the enumeration chain.
    pub(crate) fn insert(&mut self, process: Arc<Process>) -> bool {
        let start = process.pid as usize % PROCESS_TABLE_ENTRIES;
        let mut i = start;
        loop {
            if self.slots[i].is_none() {
                self.count += 1;
                if process.is_active() {
                    self.count_active += 1;
                }
                self.slots[i] = Some(process);
                self.next_link[i] = self.first_link;
                self.first_link = i as u16;
                return true;
            }
            i = (i + 1) % PROCESS_TABLE_ENTRIES;
            if i == start {
                return false;
            }
        }
    }

    /// Walks the enumeration chain from the newest entry.
    pub(crate) fn iter(&self) -> TableIter<'_> {
        TableIter {
            table: self,
            link: self.first_link,
        }
    }

    /// The process following `pid` in the enumeration chain.
    pub(crate) fn after(&self, pid: Pid) -> Option<Arc<Process>> {
        let slot = self.slot_of(pid)?;
        let mut link = self.next_link[slot];
        while link != LINK_NONE {
            let i = link as usize;
            if let Some(p) = &self.slots[i] {
                return Some(p.clone());
            }
            link = self.next_link[i];
        }
        None
    }

    pub(crate) fn first(&self) -> Option<Arc<Process>> {
        self.iter().next()
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn count_active(&self) -> usize {
        self.count_active
    }
}

pub(crate) struct TableIter<'a> {
    table: &'a TableInner,
    link: u16,
}

impl<'a> Iterator for TableIter<'a> {
    type Item = Arc<Process>;

    fn next(&mut self) -> Option<Arc<Process>> {
        while self.link != LINK_NONE {
            let i = self.link as usize;
            self.link = self.table.next_link[i];
            if let Some(p) = &self.table.slots[i] {
                return Some(p.clone());
            }
        }
        None
    }
}

/// A published table generation holding the builder cell for the next.
pub(crate) struct ProcessTable {
    pub(crate) inner: TableInner,
    pub(crate) pending: Mutex<Option<TableInner>>,
}

impl ProcessTable {
    pub(crate) fn empty() -> Self {
        Self {
            inner: TableInner::new(),
            pending: Mutex::new(None),
        }
    }
}

/// Offsets the token initializer needs inside the OS token structures.
#[derive(Debug, Clone, Copy)]
pub struct TokenOffsets {
    /// Offset of the token pointer within the process descriptor bytes.
    pub eprocess_token: usize,
    /// Offset of the LUID within the token body.
    pub token_id: usize,
    /// Offset of the session id within the token body.
    pub session_id: usize,
    /// Offset of the user-and-groups pointer within the token body.
    pub user_and_groups: usize,
}

fn read_ptr(buf: &[u8], offset: usize, f32: bool) -> u64 {
    let width = if f32 { 4 } else { 8 };
    if offset + width > buf.len() {
        return 0;
    }
    if f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[offset..offset + 4]);
        u64::from(u32::from_le_bytes(raw))
    } else {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }
}

impl Vmm {
    pub(crate) fn process_table(&self) -> Arc<ProcessTable> {
        self.processes.lock().unwrap().clone()
    }

    /// Stages a process into the pending table generation.
    ///
    /// Active processes have their DTB fetched through the TLB path and
    /// structurally verified first. Unless `total_refresh`, an existing
    /// process object with the same PID is carried forward; a newly
    /// created object inherits the persistent sub-object of any prior
    /// same-PID incarnation. Returns the staged process, which becomes
    /// visible to lookups only after [`Vmm::process_create_finish`].
    #[allow(clippy::too_many_arguments)]
    pub fn process_create_entry(
        &self,
        total_refresh: bool,
        pid: Pid,
        ppid: Pid,
        state: u32,
        dtb: Address,
        dtb_user: Address,
        name: &str,
        user_only: bool,
        eprocess: &[u8],
    ) -> Option<Arc<Process>> {
        if pid == 0 {
            warn!("rejecting process with pid 0");
            return None;
        }
        if state == 0 {
            let table_page = self.tlb_page_table(dtb.page_align(), false)?;
            let require_self_ref = self.system == SystemType::X64;
            if !self.model.verify_page_table(
                self,
                table_page.data(),
                dtb.page_align(),
                require_self_ref,
            ) {
                debug!("rejecting process {}: dtb {:x} failed verification", pid, dtb);
                return None;
            }
        }
        let current = self.process_table();
        let mut pending_guard = current.pending.lock().unwrap();
        let pending = pending_guard.get_or_insert_with(TableInner::new);
        if pending.get(pid).is_some() {
            return None;
        }
        let process = if total_refresh {
            None
        } else {
            current.inner.get(pid)
        };
        let process = match process {
            Some(process) => process,
            None => {
                let persistent = current
                    .inner
                    .get(pid)
                    .map(|prev| prev.persistent.clone())
                    .unwrap_or_else(|| Arc::new(ProcessPersistent::new(pid)));
                Arc::new(Process::new(
                    pid, ppid, state, dtb, dtb_user, name, user_only, eprocess, persistent,
                ))
            }
        };
        if pending.insert(process.clone()) {
            Some(process)
        } else {
            warn!("process table full, dropping pid {}", pid);
            None
        }
    }

    /// Atomically replaces the current table with the pending one.
    /// Concurrent lookups see either the old or the new generation.
    pub fn process_create_finish(&self) {
        let current = self.process_table();
        let staged = current.pending.lock().unwrap().take();
        if let Some(inner) = staged {
            *self.processes.lock().unwrap() = Arc::new(ProcessTable {
                inner,
                pending: Mutex::new(None),
            });
        }
    }

    /// Looks up a process by PID.
    pub fn process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.process_get(pid, VmmFlags::empty())
    }

    pub fn process_get(&self, pid: Pid, flags: VmmFlags) -> Option<Arc<Process>> {
        let table = self.process_table();
        let process = table.inner.get(pid)?;
        if (flags | self.flags).contains(VmmFlags::PROCESS_TOKEN) && !process.token_initialized() {
            self.process_token_try_ensure(&table, &process);
        }
        Some(process)
    }

    /// Walks the process enumeration chain; pass `None` to start.
    ///
    /// Skips terminated processes unless `PROCESS_SHOW_TERMINATED` is
    /// set; `PROCESS_TOKEN` forces on-demand token initialization.
    pub fn process_next(
        &self,
        previous: Option<Arc<Process>>,
        flags: VmmFlags,
    ) -> Option<Arc<Process>> {
        let flags = flags | self.flags;
        let show_terminated = flags.contains(VmmFlags::PROCESS_SHOW_TERMINATED);
        let table = self.process_table();
        let mut next = match previous {
            None => table.inner.first(),
            Some(p) => table.inner.after(p.pid),
        };
        while let Some(process) = next {
            if process.is_active() || show_terminated {
                if flags.contains(VmmFlags::PROCESS_TOKEN) && !process.token_initialized() {
                    self.process_token_try_ensure(&table, &process);
                }
                return Some(process);
            }
            next = table.inner.after(process.pid);
        }
        None
    }

    /// Lists the PIDs of the current generation.
    pub fn process_list(&self, flags: VmmFlags) -> Vec<Pid> {
        let show_terminated = (flags | self.flags).contains(VmmFlags::PROCESS_SHOW_TERMINATED);
        let table = self.process_table();
        table
            .inner
            .iter()
            .filter(|p| p.is_active() || show_terminated)
            .map(|p| p.pid)
            .collect()
    }

    /// Number of processes in the current generation (active only unless
    /// `PROCESS_SHOW_TERMINATED`).
    pub fn process_count(&self, flags: VmmFlags) -> usize {
        let table = self.process_table();
        if (flags | self.flags).contains(VmmFlags::PROCESS_SHOW_TERMINATED) {
            table.inner.count()
        } else {
            table.inner.count_active()
        }
    }

    /// One-time token initialization, serialized by the master lock so
    /// concurrent lookups do not duplicate the table-wide passes.
    pub(crate) fn process_token_try_ensure(&self, table: &Arc<ProcessTable>, process: &Process) {
        if process.token_initialized() {
            return;
        }
        let _master = self.lock_master.lock().unwrap();
        if process.token_initialized() {
            return;
        }
        self.process_token_ensure_table(&table.inner);
    }

    /// Initializes the tokens of every process in a table in four
    /// batched passes, each amortizing device round-trips with a
    /// prefetch followed by cache-only reads.
    fn process_token_ensure_table(&self, table: &TableInner) {
        let offsets = match self.os.token_offsets() {
            Some(offsets) => offsets,
            None => return,
        };
        let system = match table.get(4) {
            Some(system) => system,
            None => return,
        };
        let f32 = self.system.is_32bit();
        let header = if f32 { 0x2c } else { 0x5c };
        let body = header + offsets.user_and_groups + 8;
        let procs: Vec<Arc<Process>> = table.iter().filter(|p| !p.token_initialized()).collect();

        // pass 1: token VA out of the process descriptor snapshot
        let mut vas: Vec<u64> = procs
            .iter()
            .map(|p| {
                let mask = if f32 { !0x7u64 } else { !0xfu64 };
                let va = read_ptr(&p.eprocess, offsets.eprocess_token, f32) & mask;
                if va != 0 && self.is_kernel_address(Address::from(va)) {
                    p.token.lock().unwrap().va = Address::from(va);
                    // include the object header preceding the token body
                    va.wrapping_sub(header as u64)
                } else {
                    0
                }
            })
            .collect();

        // pass 2: token body - pool tag check, LUID and session
        self.prefetch(
            Some(&system),
            vas.iter().copied().filter(|&va| va != 0).map(Address::from),
            body,
            VmmFlags::empty(),
        );
        let mut buf = vec![0u8; body];
        for (i, process) in procs.iter().enumerate() {
            let mut next_va = 0u64;
            if vas[i] != 0
                && self
                    .read_flags(
                        Some(&system),
                        Address::from(vas[i]),
                        &mut buf,
                        VmmFlags::FORCECACHE_READ,
                    )
                    .is_ok()
            {
                let candidate = read_ptr(&buf, header + offsets.user_and_groups, f32);
                if candidate != 0 && self.is_kernel_address(Address::from(candidate)) {
                    let step = if f32 { 0x08 } else { 0x10 };
                    let tagged = (0..header)
                        .step_by(step)
                        .any(|j| j + 4 <= buf.len() && buf[j..j + 4] == *b"Toke");
                    if tagged {
                        let mut token = process.token.lock().unwrap();
                        token.luid = read_ptr(&buf, header + offsets.token_id, false);
                        token.session_id =
                            read_ptr(&buf, header + offsets.session_id, true) as u32;
                        next_va = candidate;
                    }
                }
            }
            vas[i] = next_va;
        }

        // pass 3: SID pointer out of the user-and-groups array
        self.prefetch(
            Some(&system),
            vas.iter().copied().filter(|&va| va != 0).map(Address::from),
            8,
            VmmFlags::empty(),
        );
        let mut ptr_buf = vec![0u8; if f32 { 4 } else { 8 }];
        for va in vas.iter_mut() {
            let mut next_va = 0u64;
            if *va != 0
                && self
                    .read_flags(
                        Some(&system),
                        Address::from(*va),
                        &mut ptr_buf,
                        VmmFlags::FORCECACHE_READ,
                    )
                    .is_ok()
            {
                let candidate = read_ptr(&ptr_buf, 0, f32);
                if candidate != 0 && self.is_kernel_address(Address::from(candidate)) {
                    next_va = candidate;
                }
            }
            *va = next_va;
        }

        // pass 4: SID bytes; partial results leave sid_valid false
        self.prefetch(
            Some(&system),
            vas.iter().copied().filter(|&va| va != 0).map(Address::from),
            SID_MAX_SIZE,
            VmmFlags::empty(),
        );
        for (i, process) in procs.iter().enumerate() {
            if vas[i] != 0 {
                let mut sid = [0u8; SID_MAX_SIZE];
                if self
                    .read_flags(
                        Some(&system),
                        Address::from(vas[i]),
                        &mut sid,
                        VmmFlags::FORCECACHE_READ,
                    )
                    .is_ok()
                {
                    if let Some(sid_string) = sid_to_string(&sid) {
                        let mut token = process.token.lock().unwrap();
                        token.sid = sid;
                        token.sid_valid = true;
                        token.sid_string = Some(sid_string);
                    }
                }
            }
            // initialized regardless of outcome
            process
                .token_initialized
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }
}
