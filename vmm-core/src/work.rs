/*!
The internal worker pool.

A fixed set of threads drains a submission queue; units optionally
carry a completion event. Shutdown wakes every worker until all have
exited, then drains remaining submissions firing their completion
events so awaiters always observe completion.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::process::{Pid, Process};
use crate::vmm::{Vmm, VmmFlags};

/// Default number of worker threads.
pub const WORK_THREADPOOL_THREADS: usize = 32;

/// A settable one-shot completion latch.
pub struct WorkEvent {
    done: Mutex<bool>,
    cond: Condvar,
}

impl WorkEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn set(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.done.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }
}

struct WorkUnit {
    func: Box<dyn FnOnce() + Send + 'static>,
    done: Option<Arc<WorkEvent>>,
}

struct PoolShared {
    queue: Mutex<VecDeque<WorkUnit>>,
    wakeup: Condvar,
    enabled: AtomicBool,
    alive: AtomicUsize,
}

/// Fixed-size pool executing submitted units.
pub struct WorkPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkPool {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            enabled: AtomicBool::new(true),
            alive: AtomicUsize::new(0),
        });
        let handles = (0..threads)
            .map(|_| {
                let shared = shared.clone();
                shared.alive.fetch_add(1, Ordering::AcqRel);
                thread::spawn(move || Self::worker_loop(shared))
            })
            .collect();
        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Appends a unit and wakes an idle worker.
    ///
    /// After shutdown the unit is not executed; its completion event (if
    /// any) fires immediately.
    pub fn submit<F>(&self, func: F, done: Option<Arc<WorkEvent>>)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.enabled.load(Ordering::Acquire) {
            if let Some(event) = done {
                event.set();
            }
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(WorkUnit {
            func: Box::new(func),
            done,
        });
        drop(queue);
        self.shared.wakeup.notify_one();
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            let unit = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if !shared.enabled.load(Ordering::Acquire) {
                        shared.alive.fetch_sub(1, Ordering::AcqRel);
                        return;
                    }
                    if let Some(unit) = queue.pop_front() {
                        break unit;
                    }
                    queue = shared.wakeup.wait(queue).unwrap();
                }
            };
            (unit.func)();
            if let Some(event) = unit.done {
                event.set();
            }
        }
    }

    /// Shuts the pool down: disables submission, wakes every worker
    /// until all have exited, then drains remaining units firing their
    /// completion events.
    pub fn close(&self) {
        if !self.shared.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        while self.shared.alive.load(Ordering::Acquire) != 0 {
            self.shared.wakeup.notify_all();
            thread::yield_now();
        }
        let handles = {
            let mut guard = self.handles.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
        let drained = {
            let mut queue = self.shared.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        for unit in drained {
            if let Some(event) = unit.done {
                event.set();
            }
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.close();
    }
}

struct ForeachShared {
    pids: Vec<Pid>,
    index: AtomicUsize,
    remaining: AtomicUsize,
    event: Arc<WorkEvent>,
}

impl Vmm {
    /// Submits a unit to the worker pool.
    pub fn work<F>(&self, func: F, done: Option<Arc<WorkEvent>>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.work.submit(func, done);
    }

    /// Runs `action` once for every process matched by `filter`,
    /// parallelized over the worker pool; blocks until all actions have
    /// completed. The scan includes terminated processes; the filter
    /// decides (see [`criteria_active_only`]).
    pub fn process_foreach_parallel<F>(
        &self,
        filter: Option<&dyn Fn(&Process) -> bool>,
        action: F,
    ) where
        F: Fn(&Vmm, &Arc<Process>) + Send + Sync + 'static,
    {
        let handle = match self.handle() {
            Some(handle) => handle,
            None => return,
        };
        let mut pids = Vec::new();
        let mut process = self.process_next(None, VmmFlags::PROCESS_SHOW_TERMINATED);
        while let Some(p) = process {
            if filter.map(|f| f(&p)).unwrap_or(true) {
                pids.push(p.pid);
            }
            process = self.process_next(Some(p), VmmFlags::PROCESS_SHOW_TERMINATED);
        }
        if pids.is_empty() {
            return;
        }
        let count = pids.len();
        let shared = Arc::new(ForeachShared {
            pids,
            index: AtomicUsize::new(count),
            remaining: AtomicUsize::new(count),
            event: WorkEvent::new(),
        });
        let action = Arc::new(action);
        for _ in 0..count {
            let vmm = handle.clone();
            let shared = shared.clone();
            let action = action.clone();
            self.work.submit(
                move || {
                    let index = shared.index.fetch_sub(1, Ordering::AcqRel) - 1;
                    if let Some(process) = vmm.process(shared.pids[index]) {
                        action(&vmm, &process);
                    }
                    if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        shared.event.set();
                    }
                },
                None,
            );
        }
        shared.event.wait();
    }
}

/// Default foreach filter matching only active processes.
pub fn criteria_active_only(process: &Process) -> bool {
    process.is_active()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn units_run_and_signal() {
        let pool = WorkPool::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        let event = WorkEvent::new();
        for i in 0..16 {
            let counter = counter.clone();
            let done = if i == 15 { Some(event.clone()) } else { None };
            pool.submit(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                done,
            );
        }
        event.wait();
        // the last unit signalled; give stragglers a moment
        while counter.load(Ordering::SeqCst) != 16 {
            thread::yield_now();
        }
        pool.close();
    }

    #[test]
    fn close_fires_pending_events() {
        let pool = WorkPool::new(1);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let gate = gate.clone();
            pool.submit(
                move || {
                    let _g = gate.lock().unwrap();
                },
                None,
            );
        }
        // give the single worker time to block on the gate, then flood
        // the queue with units that will never run
        thread::sleep(Duration::from_millis(20));
        let events: Vec<_> = (0..4)
            .map(|_| {
                let event = WorkEvent::new();
                pool.submit(|| {}, Some(event.clone()));
                event
            })
            .collect();
        drop(held);
        pool.close();
        for event in events {
            assert!(event.is_set());
        }
    }

    #[test]
    fn submit_after_close_signals_immediately() {
        let pool = WorkPool::new(2);
        pool.close();
        let event = WorkEvent::new();
        pool.submit(|| panic!("must not run"), Some(event.clone()));
        assert!(event.is_set());
    }
}
