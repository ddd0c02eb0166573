//! The task scheduler.
//!
//! A scheduler drains deferred work to completion, one task at a time,
//! on the thread that owns it. Work arrives on two queues: a *local*
//! queue touched only by the owning thread, and a *posted* queue other
//! threads feed under a spinlock. When a round starts with no work and
//! an event monitor is alive, the scheduler blocks in the monitor's
//! wait; readiness callbacks dispatch further work, which runs in the
//! *next* round. Tasks known at the start of a round therefore always
//! complete before anything discovered during that round.

use std::cell::{Cell, UnsafeCell};
use std::mem;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use log::trace;

use crate::error::Result;
use crate::list::{Arena, List};
use crate::monitor::EventMonitor;
use crate::task::{Task, TaskQueue, TaskRef};
use crate::timer::TimerServices;

/// Single-threaded task scheduler with cross-thread ingress.
///
/// All operations except [`post`](Scheduler::post),
/// [`post_queue`](Scheduler::post_queue) and
/// [`interrupt`](Scheduler::interrupt) must be called on the thread
/// that created the scheduler; violations trip an assertion. Task
/// procedures run on that thread only.
pub struct Scheduler {
    arena: UnsafeCell<Arena<TaskRef>>,
    local: UnsafeCell<List<TaskRef>>,
    posted: spin::Mutex<Vec<TaskRef>>,
    monitor: spin::Mutex<Weak<EventMonitor>>,
    services: UnsafeCell<TimerServices>,
    running: Cell<bool>,
    owner: ThreadId,
}

// The owner-thread-only state (`arena`, `local`, `services`,
// `running`) is guarded by the owner assertion on every entry point
// that touches it; the cross-thread surface goes through the spin
// mutexes and the monitor's interrupter only.
unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub fn new() -> Scheduler {
        let arena = Arena::new();
        let local = List::new(&arena);
        Scheduler {
            arena: UnsafeCell::new(arena),
            local: UnsafeCell::new(local),
            posted: spin::Mutex::new(Vec::new()),
            monitor: spin::Mutex::new(Weak::new()),
            services: UnsafeCell::new(TimerServices::default()),
            running: Cell::new(false),
            owner: thread::current().id(),
        }
    }

    fn assert_owner(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "operation restricted to the scheduler's owning thread"
        );
    }

    /// Append a task to the local ready queue. Owning thread only; use
    /// [`post`](Scheduler::post) from other threads.
    pub fn dispatch(&self, task: &Task) {
        self.assert_owner();
        let entry = task.make_ref();
        unsafe {
            let arena = &mut *self.arena.get();
            (*self.local.get()).push_back(arena, entry);
        }
    }

    /// Append a whole batch to the local ready queue, preserving its
    /// order. Owning thread only.
    pub fn dispatch_queue(&self, queue: &mut TaskQueue) {
        self.assert_owner();
        while let Some(entry) = queue.pop() {
            unsafe {
                let arena = &mut *self.arena.get();
                (*self.local.get()).push_back(arena, entry);
            }
        }
    }

    /// Append a task to the cross-thread queue and wake the scheduler
    /// if it is blocked. Safe from any thread.
    pub fn post(&self, task: &Task) {
        let entry = task.make_ref();
        let mut posted = self.posted.lock();
        posted.push(entry);
        self.interrupt();
    }

    /// Cross-thread batch variant of [`post`](Scheduler::post).
    pub fn post_queue(&self, queue: &mut TaskQueue) {
        let mut posted = self.posted.lock();
        while let Some(entry) = queue.pop() {
            posted.push(entry);
        }
        self.interrupt();
    }

    /// Wake a blocking wait, if an event monitor is alive. Safe from
    /// any thread; a no-op otherwise.
    pub fn interrupt(&self) {
        if let Some(monitor) = self.monitor.lock().upgrade() {
            monitor.interrupt();
        }
    }

    /// Whether any queue holds work. Owning thread only.
    pub fn has_tasks(&self) -> bool {
        self.assert_owner();
        if unsafe { !(*self.local.get()).is_empty() } {
            return true;
        }
        !self.posted.lock().is_empty()
    }

    /// The scheduler's event monitor, created on first demand. The
    /// scheduler holds it weakly: it lives as long as some event
    /// source does, and a fresh one is created when needed again.
    pub fn event_monitor(&self) -> Result<Arc<EventMonitor>> {
        self.assert_owner();
        let mut slot = self.monitor.lock();
        if let Some(monitor) = slot.upgrade() {
            return Ok(monitor);
        }
        let monitor = Arc::new(EventMonitor::new()?);
        *slot = Arc::downgrade(&monitor);
        Ok(monitor)
    }

    /// Stop after the currently executing task; the undrained rest of
    /// the round goes back to the front of the local queue.
    pub fn stop(&self) {
        self.assert_owner();
        self.running.set(false);
    }

    /// Run rounds until no task remains and no event source keeps the
    /// monitor alive, or [`stop`](Scheduler::stop) is called.
    ///
    /// A system error out of the readiness wait, like a panic out of a
    /// task procedure, leaves the queues intact for a re-entry.
    pub fn run(&self) -> Result<()> {
        self.assert_owner();
        self.running.set(true);
        trace!("scheduler entering run loop");
        loop {
            let mut round = RoundGuard {
                sched: self,
                queue: self.take_local(),
            };

            // Shortest possible critical section: steal the whole
            // posted batch, then splice it outside the lock.
            let batch = mem::take(&mut *self.posted.lock());
            for entry in batch {
                unsafe {
                    let arena = &mut *self.arena.get();
                    round.queue.push_back(arena, entry);
                }
            }

            let monitor = self.monitor.lock().upgrade();
            match monitor {
                Some(monitor) => {
                    monitor.wait(self, round.queue.is_empty())?;
                    // Readiness callbacks dispatch onto the local
                    // queue; pull that work into this round.
                    let mut fresh = self.take_local();
                    unsafe {
                        round.queue.splice_back(&mut *self.arena.get(), &mut fresh);
                    }
                }
                None => {
                    if round.queue.is_empty() {
                        self.running.set(false);
                        trace!("scheduler idle, leaving run loop");
                        return Ok(());
                    }
                }
            }

            loop {
                let entry = unsafe { round.queue.pop_front(&mut *self.arena.get()) };
                let Some((task, serial)) = entry else { break };
                // Detach before invoking; cancel past this point is a
                // no-op, and stale entries are skipped.
                if task.begin_run(serial) {
                    task.invoke();
                }
                if !self.running.get() {
                    break;
                }
            }
            drop(round);

            if !self.running.get() {
                trace!("scheduler stopped");
                return Ok(());
            }
        }
    }

    pub(crate) fn with_timer_services<R>(&self, f: impl FnOnce(&mut TimerServices) -> R) -> R {
        self.assert_owner();
        unsafe { f(&mut *self.services.get()) }
    }

    fn take_local(&self) -> List<TaskRef> {
        unsafe {
            let empty = List::new(&*self.arena.get());
            mem::replace(&mut *self.local.get(), empty)
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

// Puts an unfinished round back at the front of the local queue on
// every exit path, including unwinding task procedures, so nothing
// queued is ever lost.
struct RoundGuard<'a> {
    sched: &'a Scheduler,
    queue: List<TaskRef>,
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        unsafe {
            let arena = &mut *self.sched.arena.get();
            (*self.sched.local.get()).splice_front(arena, &mut self.queue);
        }
    }
}
