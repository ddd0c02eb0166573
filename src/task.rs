//! Cancelable units of work.
//!
//! A [`Task`] owns a procedure and a linkage state. Queues hold cheap
//! `Arc` handles stamped with a *link serial*: linking a task writes a
//! fresh nonzero serial into it, canceling zeroes it, and the scheduler
//! detaches a task (compare-and-swap of the expected serial to zero)
//! before invoking it, so cancel-after-dequeue is a no-op. A queue
//! entry whose serial no longer matches is stale and is skipped. This
//! is the linkage-state rendering of an intrusive ready-queue node: a
//! task is detached, or logically linked at exactly one live queue
//! position.
//!
//! Procedures are `FnMut() + Send` because tasks may be posted from
//! other threads; they are only ever *invoked* on the thread running
//! the owning scheduler.

use std::sync::Arc;

use portable_atomic::{AtomicU64, Ordering};

use crate::list::{Arena, List};

pub(crate) type Procedure = Box<dyn FnMut() + Send + 'static>;

/// A queue entry: the task handle plus the serial it was linked with.
pub(crate) type TaskRef = (Arc<TaskInner>, u64);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

pub(crate) struct TaskInner {
    // 0 = detached; otherwise the serial of the live queue entry.
    state: AtomicU64,
    procedure: spin::Mutex<Option<Procedure>>,
}

impl TaskInner {
    // Stamp a fresh serial, implicitly invalidating any previous queue
    // entry, and return it for the new entry.
    pub(crate) fn link(&self) -> u64 {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        self.state.store(serial, Ordering::Release);
        serial
    }

    // Detach before invoking; false means the entry went stale
    // (canceled or relinked) and must be skipped.
    pub(crate) fn begin_run(&self, serial: u64) -> bool {
        self.state
            .compare_exchange(serial, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // Run the procedure, tolerating a handler that replaces its own
    // procedure mid-call: the cell is emptied for the duration and the
    // old procedure is only put back if nothing took its place.
    pub(crate) fn invoke(&self) {
        let taken = self.procedure.lock().take();
        if let Some(mut f) = taken {
            f();
            let mut cell = self.procedure.lock();
            if cell.is_none() {
                *cell = Some(f);
            }
        }
    }
}

/// A unit of work that can be dispatched or posted to a scheduler and
/// canceled any time before the scheduler starts executing it.
///
/// Dropping a queued task cancels it. Re-dispatching a task that is
/// already queued moves it: the old queue position dies and the new
/// one wins.
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// A task with no procedure; invoking it does nothing.
    pub fn new() -> Task {
        Task {
            inner: Arc::new(TaskInner {
                state: AtomicU64::new(0),
                procedure: spin::Mutex::new(None),
            }),
        }
    }

    pub fn from_fn<F>(f: F) -> Task
    where
        F: FnMut() + Send + 'static,
    {
        let task = Task::new();
        task.set_procedure(f);
        task
    }

    /// Install a new procedure, returning the previous one.
    pub fn set_procedure<F>(&self, f: F) -> Option<Procedure>
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.procedure.lock().replace(Box::new(f))
    }

    /// Unlink from whatever queue holds the task. Returns whether it
    /// was linked. Canceling a detached task is a no-op.
    pub fn cancel(&self) -> bool {
        self.inner.state.swap(0, Ordering::AcqRel) != 0
    }

    /// Not linked into any queue. (A freshly created task counts as
    /// canceled, like any other detached task.)
    pub fn is_canceled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == 0
    }

    /// Invoke the procedure in place, without touching linkage.
    pub fn call(&self) {
        self.inner.invoke();
    }

    pub(crate) fn make_ref(&self) -> TaskRef {
        let serial = self.inner.link();
        (Arc::clone(&self.inner), serial)
    }
}

impl Default for Task {
    fn default() -> Self {
        Task::new()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// An ordered batch of tasks for `dispatch`/`post` in bulk.
///
/// Pushing links the task exactly as `dispatch` would; a task in a
/// user-held queue can be canceled before the queue is handed to a
/// scheduler.
pub struct TaskQueue {
    arena: Arena<TaskRef>,
    list: List<TaskRef>,
    len: usize,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        let arena = Arena::new();
        let list = List::new(&arena);
        TaskQueue {
            arena,
            list,
            len: 0,
        }
    }

    pub fn push(&mut self, task: &Task) {
        let entry = task.make_ref();
        self.list.push_back(&mut self.arena, entry);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn pop(&mut self) -> Option<TaskRef> {
        let entry = self.list.pop_front(&mut self.arena)?;
        self.len -= 1;
        Some(entry)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        TaskQueue::new()
    }
}
