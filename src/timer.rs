//! Deadline timers.
//!
//! Each scheduler gets (lazily, per clock domain) a [`TimerService`]:
//! a deadline-ordered multiset of armed timers driven by one timerfd
//! in absolute mode, registered as an ordinary event source. Whenever
//! the front of the queue changes, the timerfd is re-programmed for
//! the new front; an empty queue disarms it. Firing dispatches each
//! due timer's task onto the scheduler, then *relays* the timer: a
//! one-shot unlinks, a periodic timer advances to the next deadline
//! strictly after now, counting skipped periods into its missed-fire
//! counter — a slow handler gets one catch-up invocation, never a
//! burst.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace};

use crate::error::Result;
use crate::handle::SystemHandle;
use crate::rbtree::{InsertPolicy, NodeRef, RbTree};
use crate::scheduler::Scheduler;
use crate::source::{EventSink, EventSource};
use crate::task::Task;
use crate::time::TimePoint;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::MonotonicClock {}
    impl Sealed for super::WallClock {}
}

/// A kernel clock a timer service can be bound to.
pub trait Clock: sealed::Sealed + 'static + Sized {
    #[doc(hidden)]
    const RAW: libc::clockid_t;

    fn now() -> TimePoint;

    #[doc(hidden)]
    fn slot(services: &mut TimerServices) -> &mut Weak<TimerService<Self>>;
}

/// `CLOCK_MONOTONIC`; immune to wall-clock adjustments. The default
/// clock for [`Timer`].
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    const RAW: libc::clockid_t = libc::CLOCK_MONOTONIC;

    fn now() -> TimePoint {
        TimePoint::read(Self::RAW)
    }

    fn slot(services: &mut TimerServices) -> &mut Weak<TimerService<Self>> {
        &mut services.monotonic
    }
}

/// `CLOCK_REALTIME`; deadlines track wall-clock adjustments.
pub struct WallClock;

impl Clock for WallClock {
    const RAW: libc::clockid_t = libc::CLOCK_REALTIME;

    fn now() -> TimePoint {
        TimePoint::read(Self::RAW)
    }

    fn slot(services: &mut TimerServices) -> &mut Weak<TimerService<Self>> {
        &mut services.wall
    }
}

/// Per-scheduler service slots, one per clock domain. Held by the
/// scheduler; only the owning thread touches them.
#[doc(hidden)]
#[derive(Default)]
pub struct TimerServices {
    monotonic: Weak<TimerService<MonotonicClock>>,
    wall: Weak<TimerService<WallClock>>,
}

struct TimerShared<C: Clock> {
    task: Task,
    deadline: Cell<TimePoint>,
    interval: Cell<Duration>,
    missed: Cell<u64>,
    node: Cell<Option<NodeRef>>,
    service: RefCell<Option<Rc<TimerService<C>>>>,
}

/// Deadline queue plus kernel timer for one scheduler and one clock.
///
/// Created by the first timer that needs it; lives while any started
/// timer holds it. Its timerfd is registered with the scheduler's
/// event monitor like any other read-triggered source.
pub struct TimerService<C: Clock> {
    source: RefCell<Option<EventSource>>,
    queue: RefCell<RbTree<TimePoint, Rc<TimerShared<C>>>>,
    armed: Cell<Option<TimePoint>>,
}

impl<C: Clock> TimerService<C> {
    fn acquire(sched: &Scheduler) -> Result<Rc<TimerService<C>>> {
        if let Some(service) = sched.with_timer_services(|s| C::slot(s).upgrade()) {
            return Ok(service);
        }
        let service = Rc::new(TimerService {
            source: RefCell::new(None),
            queue: RefCell::new(RbTree::new()),
            armed: Cell::new(None),
        });
        let device = SystemHandle::from_factory(|| unsafe {
            libc::timerfd_create(C::RAW, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?;
        debug!("timer service up (timerfd {})", device.raw());
        let source = EventSource::new(sched, device, &service)?;
        *service.source.borrow_mut() = Some(source);
        sched.with_timer_services(|s| *C::slot(s) = Rc::downgrade(&service));
        Ok(service)
    }

    // Link a timer whose deadline and interval are already set.
    fn enqueue(&self, shared: &Rc<TimerShared<C>>) {
        debug_assert!(shared.node.get().is_none(), "timer already linked");
        let (node, _) = self.queue.borrow_mut().insert(
            shared.deadline.get(),
            Rc::clone(shared),
            InsertPolicy::Backmost,
        );
        shared.node.set(Some(node));
        self.sync_wakeup();
    }

    fn unlink(&self, shared: &TimerShared<C>) {
        if let Some(node) = shared.node.take() {
            self.queue.borrow_mut().remove(node);
            self.sync_wakeup();
        }
    }

    fn reposition(&self, shared: &TimerShared<C>) {
        let node = shared.node.get().expect("started timer must be linked");
        self.queue
            .borrow_mut()
            .update_key(node, shared.deadline.get(), InsertPolicy::Backmost);
        self.sync_wakeup();
    }

    // Program the kernel timer for the queue front, or disarm it when
    // the queue is empty. Invariant after every mutation: armed
    // deadline == front deadline.
    fn sync_wakeup(&self) {
        let front = {
            let queue = self.queue.borrow();
            queue.front().map(|node| *queue.key(node))
        };
        if front == self.armed.get() {
            return;
        }
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let spec = libc::itimerspec {
            it_interval: zero,
            it_value: match front {
                Some(deadline) => deadline.to_timespec(),
                None => zero,
            },
        };
        let source = self.source.borrow();
        let fd = match source.as_ref() {
            Some(source) => source.device().raw(),
            None => return, // still constructing; armed on first enqueue
        };
        let rc = unsafe {
            libc::timerfd_settime(fd, libc::TFD_TIMER_ABSTIME, &spec, std::ptr::null_mut())
        };
        if rc == -1 {
            debug!(
                "timerfd_settime failed: {}",
                std::io::Error::last_os_error()
            );
            return;
        }
        self.armed.set(front);
        match front {
            Some(deadline) => trace!("kernel timer armed for {:?}", deadline.since_epoch()),
            None => trace!("kernel timer disarmed"),
        }
    }

    // Consume one firing of `shared` at time `now`: unlink a one-shot,
    // advance a periodic past `now` with missed-fire accounting.
    fn relay(&self, shared: &Rc<TimerShared<C>>, now: TimePoint) {
        let node = match shared.node.get() {
            Some(node) => node,
            None => return,
        };
        let interval = shared.interval.get();
        if interval.is_zero() {
            shared.node.set(None);
            self.queue.borrow_mut().remove(node);
            shared.deadline.set(TimePoint::ZERO);
            // May drop the last timer-held reference to this service;
            // the event callback keeps it alive until we return.
            *shared.service.borrow_mut() = None;
        } else {
            let mut deadline = shared.deadline.get();
            let skipped = adjust_time_point(&mut deadline, now, interval);
            shared.missed.set(shared.missed.get() + skipped);
            shared.deadline.set(deadline);
            self.queue
                .borrow_mut()
                .update_key(node, deadline, InsertPolicy::Backmost);
        }
    }
}

impl<C: Clock> EventSink for TimerService<C> {
    fn on_emit(&self, sched: &Scheduler) {
        let now = C::now();
        loop {
            let due = {
                let queue = self.queue.borrow();
                match queue.front() {
                    Some(node) if *queue.key(node) <= now => Some(Rc::clone(queue.value(node))),
                    _ => None,
                }
            };
            let Some(shared) = due else { break };
            sched.dispatch(&shared.task);
            self.relay(&shared, now);
        }
        self.sync_wakeup();
    }
}

/// Advance `tp` to the smallest `tp + k * interval` strictly greater
/// than `base`, returning how many whole periods were skipped. Leaves
/// `tp` alone (returning 0) when it is not in the past or the interval
/// is zero.
fn adjust_time_point(tp: &mut TimePoint, base: TimePoint, interval: Duration) -> u64 {
    if interval.is_zero() || *tp >= base {
        return 0;
    }
    let behind = match base.checked_duration_since(*tp) {
        Some(behind) => behind,
        None => return 0,
    };
    let skipped = (behind.as_nanos() / interval.as_nanos()) as u64;
    let advance = (skipped as u128 + 1) * interval.as_nanos();
    *tp += Duration::from_nanos(advance as u64);
    skipped
}

/// A deadline callback bound to a scheduler.
///
/// Constructing a started timer links it into the scheduler's timer
/// service; firing dispatches the handler as an ordinary task on the
/// scheduler's thread. An interval of zero makes a one-shot. Dropping
/// the timer stops it and cancels any not-yet-run dispatch of its
/// handler.
pub struct Timer<C: Clock = MonotonicClock> {
    shared: Rc<TimerShared<C>>,
}

/// A timer on the wall clock.
pub type WallTimer = Timer<WallClock>;

impl<C: Clock> Timer<C> {
    /// A timer firing at `deadline`, then every `interval` if nonzero.
    /// A sentinel (`TimePoint::ZERO`) deadline constructs the timer
    /// stopped.
    pub fn new<F>(
        sched: &Scheduler,
        handler: F,
        deadline: TimePoint,
        interval: Duration,
    ) -> Result<Timer<C>>
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer {
            shared: Rc::new(TimerShared {
                task: Task::from_fn(handler),
                deadline: Cell::new(deadline),
                interval: Cell::new(interval),
                missed: Cell::new(0),
                node: Cell::new(None),
                service: RefCell::new(None),
            }),
        };
        timer.start(sched)?;
        Ok(timer)
    }

    /// A periodic timer whose first deadline is one interval from now.
    /// A zero interval constructs the timer stopped.
    pub fn with_interval<F>(sched: &Scheduler, handler: F, interval: Duration) -> Result<Timer<C>>
    where
        F: FnMut() + Send + 'static,
    {
        let deadline = if interval.is_zero() {
            TimePoint::ZERO
        } else {
            C::now() + interval
        };
        Timer::new(sched, handler, deadline, interval)
    }

    /// The current deadline; sentinel (`TimePoint::ZERO`) when
    /// stopped.
    pub fn deadline(&self) -> TimePoint {
        self.shared.deadline.get()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval.get()
    }

    /// Periods that elapsed without a handler invocation since the
    /// last reset.
    pub fn missed(&self) -> u64 {
        self.shared.missed.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.node.get().is_none()
    }

    /// Replace the handler, returning the previous one.
    pub fn set_handler<F>(&self, handler: F) -> Option<Box<dyn FnMut() + Send>>
    where
        F: FnMut() + Send + 'static,
    {
        self.shared.task.set_procedure(handler)
    }

    /// Re-schedule: snapshot and return the previous
    /// `(deadline, interval, missed)`, zero the missed-fire counter,
    /// then arm for `deadline` / `interval` — advancing a past
    /// deadline beyond now exactly like periodic relay would, with the
    /// skipped periods pre-counted. A sentinel deadline stops the
    /// timer.
    ///
    /// Needs the scheduler because a stopped timer may have to
    /// re-acquire its timer service.
    pub fn reset(
        &self,
        sched: &Scheduler,
        deadline: TimePoint,
        interval: Duration,
    ) -> Result<(TimePoint, Duration, u64)> {
        if deadline == TimePoint::ZERO {
            return Ok(self.stop());
        }
        let previous_missed = self.shared.missed.replace(0);
        let now = C::now();
        let mut adjusted = deadline;
        let skipped = adjust_time_point(&mut adjusted, now, interval);
        self.shared.missed.set(skipped);

        let snapshot = (
            self.shared.deadline.get(),
            self.shared.interval.replace(interval),
            previous_missed,
        );
        self.shared.deadline.set(adjusted);

        if self.shared.node.get().is_some() {
            let service = self
                .shared
                .service
                .borrow()
                .clone()
                .expect("started timer must hold its service");
            service.reposition(&self.shared);
        } else {
            self.start(sched)?;
        }
        Ok(snapshot)
    }

    /// Keep the current deadline, change only the interval.
    pub fn reset_interval(
        &self,
        sched: &Scheduler,
        interval: Duration,
    ) -> Result<(TimePoint, Duration, u64)> {
        self.reset(sched, self.shared.deadline.get(), interval)
    }

    /// Stop the timer, returning the snapshot `reset` would. The
    /// deadline becomes the sentinel, the interval zero, the
    /// missed-fire counter is cleared.
    pub fn stop(&self) -> (TimePoint, Duration, u64) {
        let previous_missed = self.shared.missed.replace(0);
        let snapshot = (
            self.shared.deadline.get(),
            self.shared.interval.replace(Duration::ZERO),
            previous_missed,
        );
        let service = self.shared.service.borrow_mut().take();
        if let Some(service) = service {
            service.unlink(&self.shared);
        }
        self.shared.deadline.set(TimePoint::ZERO);
        snapshot
    }

    fn start(&self, sched: &Scheduler) -> Result<()> {
        if self.shared.deadline.get() == TimePoint::ZERO {
            return Ok(());
        }
        let service = TimerService::acquire(sched)?;
        *self.shared.service.borrow_mut() = Some(Rc::clone(&service));
        service.enqueue(&self.shared);
        Ok(())
    }
}

impl<C: Clock> Drop for Timer<C> {
    fn drop(&mut self) {
        self.stop();
        self.shared.task.cancel();
    }
}
