//! A single-threaded event-driven I/O runtime.
//!
//! Three cooperating facilities: a [`Scheduler`] that drains deferred
//! [`Task`]s to completion one at a time; an [`EventMonitor`] bridging
//! epoll's edge-triggered readiness to the scheduler through
//! [`EventSource`] / [`IoEventSource`] registrations; and a timerfd
//! [`Timer`] service delivering monotonic or wall-clock deadline
//! callbacks with periodic catch-up accounting.
//!
//! User code creates a scheduler, registers sources and timers against
//! it, dispatches or posts tasks, then calls [`Scheduler::run`]. The
//! loop drains dispatched work; when idle it blocks in the event
//! monitor, which turns readiness into further dispatched work; it
//! returns once no task remains and no event source is registered.
//!
//! Everything runs on the thread owning the scheduler. The only
//! cross-thread entry points are [`Scheduler::post`],
//! [`Scheduler::post_queue`] and [`Scheduler::interrupt`].

#[cfg(not(target_os = "linux"))]
compile_error!("this runtime requires Linux (epoll, eventfd, timerfd)");

pub mod error;
pub mod handle;
pub mod list;
pub mod monitor;
pub mod rbtree;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod time;
pub mod timer;

pub use error::{Error, Result};
pub use handle::SystemHandle;
pub use monitor::{EventFlags, EventMonitor};
pub use scheduler::Scheduler;
pub use source::{EventSink, EventSource, IoEventSink, IoEventSource, IoMode};
pub use task::{Task, TaskQueue};
pub use time::TimePoint;
pub use timer::{Clock, MonotonicClock, Timer, WallClock, WallTimer};
