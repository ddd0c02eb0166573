//! Event sources: kernel handles bound to a scheduler.
//!
//! A source ties a [`SystemHandle`] to callbacks delivered through the
//! scheduler's event monitor. Registration is edge-triggered: after a
//! readiness callback, user code must drain the device until it would
//! block, or the next transition is never reported. The source keeps
//! the registration alive; dropping it deregisters, then closes the
//! device.

use std::rc::Rc;

use crate::error::Result;
use crate::handle::SystemHandle;
use crate::monitor::{Callback, EventFlags, EventMonitor};
use crate::scheduler::Scheduler;

/// Receiver for a plain (read-triggered) event source.
///
/// Callbacks run on the scheduler's thread, from inside the event
/// monitor's wait; `sched` is the scheduler driving that wait.
pub trait EventSink: 'static {
    fn on_emit(&self, sched: &Scheduler) {
        let _ = sched;
    }

    fn on_error(&self, sched: &Scheduler) {
        let _ = sched;
    }
}

/// Receiver for an I/O event source registered for reads, writes, or
/// both.
pub trait IoEventSink: 'static {
    fn on_readable(&self, sched: &Scheduler) {
        let _ = sched;
    }

    fn on_writable(&self, sched: &Scheduler) {
        let _ = sched;
    }

    fn on_error(&self, sched: &Scheduler) {
        let _ = sched;
    }
}

/// Which readiness transitions an [`IoEventSource`] subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IoMode {
    fn interest(self) -> EventFlags {
        match self {
            IoMode::ReadOnly => EventFlags::READABLE,
            IoMode::WriteOnly => EventFlags::WRITABLE,
            IoMode::ReadWrite => EventFlags::READABLE | EventFlags::WRITABLE,
        }
    }
}

/// A device registered for edge-triggered read readiness, delivering
/// `on_emit` / `on_error` to its sink.
///
/// The sink is held weakly: once the caller drops the last `Rc`, the
/// source stops delivering (deregister still requires dropping the
/// source itself).
pub struct EventSource {
    monitor: std::sync::Arc<EventMonitor>,
    device: SystemHandle,
    token: usize,
}

impl EventSource {
    pub fn new<S: EventSink>(
        sched: &Scheduler,
        device: SystemHandle,
        sink: &Rc<S>,
    ) -> Result<EventSource> {
        let monitor = sched.event_monitor()?;
        let weak = Rc::downgrade(sink);
        let callback: Callback = Rc::new(move |sched: &Scheduler, events: EventFlags| {
            if let Some(sink) = weak.upgrade() {
                if events.contains(EventFlags::ERROR) {
                    sink.on_error(sched);
                }
                if events.contains(EventFlags::READABLE) {
                    sink.on_emit(sched);
                }
            }
        });
        let token = monitor.register(device.raw(), EventFlags::READABLE, callback)?;
        Ok(EventSource {
            monitor,
            device,
            token,
        })
    }

    pub fn device(&self) -> &SystemHandle {
        &self.device
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.monitor.deregister(self.token, self.device.raw());
    }
}

/// A device registered for edge-triggered I/O readiness, delivering
/// `on_readable` / `on_writable` / `on_error` per its [`IoMode`].
pub struct IoEventSource {
    monitor: std::sync::Arc<EventMonitor>,
    device: SystemHandle,
    token: usize,
}

impl IoEventSource {
    pub fn new<S: IoEventSink>(
        sched: &Scheduler,
        device: SystemHandle,
        mode: IoMode,
        sink: &Rc<S>,
    ) -> Result<IoEventSource> {
        let monitor = sched.event_monitor()?;
        let weak = Rc::downgrade(sink);
        let callback: Callback = Rc::new(move |sched: &Scheduler, events: EventFlags| {
            if let Some(sink) = weak.upgrade() {
                if events.contains(EventFlags::ERROR) {
                    sink.on_error(sched);
                }
                if events.contains(EventFlags::READABLE) {
                    sink.on_readable(sched);
                }
                if events.contains(EventFlags::WRITABLE) {
                    sink.on_writable(sched);
                }
            }
        });
        let token = monitor.register(device.raw(), mode.interest(), callback)?;
        Ok(IoEventSource {
            monitor,
            device,
            token,
        })
    }

    pub fn device(&self) -> &SystemHandle {
        &self.device
    }
}

impl Drop for IoEventSource {
    fn drop(&mut self) {
        self.monitor.deregister(self.token, self.device.raw());
    }
}
