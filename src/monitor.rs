//! Kernel readiness monitoring.
//!
//! [`EventMonitor`] wraps an epoll descriptor plus an eventfd
//! *interrupter*. Event sources register edge-triggered interest with
//! a callback; `wait` translates each ready entry into a callback
//! invocation on the scheduler thread. The interrupter is registered
//! under a reserved token and lets any thread break a blocking wait.

use std::cell::RefCell;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bitflags::bitflags;
use log::{debug, trace};
use slab::Slab;

use crate::error::{Error, Result};
use crate::handle::SystemHandle;
use crate::scheduler::Scheduler;

bitflags! {
    /// Readiness bits delivered to event-source callbacks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR    = 0b100;
    }
}

impl EventFlags {
    fn from_epoll(events: u32) -> EventFlags {
        let mut flags = EventFlags::empty();
        if events & libc::EPOLLIN as u32 != 0 {
            flags |= EventFlags::READABLE;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            flags |= EventFlags::WRITABLE;
        }
        // The kernel reports HUP whether or not it was asked for; fold
        // it into the error bit so error-only consumers see peer loss.
        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            flags |= EventFlags::ERROR;
        }
        flags
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0u32;
        if self.contains(EventFlags::READABLE) {
            events |= libc::EPOLLIN as u32;
        }
        if self.contains(EventFlags::WRITABLE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

pub(crate) type Callback = Rc<dyn Fn(&Scheduler, EventFlags)>;

// Token of the interrupter itself; never allocated to a source.
const WAKE_TOKEN: u64 = u64::MAX;

const WAIT_BATCH: usize = 128;

/// The kernel readiness object plus the interrupter that wakes a
/// blocked wait.
///
/// Created lazily by [`Scheduler::event_monitor`] and shared by the
/// event sources bound to that scheduler; the scheduler itself holds
/// only a weak reference, so the monitor lives exactly as long as some
/// source needs it.
pub struct EventMonitor {
    epoll: SystemHandle,
    interrupter: SystemHandle,
    registry: RefCell<Slab<Callback>>,
}

// The registry and `wait` are confined to the thread owning the
// scheduler; the only operation other threads may reach is
// `interrupt`, which touches nothing but the eventfd descriptor.
unsafe impl Send for EventMonitor {}
unsafe impl Sync for EventMonitor {}

impl EventMonitor {
    pub(crate) fn new() -> Result<EventMonitor> {
        let epoll = SystemHandle::from_factory(|| unsafe {
            libc::epoll_create1(libc::EPOLL_CLOEXEC)
        })?;
        let interrupter = SystemHandle::from_factory(|| unsafe {
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        })?;

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_TOKEN,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.raw(),
                libc::EPOLL_CTL_ADD,
                interrupter.raw(),
                &mut event,
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        debug!(
            "event monitor up (epoll fd {}, interrupter fd {})",
            epoll.raw(),
            interrupter.raw()
        );
        Ok(EventMonitor {
            epoll,
            interrupter,
            registry: RefCell::new(Slab::new()),
        })
    }

    /// Wake the owning thread out of a blocking [`wait`](Self::wait).
    /// Safe from any thread.
    ///
    /// `EAGAIN` means the eventfd counter is saturated, i.e. a wake is
    /// already pending; any other failure is logged, as there is no
    /// caller that could act on it.
    pub fn interrupt(&self) {
        let token: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.interrupter.raw(),
                &token as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                debug!("interrupter write failed: {}", err);
            }
        }
    }

    /// Wait for readiness and invoke the registered callbacks, passing
    /// `sched` through. Blocks until something is ready when
    /// `blocking`; otherwise drains whatever is ready and returns.
    ///
    /// Must be called on the scheduler's thread; interrupted waits
    /// (`EINTR`) are retried transparently.
    pub fn wait(&self, sched: &Scheduler, blocking: bool) -> Result<()> {
        let timeout = if blocking { -1 } else { 0 };
        let mut events: [libc::epoll_event; WAIT_BATCH] = unsafe { mem::zeroed() };
        let ready = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.raw(),
                    events.as_mut_ptr(),
                    WAIT_BATCH as libc::c_int,
                    timeout,
                )
            };
            if rc != -1 {
                break rc as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::Sys(err));
            }
        };

        trace!("wait returned {} ready entries", ready);
        for event in &events[..ready] {
            let token = event.u64;
            if token == WAKE_TOKEN {
                self.drain_interrupter();
                continue;
            }
            // Clone the callback out so it may deregister itself or
            // register new sources while running.
            let callback = self.registry.borrow().get(token as usize).cloned();
            if let Some(callback) = callback {
                callback(sched, EventFlags::from_epoll(event.events));
            }
        }
        Ok(())
    }

    /// Register `fd` for edge-triggered `interest`; the returned token
    /// identifies the registration.
    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: EventFlags,
        callback: Callback,
    ) -> Result<usize> {
        let token = self.registry.borrow_mut().insert(callback);
        let mut event = libc::epoll_event {
            events: interest.to_epoll() | libc::EPOLLET as u32,
            u64: token as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.raw(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc == -1 {
            self.registry.borrow_mut().try_remove(token);
            return Err(Error::last_os_error());
        }
        trace!("registered fd {} as token {} ({:?})", fd, token, interest);
        Ok(token)
    }

    /// Drop a registration made by [`register`](Self::register).
    pub(crate) fn deregister(&self, token: usize, fd: RawFd) {
        self.registry.borrow_mut().try_remove(token);
        let rc = unsafe {
            libc::epoll_ctl(
                self.epoll.raw(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rc == -1 {
            debug!(
                "EPOLL_CTL_DEL for fd {} failed: {}",
                fd,
                std::io::Error::last_os_error()
            );
        }
        trace!("deregistered fd {} (token {})", fd, token);
    }

    fn drain_interrupter(&self) {
        let mut token: u64 = 0;
        // Edge-triggered, but one read clears the counter entirely.
        let rc = unsafe {
            libc::read(
                self.interrupter.raw(),
                &mut token as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                debug!("interrupter drain failed: {}", err);
            }
        }
    }
}
