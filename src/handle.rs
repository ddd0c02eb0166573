//! Owned kernel descriptors.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Exclusive owner of a kernel file descriptor.
///
/// A valid handle holds a positive descriptor; an empty (defaulted or
/// taken-from) handle holds zero and releases nothing. The descriptor
/// is closed on every exit path of the owning scope.
#[derive(Debug, Default)]
pub struct SystemHandle {
    fd: RawFd,
}

impl SystemHandle {
    /// Wrap an already-open descriptor.
    pub fn new(fd: RawFd) -> SystemHandle {
        debug_assert!(fd >= 0, "descriptor must be non-negative");
        SystemHandle { fd }
    }

    /// Run `factory` (typically a thin closure over one kernel call)
    /// and take ownership of the descriptor it returns. A return value
    /// of -1 fails with the last OS error.
    pub fn from_factory<F>(factory: F) -> Result<SystemHandle>
    where
        F: FnOnce() -> libc::c_int,
    {
        let fd = factory();
        if fd == -1 {
            return Err(Error::last_os_error());
        }
        Ok(SystemHandle { fd })
    }

    /// The raw descriptor, for kernel calls. Stays owned by `self`.
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Whether the handle currently owns a descriptor.
    pub fn is_open(&self) -> bool {
        self.fd > 0
    }

    /// Close the descriptor if open. Calling `close` again is a no-op.
    pub fn close(&mut self) {
        if self.is_open() {
            unsafe {
                libc::close(self.fd);
            }
        }
        self.fd = 0;
    }

    /// Move the descriptor out, leaving `self` empty.
    pub fn take(&mut self) -> SystemHandle {
        std::mem::take(self)
    }
}

impl Drop for SystemHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_eventfd() -> SystemHandle {
        SystemHandle::from_factory(|| unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) })
            .expect("eventfd")
    }

    #[test]
    fn factory_failure_reports_errno() {
        let path = b"/nonexistent/spindle\0";
        let err = SystemHandle::from_factory(|| unsafe {
            libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY)
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn close_is_idempotent() {
        let mut h = new_eventfd();
        assert!(h.is_open());
        h.close();
        assert!(!h.is_open());
        h.close();
        assert!(!h.is_open());
    }

    #[test]
    fn take_leaves_source_empty() {
        let mut a = new_eventfd();
        let fd = a.raw();
        let b = a.take();
        assert!(!a.is_open());
        assert!(b.is_open());
        assert_eq!(b.raw(), fd);
        // Dropping the empty source must not close b's descriptor.
        drop(a);
        let rc = unsafe { libc::fcntl(b.raw(), libc::F_GETFD) };
        assert_ne!(rc, -1);
    }

    #[test]
    fn default_is_empty() {
        let h = SystemHandle::default();
        assert!(!h.is_open());
    }
}
