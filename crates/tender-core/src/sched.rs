//! Poll/wait scheduler (part of component C4): multiplexes `solo5_yield`
//! over every attached network device's fd, per `spec.md` §4.4.
//!
//! Only the Linux backend (`epoll` + an internal `timerfd` for
//! nanosecond-resolution timeouts) is built. The BSD backend (`kqueue` +
//! `EVFILT_READ`) is modeled as a documented, unimplemented [`WaitSet`]
//! impl — this workspace targets Linux only.

use std::collections::HashMap;
use std::os::fd::RawFd;

#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("I/O error in poll/wait scheduler: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot register handle {0}: solo5 handles are limited to a 64-bit ready_set bitmap")]
    TooManyHandles(u64),
    #[error("poll/wait backend not implemented on this platform")]
    Unsupported,
}

/// A wait-set keyed by solo5 handle (manifest index). `spec.md` §4.4: "The
/// returned `ready_set` is a 64-bit bitmap over solo5 handles (hence the
/// hard limit of ≤ 64 attached devices)".
pub trait WaitSet {
    /// Registers `fd` to be watched under `handle`. `handle` must be < 64.
    fn register(&mut self, handle: u64, fd: RawFd) -> Result<(), SchedError>;

    /// Blocks until any registered fd is readable or `timeout_nsecs`
    /// elapses, then returns the ready-set bitmap.
    fn poll(&mut self, timeout_nsecs: u64) -> Result<u64, SchedError>;
}

/// Linux: one `epoll` descriptor plus an internal `timerfd` used solely to
/// bound `epoll_wait`'s timeout with nanosecond resolution (`epoll_wait`
/// itself only takes milliseconds).
pub struct LinuxEpollWaitSet {
    epfd: RawFd,
    timerfd: RawFd,
    handle_of_fd: HashMap<RawFd, u64>,
}

impl LinuxEpollWaitSet {
    pub fn new() -> Result<Self, SchedError> {
        // SAFETY: epoll_create1/timerfd_create take no pointer arguments.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::Io(std::io::Error::last_os_error()));
        }
        let timerfd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if timerfd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(SchedError::Io(err));
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: u64::MAX, // sentinel: "this is the internal timer, not a device"
        };
        // SAFETY: `epfd`/`timerfd` are freshly created valid fds; `ev` is a
        // valid, initialized `epoll_event`.
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, timerfd, &mut ev) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(timerfd);
            }
            return Err(SchedError::Io(err));
        }

        Ok(LinuxEpollWaitSet {
            epfd,
            timerfd,
            handle_of_fd: HashMap::new(),
        })
    }

    /// Exposed so `spt`'s boot-info can hand the same fds to the guest for
    /// direct `epoll_pwait`/`timerfd_settime` calls, per `spec.md` §4.4.
    pub fn epollfd(&self) -> RawFd {
        self.epfd
    }

    pub fn timerfd(&self) -> RawFd {
        self.timerfd
    }
}

impl Drop for LinuxEpollWaitSet {
    fn drop(&mut self) {
        // SAFETY: both fds are owned by this struct and not used afterward.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.timerfd);
        }
    }
}

impl WaitSet for LinuxEpollWaitSet {
    fn register(&mut self, handle: u64, fd: RawFd) -> Result<(), SchedError> {
        if handle >= 64 {
            return Err(SchedError::TooManyHandles(handle));
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: handle,
        };
        // SAFETY: `fd` is a valid, caller-owned fd; `ev` is fully initialized.
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            return Err(SchedError::Io(std::io::Error::last_os_error()));
        }
        self.handle_of_fd.insert(fd, handle);
        Ok(())
    }

    fn poll(&mut self, timeout_nsecs: u64) -> Result<u64, SchedError> {
        // OR with 1ns: an exactly-zero it_value disarms a timerfd instead
        // of firing it immediately, which would make epoll_wait block
        // forever when no other fd is ready (spec.md §4.4).
        let armed = timeout_nsecs | 1;
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (armed / 1_000_000_000) as libc::time_t,
                tv_nsec: (armed % 1_000_000_000) as i64,
            },
        };
        // SAFETY: `self.timerfd` is valid and owned by this struct; `spec`
        // is a fully initialized `itimerspec`.
        if unsafe { libc::timerfd_settime(self.timerfd, 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(SchedError::Io(std::io::Error::last_os_error()));
        }

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 64];
        loop {
            // SAFETY: `events` is a valid buffer of the given capacity.
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, -1)
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    // Linux: restart. The internal timerfd is authoritative
                    // for the timeout, so losing wall-clock time to EINTR
                    // retries is harmless.
                    continue;
                }
                return Err(SchedError::Io(err));
            }

            let mut ready = 0u64;
            for ev in &events[..n as usize] {
                if ev.u64 == u64::MAX {
                    continue; // internal timer fire, not a device
                }
                ready |= 1u64 << ev.u64;
            }
            return Ok(ready);
        }
    }
}

/// `hvt`/`spt` BSD backend: `kqueue` + `EVFILT_READ`, no internal timer
/// needed (`kevent`'s `struct timespec` timeout already has nanosecond
/// resolution). Not built on this Linux-only workspace.
pub struct KqueueWaitSet;

impl WaitSet for KqueueWaitSet {
    fn register(&mut self, _handle: u64, _fd: RawFd) -> Result<(), SchedError> {
        Err(SchedError::Unsupported)
    }

    fn poll(&mut self, _timeout_nsecs: u64) -> Result<u64, SchedError> {
        Err(SchedError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn poll_times_out_with_empty_ready_set_when_nothing_registered() {
        let mut ws = LinuxEpollWaitSet::new().unwrap();
        let ready = ws.poll(1_000_000).unwrap(); // 1ms
        assert_eq!(ready, 0);
    }

    #[test]
    fn poll_reports_a_readable_registered_fd() {
        let mut ws = LinuxEpollWaitSet::new().unwrap();
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        ws.register(3, fds[0]).unwrap();
        unsafe {
            let mut f = <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fds[1]);
            f.write_all(b"x").unwrap();
            std::mem::forget(f); // fds[1] closed explicitly below
        }
        let ready = ws.poll(1_000_000_000).unwrap();
        assert_eq!(ready, 1u64 << 3);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn rejects_handle_at_or_above_64() {
        let mut ws = LinuxEpollWaitSet::new().unwrap();
        assert!(matches!(
            ws.register(64, 0),
            Err(SchedError::TooManyHandles(64))
        ));
    }
}
