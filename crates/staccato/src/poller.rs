// src/poller.rs
//
// Thin wrappers over epoll(7) and a self-pipe. Connection descriptors are
// always armed with EPOLLONESHOT: after one event the kernel disables the
// descriptor until someone re-arms it, which is how ownership of a connection
// passes between the reactor and the workers.
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, c_int, c_void};

use crate::error::ServerResult;

/// Readiness a descriptor is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => (EPOLLIN | EPOLLRDHUP) as u32,
            Interest::Write => (EPOLLOUT | EPOLLRDHUP) as u32,
        }
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    bits: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.bits & EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & EPOLLOUT as u32 != 0
    }

    /// Error, hangup, or the peer shut down its writing half.
    pub fn is_hangup(&self) -> bool {
        self.bits & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0
    }
}

/// Reusable buffer for `Epoll::wait`.
pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(|raw| Event {
            token: raw.u64,
            bits: raw.events,
        })
    }
}

pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: epoll_create1 returned a fresh descriptor we now own.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Start watching `fd`. One-shot registrations fire once and stay
    /// disabled until `modify` re-arms them.
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest, oneshot: bool) -> ServerResult<()> {
        let mut bits = interest.bits();
        if oneshot {
            bits |= (EPOLLONESHOT | EPOLLET) as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, bits)
    }

    /// Re-arm a one-shot descriptor for exactly one more event.
    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> ServerResult<()> {
        let bits = interest.bits() | (EPOLLONESHOT | EPOLLET) as u32;
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, bits)
    }

    /// Stop watching `fd`. Already-removed descriptors are not an error.
    pub fn deregister(&self, fd: RawFd) -> ServerResult<()> {
        let res = unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, bits: u32) -> ServerResult<()> {
        let mut event = libc::epoll_event { events: bits, u64: token };
        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Wait for events; `None` blocks until one arrives. An interrupted wait
    /// returns zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> ServerResult<usize> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
            None => -1,
        };
        let res = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.raw.as_mut_ptr(),
                events.raw.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            events.len = 0;
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }
        events.len = res as usize;
        Ok(events.len)
    }
}

/// Self-pipe that lets other threads interrupt `Epoll::wait`.
pub struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub fn new() -> ServerResult<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: pipe2 succeeded and handed us two fresh descriptors.
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    /// Descriptor to register for read readiness.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn wake(&self) {
        let byte = 1u8;
        // A full pipe already guarantees a pending wakeup.
        unsafe {
            libc::write(self.write.as_raw_fd(), &byte as *const u8 as *const c_void, 1);
        }
    }

    /// Swallow pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn test_oneshot_fires_once_until_rearmed() {
        let epoll = Epoll::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        epoll.register(rx.as_raw_fd(), 7, Interest::Read, true).unwrap();

        let mut events = Events::with_capacity(8);
        tx.write_all(b"a").unwrap();
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
        let event = events.iter().next().unwrap();
        assert_eq!(event.token, 7);
        assert!(event.is_readable());
        assert!(!event.is_hangup());

        // More data, but the registration was consumed.
        tx.write_all(b"b").unwrap();
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 0);
        assert!(events.is_empty());

        epoll.modify(rx.as_raw_fd(), 8, Interest::Read).unwrap();
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
        assert_eq!(events.iter().next().unwrap().token, 8);
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 0);
    }

    #[test]
    fn test_write_interest_and_hangup() {
        let epoll = Epoll::new().unwrap();
        let (tx, rx) = UnixStream::pair().unwrap();
        epoll.register(rx.as_raw_fd(), 1, Interest::Write, true).unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
        assert!(events.iter().next().unwrap().is_writable());

        drop(tx);
        epoll.modify(rx.as_raw_fd(), 1, Interest::Read).unwrap();
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
        assert!(events.iter().next().unwrap().is_hangup());

        epoll.deregister(rx.as_raw_fd()).unwrap();
        // Removing twice is tolerated.
        epoll.deregister(rx.as_raw_fd()).unwrap();
    }

    #[test]
    fn test_level_triggered_registration_repeats() {
        let epoll = Epoll::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        epoll.register(rx.as_raw_fd(), 3, Interest::Read, false).unwrap();
        tx.write_all(b"x").unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
    }

    #[test]
    fn test_waker() {
        let epoll = Epoll::new().unwrap();
        let waker = Waker::new().unwrap();
        epoll.register(waker.fd(), u64::MAX, Interest::Read, false).unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 0);

        waker.wake();
        waker.wake();
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 1);
        assert_eq!(events.iter().next().unwrap().token, u64::MAX);

        waker.drain();
        assert_eq!(epoll.wait(&mut events, SHORT).unwrap(), 0);
    }
}
