//! Readiness multiplexing.
//!
//! The pump never blocks in a receive. It suspends in
//! [`ReadinessMultiplexer::wait`] until the socket becomes readable, then
//! drains it. Registrations are edge-triggered, so a caller that stops
//! draining before `WouldBlock` will not be woken for the remainder.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::{WatchError, WatchResult};

/// Maximum number of readiness events collected per wait.
pub const EVENTS_PER_WAIT: usize = 32;

const WAKER_TOKEN: u64 = u64::MAX;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// What a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Data to read.
    Readable,
    /// Room to write.
    Writable,
    /// Either.
    ReadWrite,
}

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollTimeout {
    /// Return at once.
    Immediate,
    /// Block for at most this many milliseconds.
    Millis(u32),
    /// Block until an event, a wake or a signal.
    #[default]
    Never,
}

impl PollTimeout {
    /// Map the classic poll convention: negative blocks, zero returns at once.
    #[must_use]
    pub fn from_millis(ms: i32) -> Self {
        match u32::try_from(ms) {
            Err(_) => Self::Never,
            Ok(0) => Self::Immediate,
            Ok(n) => Self::Millis(n),
        }
    }

    fn as_epoll(self) -> libc::c_int {
        match self {
            Self::Immediate => 0,
            Self::Millis(n) => libc::c_int::try_from(n).unwrap_or(libc::c_int::MAX),
            Self::Never => -1,
        }
    }
}

/// One readiness notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Interrupts a blocked [`ReadinessMultiplexer::wait`] from another thread.
pub trait Wake: Send + Sync + fmt::Debug {
    /// Interrupt a blocked wait.
    fn wake(&self) -> io::Result<()>;
}

/// OS readiness facility.
pub trait ReadinessMultiplexer: Send {
    /// Register `fd`.
    ///
    /// # Errors
    ///
    /// `WatchError::ResourceExhausted` when no registration slot is left,
    /// `WatchError::Io` for anything else.
    fn register(&mut self, fd: RawFd, interest: Interest) -> WatchResult<Token>;

    /// Remove a registration. Unknown tokens are an error.
    fn deregister(&mut self, token: Token) -> io::Result<()>;

    /// Block per `timeout` and fill `ready`. An interrupted wait returns `Ok`
    /// with `ready` empty.
    fn wait(&mut self, timeout: PollTimeout, ready: &mut Vec<Readiness>) -> io::Result<()>;

    /// Handle that interrupts `wait`, if the facility supports one.
    fn waker(&self) -> Option<Arc<dyn Wake>> {
        None
    }
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// `eventfd`-backed waker.
#[derive(Debug)]
struct EventFdWaker {
    fd: OwnedFd,
}

impl EventFdWaker {
    fn new() -> io::Result<Self> {
        let raw = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    fn reset(&self) {
        let mut value: u64 = 0;
        // Non-blocking; an already-zero counter returns EAGAIN.
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                std::ptr::addr_of_mut!(value).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Wake for EventFdWaker {
    fn wake(&self) -> io::Result<()> {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake is already pending.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Linux `epoll` multiplexer with a bounded number of registrations.
pub struct EpollMultiplexer {
    epfd: OwnedFd,
    waker: Arc<EventFdWaker>,
    capacity: usize,
    registered: HashMap<Token, RawFd>,
    next_token: u64,
    events: Vec<libc::epoll_event>,
}

impl EpollMultiplexer {
    /// Create a multiplexer accepting at most `capacity` registrations.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `epoll_create1(2)` or `eventfd(2)`.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let raw = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };
        let waker = Arc::new(EventFdWaker::new()?);

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKER_TOKEN,
        };
        cvt(unsafe { libc::epoll_ctl(epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, waker.fd.as_raw_fd(), &mut ev) })?;

        Ok(Self {
            epfd,
            waker,
            capacity,
            registered: HashMap::new(),
            next_token: 0,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; EVENTS_PER_WAIT],
        })
    }

    /// Maximum number of registrations.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

impl fmt::Debug for EpollMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollMultiplexer")
            .field("epfd", &self.epfd)
            .field("capacity", &self.capacity)
            .field("registered", &self.registered.len())
            .finish_non_exhaustive()
    }
}

impl ReadinessMultiplexer for EpollMultiplexer {
    fn register(&mut self, fd: RawFd, interest: Interest) -> WatchResult<Token> {
        if self.registered.len() >= self.capacity {
            return Err(WatchError::ResourceExhausted {
                capacity: self.capacity,
            });
        }

        let flags = match interest {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
            Interest::ReadWrite => libc::EPOLLIN | libc::EPOLLOUT,
        };
        let token = Token(self.next_token);
        let mut ev = libc::epoll_event {
            events: (flags | libc::EPOLLET) as u32,
            u64: token.0,
        };

        if let Err(e) = cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) }) {
            return Err(match e.raw_os_error() {
                Some(libc::ENOSPC | libc::ENOMEM) => WatchError::ResourceExhausted {
                    capacity: self.capacity,
                },
                _ => WatchError::Io(e),
            });
        }

        self.next_token += 1;
        self.registered.insert(token, fd);
        tracing::trace!(fd, token = token.0, "Registered descriptor");
        Ok(token)
    }

    fn deregister(&mut self, token: Token) -> io::Result<()> {
        let fd = self
            .registered
            .remove(&token)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev) })?;
        Ok(())
    }

    fn wait(&mut self, timeout: PollTimeout, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                EVENTS_PER_WAIT as libc::c_int,
                timeout.as_epoll(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for ev in self.events.iter().take(usize::try_from(n).unwrap_or(0)) {
            let data = ev.u64;
            let bits = ev.events as libc::c_int;
            if data == WAKER_TOKEN {
                self.waker.reset();
                continue;
            }
            ready.push(Readiness {
                token: Token(data),
                readable: bits & libc::EPOLLIN != 0,
                writable: bits & libc::EPOLLOUT != 0,
                error: bits & libc::EPOLLERR != 0,
                hangup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0,
            });
        }
        Ok(())
    }

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        Some(Arc::clone(&self.waker) as Arc<dyn Wake>)
    }
}
