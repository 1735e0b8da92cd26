//! Event-bus sockets.
//!
//! [`EventSocket`] is the seam between the pump and the kernel. The production
//! implementation is a `NETLINK_KOBJECT_UEVENT` socket; any datagram socket
//! (for example one half of a `UnixDatagram::pair`) can stand in for it.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ConfigurationError;

use super::bpf::FilterProgram;

/// Logical event bus a monitor listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Events re-broadcast by udevd after rule processing.
    Udev,
    /// Raw kernel uevents.
    Kernel,
}

impl EventSource {
    /// Name accepted by `FromStr`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Udev => "udev",
            Self::Kernel => "kernel",
        }
    }

    /// Netlink multicast group of the bus.
    #[must_use]
    pub const fn group(self) -> u32 {
        match self {
            Self::Kernel => 1,
            Self::Udev => 2,
        }
    }
}

impl FromStr for EventSource {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udev" => Ok(Self::Udev),
            "kernel" => Ok(Self::Kernel),
            other => Err(ConfigurationError::UnknownSource {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A datagram of this many bytes is in the buffer.
    Datagram(usize),
    /// A datagram was consumed but must be ignored.
    Rejected(&'static str),
}

/// A datagram socket the event pump can read from.
///
/// All receives are single, non-blocking calls once `set_nonblocking(true)`
/// has been applied; an empty queue surfaces as `ErrorKind::WouldBlock`.
pub trait EventSocket: AsRawFd + Send + Sync + fmt::Debug {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Start delivery of bus traffic to this socket.
    fn enable_receiving(&self) -> io::Result<()> {
        Ok(())
    }

    fn set_receive_buffer_size(&self, bytes: usize) -> io::Result<()> {
        setsockopt_int(self.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, bytes)
    }

    /// Attach `program`, or detach any filter when `None`.
    fn install_filter(&self, program: Option<&FilterProgram>) -> io::Result<()> {
        match program {
            Some(program) => attach_filter(self.as_raw_fd(), program),
            None => detach_filter(self.as_raw_fd()),
        }
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Received>;
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: usize) -> io::Result<()> {
    let value = libc::c_int::try_from(value).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn attach_filter(fd: RawFd, program: &FilterProgram) -> io::Result<()> {
    let instructions = program.instructions();
    let len = u16::try_from(instructions.len()).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fprog = libc::sock_fprog {
        len,
        // The kernel copies the program and never writes through this pointer.
        filter: instructions.as_ptr().cast_mut().cast::<libc::sock_filter>(),
    };
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            std::ptr::addr_of!(fprog).cast(),
            mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn detach_filter(fd: RawFd) -> io::Result<()> {
    let dummy: libc::c_int = 0;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_DETACH_FILTER,
            std::ptr::addr_of!(dummy).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // No filter attached: nothing to detach.
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
    }
    Ok(())
}

/// A `NETLINK_KOBJECT_UEVENT` socket bound to one [`EventSource`].
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    source: EventSource,
    bound: AtomicBool,
}

impl NetlinkSocket {
    /// Create an unbound socket. Nothing is received until
    /// [`EventSocket::enable_receiving`].
    ///
    /// # Errors
    ///
    /// Returns the OS error from `socket(2)`.
    pub fn open(source: EventSource) -> io::Result<Self> {
        let raw = cvt(unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Ok(Self {
            fd,
            source,
            bound: AtomicBool::new(false),
        })
    }

    /// Event bus this socket listens on.
    #[must_use]
    pub const fn source(&self) -> EventSource {
        self.source
    }

    fn check_sender(&self, addr: &libc::sockaddr_nl, creds: Option<&libc::ucred>) -> Option<&'static str> {
        if addr.nl_groups == 0 {
            return Some("unicast message");
        }
        match self.source {
            EventSource::Kernel if addr.nl_pid != 0 => return Some("kernel event from user space"),
            EventSource::Udev if addr.nl_pid == 0 => return Some("udev event from the kernel"),
            _ => {}
        }
        match creds {
            None => Some("missing sender credentials"),
            Some(c) if c.uid != 0 => Some("sender is not root"),
            Some(_) => None,
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl EventSocket for NetlinkSocket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.as_raw_fd();
        let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
        Ok(())
    }

    fn enable_receiving(&self) -> io::Result<()> {
        if self.bound.load(Ordering::Acquire) {
            return Ok(());
        }

        let fd = self.as_raw_fd();
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_PASSCRED, 1)?;

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = self.source.group();
        cvt(unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        })?;

        self.bound.store(true, Ordering::Release);
        tracing::debug!(source = %self.source, group = self.source.group(), "Bound uevent socket");
        Ok(())
    }

    fn set_receive_buffer_size(&self, bytes: usize) -> io::Result<()> {
        let fd = self.as_raw_fd();
        // SO_RCVBUFFORCE needs CAP_NET_ADMIN.
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUFFORCE, bytes)
            .or_else(|_| setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, bytes))
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Received> {
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // Room for one SCM_CREDENTIALS message, 8-byte aligned.
        let mut control = [0u64; 8];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = std::ptr::addr_of_mut!(addr).cast();
        msg.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as _;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let n = unsafe { libc::recvmsg(self.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = usize::try_from(n).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

        if msg.msg_flags & libc::MSG_TRUNC != 0 {
            return Ok(Received::Rejected("truncated datagram"));
        }

        let mut creds = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
                    creds = Some(std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::ucred>()));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if let Some(reason) = self.check_sender(&addr, creds.as_ref()) {
            return Ok(Received::Rejected(reason));
        }
        Ok(Received::Datagram(n))
    }
}

impl EventSocket for UnixDatagram {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixDatagram::set_nonblocking(self, nonblocking)
    }

    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Received> {
        // MSG_TRUNC makes recv report the full length of a longer datagram.
        let n = unsafe { libc::recv(self.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), libc::MSG_TRUNC) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = usize::try_from(n).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
        if n > buf.len() {
            return Ok(Received::Rejected("truncated datagram"));
        }
        Ok(Received::Datagram(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UeventBuilder;
    use crate::monitor::filter::FilterCriterion;

    #[test]
    fn parses_source_names() {
        assert_eq!("udev".parse::<EventSource>().unwrap(), EventSource::Udev);
        assert_eq!("kernel".parse::<EventSource>().unwrap(), EventSource::Kernel);
        assert!(matches!(
            "usb".parse::<EventSource>(),
            Err(ConfigurationError::UnknownSource { .. })
        ));
        assert_eq!(EventSource::Udev.group(), 2);
        assert_eq!(EventSource::Kernel.to_string(), "kernel");
    }

    #[test]
    fn oversized_unix_datagram_is_rejected() {
        let (rx, tx) = UnixDatagram::pair().unwrap();
        tx.send(&[b'x'; 64]).unwrap();
        tx.send(b"short").unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(rx.recv_datagram(&mut buf).unwrap(), Received::Rejected(_)));
        assert!(matches!(rx.recv_datagram(&mut buf).unwrap(), Received::Datagram(5)));
        assert_eq!(&buf[..5], b"short");
    }

    #[test]
    fn detach_without_filter_is_a_noop() {
        let (rx, _tx) = UnixDatagram::pair().unwrap();
        rx.install_filter(None).unwrap();
    }

    #[test]
    fn attached_filter_drops_in_kernel() {
        let (rx, tx) = UnixDatagram::pair().unwrap();
        let program = FilterProgram::compile(&[FilterCriterion::Subsystem {
            subsystem: "net".to_string(),
            devtype: None,
        }])
        .unwrap()
        .unwrap();
        rx.install_filter(Some(&program)).unwrap();
        EventSocket::set_nonblocking(&rx, true).unwrap();

        let block = UeventBuilder::event("add", "/devices/virtual/block/loop0", "block").encode_udev();
        let net = UeventBuilder::event("add", "/devices/virtual/net/dummy0", "net").encode_udev();
        tx.send(&block).unwrap();
        tx.send(&net).unwrap();

        let mut buf = [0u8; 8192];
        assert_eq!(rx.recv_datagram(&mut buf).unwrap(), Received::Datagram(net.len()));
        assert_eq!(
            rx.recv_datagram(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn rejects_foreign_senders() {
        let Ok(socket) = NetlinkSocket::open(EventSource::Kernel) else {
            return;
        };
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let root = libc::ucred { pid: 1, uid: 0, gid: 0 };
        let user = libc::ucred { pid: 1, uid: 1000, gid: 1000 };

        assert_eq!(socket.check_sender(&addr, Some(&root)), Some("unicast message"));

        addr.nl_groups = 1;
        assert_eq!(socket.check_sender(&addr, Some(&root)), None);
        assert_eq!(socket.check_sender(&addr, Some(&user)), Some("sender is not root"));
        assert_eq!(socket.check_sender(&addr, None), Some("missing sender credentials"));

        addr.nl_pid = 42;
        assert_eq!(
            socket.check_sender(&addr, Some(&root)),
            Some("kernel event from user space")
        );
    }
}
