// src/syscalls.rs
use crate::error::ServerResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

pub use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};

/// Pending-connection queue length for the listening socket.
pub const LISTEN_BACKLOG: c_int = 1024;

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
///
/// With `linger` set, closing a connection waits up to one second for
/// unsent data to drain instead of discarding it.
pub fn create_listen_socket(addr: &SocketAddr, linger: bool) -> ServerResult<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if linger {
            let opt = libc::linger {
                l_onoff: 1,
                l_linger: 1,
            };
            if let Err(e) = set_opt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &opt) {
                libc::close(fd);
                return Err(e.into());
            }
        }

        let one: c_int = 1;
        if let Err(e) = set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one) {
            libc::close(fd);
            return Err(e.into());
        }

        bind_addr(fd, addr)?;

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn set_opt<T>(fd: c_int, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Bind a socket to an address. Closes `fd` on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> ServerResult<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    unsafe {
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }
    Ok(())
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Address a bound socket is listening on (resolves port 0).
pub fn local_addr(fd: RawFd) -> ServerResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    raw_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family").into())
}

/// Accept one pending connection as a non-blocking socket.
/// `Ok(None)` once the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> ServerResult<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            // A peer that reset before we got to it is not a listener failure.
            _ if err.raw_os_error() == Some(libc::ECONNABORTED) => Ok(None),
            _ => Err(err.into()),
        };
    }

    let addr = raw_to_socket_addr(&storage)
        .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
    Ok(Some((fd, addr)))
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

/// Thin owner of an epoll instance and its ready-event array.
pub struct Epoll {
    fd: c_int,
    events: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new(max_events: usize) -> ServerResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Register `fd` with the given interest mask. The descriptor itself is
    /// stored as the event token.
    pub fn add(&self, fd: RawFd, interests: i32) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interests)
    }

    pub fn modify(&self, fd: RawFd, interests: i32) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interests)
    }

    pub fn delete(&self, fd: RawFd) -> ServerResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, interests: i32) -> ServerResult<()> {
        let mut event = libc::epoll_event {
            events: interests as u32,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Block for at most `timeout_ms` (-1 = indefinitely). Returns the number
    /// of ready descriptors; an interrupted wait reports zero.
    pub fn wait(&mut self, timeout_ms: i32) -> ServerResult<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                self.events.as_mut_ptr(),
                self.events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }
        Ok(res as usize)
    }

    /// `(fd, event mask)` of the i-th ready descriptor from the last `wait`.
    #[inline]
    pub fn ready(&self, i: usize) -> (RawFd, u32) {
        let ev = self.events[i];
        (ev.u64 as RawFd, ev.events)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

// ---- Non-blocking reads and writes ----

fn cvt(res: isize) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Single read; `Err(WouldBlock)` when nothing is pending, `Ok(0)` on EOF.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
}

/// Single write; `Err(WouldBlock)` when the kernel buffer is full.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt(unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) })
}

/// Scatter read into up to two buffers in one syscall.
pub fn readv(fd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter_mut()) {
        *iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }
    cvt(unsafe { libc::readv(fd, iovecs.as_ptr(), iov_count as c_int) })
}

/// Vectored write: write multiple buffers in a single syscall (scatter-gather I/O).
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    let mut iovecs: [libc::iovec; 4] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(4);
    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter()) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }
    cvt(unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) })
}

// ---- Wake-up pipe ----

/// Create a pipe with both ends non-blocking. Returns (read_fd, write_fd).
pub fn create_pipe() -> ServerResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Self-pipe used to pull the reactor out of `epoll_wait` from other threads.
pub struct Waker {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Waker {
    pub fn new() -> ServerResult<Self> {
        let (read_fd, write_fd) = create_pipe()?;
        Ok(Self { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// A full pipe already guarantees a pending wake-up, so EAGAIN is ignored.
    pub fn wake(&self) {
        let _ = write_nonblocking(self.write_fd, &[1u8]);
    }

    /// Swallow all pending wake-up bytes.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = read_nonblocking(self.read_fd, &mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        close_fd(self.read_fd);
        close_fd(self.write_fd);
    }
}
