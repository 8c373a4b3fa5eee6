// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

// ---- Socket Operations ----

/// Create a TCP listening socket with SO_REUSEADDR.
///
/// The epoll dispatcher asks for a non-blocking listener so a connection that
/// vanishes between readiness and `accept` cannot stall it; the io_uring
/// acceptor blocks in `accept` and wants a blocking one.
pub fn create_listen_socket(addr: &SocketAddr, backlog: c_int, nonblocking: bool) -> EtudeResult<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let mut kind = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    if nonblocking {
        kind |= libc::SOCK_NONBLOCK;
    }

    // SAFETY: plain socket(2); the descriptor is owned immediately.
    let fd = unsafe { libc::socket(domain, kind, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: `fd` is a fresh descriptor nobody else owns.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let one: c_int = 1;
    // SAFETY: option value points at a live c_int of the advertised size.
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }

    bind_addr(fd, addr)?;

    // SAFETY: listen(2) on a bound socket we own.
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(socket)
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> EtudeResult<()> {
    let res = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: `sin` is a fully initialised sockaddr_in.
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
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
            // SAFETY: `sin6` is a fully initialised sockaddr_in6.
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        }
    };

    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Accept one connection. The accepted socket is blocking regardless of the
/// listener's mode. `Ok(None)` means a non-blocking listener had nothing queued.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<OwnedFd>> {
    // SAFETY: null address out-params are allowed by accept4(2).
    let fd = unsafe { libc::accept4(listen_fd, ptr::null_mut(), ptr::null_mut(), libc::SOCK_CLOEXEC) };

    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    } else {
        // SAFETY: accept4 returned a new descriptor we now own.
        Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}

/// Errors that leave the pending connection queued until descriptors or
/// memory are released. Retrying at once fails the same way.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Ignore SIGPIPE process-wide so writes to a vanished peer surface as EPIPE.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll Operations ----

pub use libc::{EPOLLIN, epoll_event};

/// Level-triggered epoll registration set.
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        // SAFETY: plain epoll_create1(2).
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fresh descriptor.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    pub fn add(&self, fd: RawFd, token: u64, interests: c_int) -> EtudeResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };

        // SAFETY: `event` outlives the call.
        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Remove `fd`; an fd that is not registered is not an error.
    pub fn delete(&self, fd: RawFd) -> EtudeResult<()> {
        // SAFETY: a null event is permitted for EPOLL_CTL_DEL.
        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Wait for readiness; `timeout_ms < 0` blocks indefinitely. An interrupted
    /// wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: c_int) -> EtudeResult<usize> {
        // SAFETY: the kernel writes at most `events.len()` entries.
        let res = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as c_int,
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
}

// ---- Blocking connection I/O ----

/// One `read(2)`, retried only when interrupted. Returns the byte count
/// (zero at end of stream).
pub fn read_blocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for `buf.len()` writable bytes.
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Vectored write of every buffer, resuming after partial writes.
pub fn writev_all(fd: RawFd, bufs: &[&[u8]]) -> io::Result<()> {
    let mut pending: Vec<&[u8]> = bufs.iter().copied().filter(|b| !b.is_empty()).collect();
    let mut first = 0;

    while first < pending.len() {
        let iovecs: Vec<libc::iovec> = pending[first..]
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut c_void,
                iov_len: b.len(),
            })
            .collect();

        // SAFETY: every iovec points into a slice borrowed for this call.
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as c_int) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if res == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        let mut written = res as usize;
        while first < pending.len() && written >= pending[first].len() {
            written -= pending[first].len();
            first += 1;
        }
        if first < pending.len() {
            pending[first] = &pending[first][written..];
        }
    }
    Ok(())
}
