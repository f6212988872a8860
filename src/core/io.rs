// src/core/io.rs

//! Thin wrappers around nonblocking socket syscalls.
//!
//! Every read and write in the daemon goes through these helpers so that
//! `WouldBlock` is surfaced as normal control flow (`IoOutcome::WouldBlock`)
//! instead of an error, and a peer's orderly shutdown is surfaced as
//! `IoOutcome::Closed` instead of a zero-length read.

use crate::core::EmberlinkError;
use std::io::{Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::FromRawFd;
use tracing::warn;

/// The outcome of a single nonblocking socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The operation transferred this many bytes (never zero).
    Transferred(usize),
    /// The socket buffer is empty (read) or full (write); retry next tick.
    WouldBlock,
    /// The peer performed an orderly shutdown.
    Closed,
}

/// Reads from a nonblocking stream into `buf`.
pub fn try_read(stream: &mut TcpStream, buf: &mut [u8]) -> Result<IoOutcome, EmberlinkError> {
    match stream.read(buf) {
        Ok(0) => Ok(IoOutcome::Closed),
        Ok(n) => Ok(IoOutcome::Transferred(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(IoOutcome::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// Writes to a nonblocking stream from `buf`.
pub fn try_write(stream: &mut TcpStream, buf: &[u8]) -> Result<IoOutcome, EmberlinkError> {
    match stream.write(buf) {
        Ok(0) => Ok(IoOutcome::Closed),
        Ok(n) => Ok(IoOutcome::Transferred(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(IoOutcome::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// Creates a nonblocking listening socket the explicit way: create, set
/// `SO_REUSEADDR`, set nonblocking, bind, listen with a small backlog.
///
/// Each step is reported separately so a failure log names exactly which
/// syscall went wrong. A `SO_REUSEADDR` failure is only warned about; the
/// socket is still usable. Every other failure is fatal to the caller.
pub fn listen_nonblocking(host: &str, port: u16, backlog: i32) -> Result<TcpListener, EmberlinkError> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| EmberlinkError::Internal(format!("cannot resolve '{host}:{port}'")))?;

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    // SAFETY: plain syscalls on a fd we own; the fd is either closed on the
    // error paths below or handed to TcpListener, which owns it from then on.
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(socket_step_error("creation"));
        }

        let enable: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &enable as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            // We can still continue without address reuse.
            warn!("Socket reuseaddr: errno {}", last_errno());
        }

        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            let err = socket_step_error("non-blocking");
            libc::close(fd);
            return Err(err);
        }

        let (storage, len) = sockaddr_from(&addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) != 0 {
            let err = socket_step_error("bind");
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) != 0 {
            let err = socket_step_error("listen");
            libc::close(fd);
            return Err(err);
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn socket_step_error(step: &str) -> EmberlinkError {
    let e = std::io::Error::last_os_error();
    EmberlinkError::Internal(format!("Socket {step}: errno {}", e.raw_os_error().unwrap_or(0)))
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed sockaddr_storage is a valid all-zero pattern.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // SAFETY: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Helper to check for non-critical disconnection errors.
pub fn is_normal_disconnect(e: &EmberlinkError) -> bool {
    matches!(e, EmberlinkError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
