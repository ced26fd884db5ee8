//! Raw socket operations.
//!
//! Every socket system call the crate performs routes through this module,
//! translating errno into `io::Error` at the boundary. Centralizing the
//! calls also gives the unit tests one place to inject syscall failures
//! (see [`fault`]).

use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Sentinel for "no descriptor".
pub(crate) const INVALID_SOCKET: RawFd = -1;

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Create a nonblocking stream socket matching the address family.
pub(crate) fn stream_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create a nonblocking datagram socket matching the address family.
pub(crate) fn datagram_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(domain_for(addr), Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create a nonblocking Unix-domain stream socketpair.
pub(crate) fn socket_pair() -> io::Result<(Socket, Socket)> {
    #[cfg(test)]
    fault::check(&fault::SOCKETPAIR)?;

    let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;
    Ok((a, b))
}

pub(crate) fn set_reuseaddr(socket: &Socket) -> io::Result<()> {
    #[cfg(test)]
    fault::check(&fault::SETSOCKOPT)?;

    socket.set_reuse_address(true)
}

pub(crate) fn bind(socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
    socket.bind(&SockAddr::from(*addr))
}

pub(crate) fn listen(socket: &Socket) -> io::Result<()> {
    #[cfg(test)]
    fault::check(&fault::LISTEN)?;

    socket.listen(libc::SOMAXCONN)
}

/// The socket's bound address, after `bind` resolved an ephemeral port.
pub(crate) fn local_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "socket has no inet address"))
}

/// Accept one pending connection, returning the nonblocking stream and
/// the peer address.
pub(crate) fn accept(fd: RawFd) -> io::Result<(Socket, SocketAddr)> {
    #[cfg(test)]
    fault::check(&fault::ACCEPT)?;

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let conn = unsafe {
        libc::accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if conn < 0 {
        return Err(io::Error::last_os_error());
    }

    let socket = unsafe { Socket::from_raw_fd(conn) };
    socket.set_nonblocking(true)?;

    let peer = sockaddr_to_std(&storage, len)?;
    Ok((socket, peer))
}

/// Receive into `buf`, reporting the datagram source when the kernel
/// provides one. A 0-byte read with no source is end-of-stream.
pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // Stream sockets and Unix-domain peers leave no usable address.
    let peer = if len == 0 {
        None
    } else {
        sockaddr_to_std(&storage, len).ok()
    };

    Ok((n as usize, peer))
}

/// Send on a connected socket. Uses no-SIGPIPE semantics.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send a datagram to `addr`. Uses no-SIGPIPE semantics.
pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = std_to_sockaddr(addr);
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Initiate a nonblocking connect. Returns `EINPROGRESS` (as a raw os
/// error) when the handshake continues in the background; the caller
/// waits for writability and then checks [`take_socket_error`].
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = std_to_sockaddr(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fetch and clear the socket's pending error (`SO_ERROR`), reporting it
/// as the outcome of a background connect.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    match err {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

/// Half-shut the descriptor for reads, failing any pending accept or
/// receive on it. Errors are ignored; the descriptor may already be gone.
pub(crate) fn shutdown_read(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RD);
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn raw_fd(socket: &Socket) -> RawFd {
    socket.as_raw_fd()
}

/// Convert a libc sockaddr_storage to a Rust SocketAddr.
fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            if len < mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "address too short",
                ));
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            if len < mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "address too short",
                ));
            }
            let addr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                u32::from_be(addr.sin6_flowinfo),
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Convert a Rust SocketAddr to libc sockaddr_storage.
fn std_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
            sockaddr.sin_port = v4.port().to_be();
            sockaddr.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (
                storage,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sockaddr = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sockaddr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sockaddr.sin6_port = v6.port().to_be();
            sockaddr.sin6_flowinfo = v6.flowinfo().to_be();
            sockaddr.sin6_addr.s6_addr = v6.ip().octets();
            sockaddr.sin6_scope_id = v6.scope_id();
            (
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_pair_nonblocking() {
        let _guard = fault::lock();
        let (a, b) = socket_pair().unwrap();

        let mut buf = [0u8; 8];
        let err = recv_from(raw_fd(&a), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(send(raw_fd(&b), b"x").unwrap(), 1);
        let (n, peer) = recv_from(raw_fd(&a), &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'x');
        assert!(peer.is_none());
    }

    #[test]
    fn test_socket_pair_fault() {
        let _guard = fault::lock();
        fault::arm(&fault::SOCKETPAIR, libc::EMFILE);

        let err = socket_pair().unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
    }

    #[test]
    fn test_ephemeral_bind_reports_port() {
        let _guard = fault::lock();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = stream_socket(&addr).unwrap();
        set_reuseaddr(&socket).unwrap();
        bind(&socket, &addr).unwrap();

        let bound = local_addr(&socket).unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn test_setsockopt_fault() {
        let _guard = fault::lock();
        fault::arm(&fault::SETSOCKOPT, libc::EINTR);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = stream_socket(&addr).unwrap();
        let err = set_reuseaddr(&socket).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_shutdown_read_unblocks_recv() {
        let _guard = fault::lock();
        let (a, b) = socket_pair().unwrap();

        shutdown_read(raw_fd(&a));
        let mut buf = [0u8; 8];
        let (n, peer) = recv_from(raw_fd(&a), &mut buf).unwrap();
        assert_eq!(n, 0);
        assert!(peer.is_none());
        drop(b);
    }

    #[test]
    fn test_sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, len) = std_to_sockaddr(&addr);
        let result = sockaddr_to_std(&storage, len).unwrap();
        assert_eq!(addr, result);
    }

    #[test]
    fn test_sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let (storage, len) = std_to_sockaddr(&addr);
        let result = sockaddr_to_std(&storage, len).unwrap();
        assert_eq!(addr, result);
    }
}
