use std::io;
use std::mem;
use std::net::{SocketAddrV4, TcpStream};
use std::os::unix::io::{FromRawFd, RawFd};

use libc::{c_int, c_void, sockaddr_in, socklen_t, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_STREAM};

use super::fd::FileDesc;

/// Create a non-blocking IPv4 TCP socket and start an asynchronous `connect`.
///
/// Returns the stream regardless of whether the connect finished immediately
/// or is still in progress (`EINPROGRESS`/`EAGAIN`); the caller waits for
/// writability and then checks `take_socket_error` to learn the outcome.
pub fn connect_nonblocking(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let fd = syscall!(socket(
        libc::AF_INET,
        SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC,
        0
    ))?;
    let desc = unsafe { FileDesc::new(fd) };

    let sockaddr = to_sockaddr_in(addr);

    let res = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const sockaddr_in as *const libc::sockaddr,
            mem::size_of::<sockaddr_in>() as socklen_t,
        )
    };

    if res < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => {}
            _ => return Err(err),
        }
    }

    let fd = std::os::unix::io::IntoRawFd::into_raw_fd(desc);
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

/// Read back `SO_ERROR` on a socket that just became writable after a
/// non-blocking `connect`. `Ok(())` means the connection succeeded.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len
    ))?;

    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

fn to_sockaddr_in(addr: SocketAddrV4) -> sockaddr_in {
    sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}
