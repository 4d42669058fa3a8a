//! Unix datagram sockets used as the fd transport between restored tasks.
//!
//! Every non-owner of a shared file binds an abstract socket named after
//! its pid and the fd number it waits for. The owner computes the same
//! name and sends the descriptor there.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use crate::criu::options::transport_prefix;
use crate::criu::scm;

/// Build the abstract address of the transport for (`pid`, `fd`).
///
/// A name that doesn't fit the abstract namespace is an error: cutting it
/// short could make two transports collide.
pub fn transport_name_gen(pid: i32, fd: i64) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let name = format!("{}-{}-{}", transport_prefix(), pid, fd);
    if name.len() > addr.sun_path.len() - 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("transport name {} too long", name),
        ));
    }
    let name = name.as_bytes();

    // Leading NUL puts the name in the abstract namespace.
    addr.sun_path[0] = 0;
    for (dst, src) in addr.sun_path[1..].iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }

    let len = mem::size_of::<libc::sa_family_t>() + 1 + name.len();
    Ok((addr, len as libc::socklen_t))
}

/// Printable form of an abstract address, for logs.
pub fn transport_name(addr: &libc::sockaddr_un, len: libc::socklen_t) -> String {
    let n = len as usize - mem::size_of::<libc::sa_family_t>();
    let bytes: Vec<u8> = addr.sun_path[1..n].iter().map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn socket_dgram() -> io::Result<OwnedFd> {
    let sock = unsafe { libc::socket(libc::PF_UNIX, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

/// Create the datagram socket a non-owner receives (`pid`, `fd`) on.
pub fn open_transport_sock(pid: i32, fd: i64) -> io::Result<OwnedFd> {
    let sock = socket_dgram()?;
    let (saddr, len) = transport_name_gen(pid, fd)?;

    let ret = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &saddr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        log::error!("Can't bind unix socket {}: {}", transport_name(&saddr, len), err);
        return Err(err);
    }

    Ok(sock)
}

/// Send `fd` from `sock` to the transport of (`pid`, `peer_fd`).
pub fn send_fd_to(sock: RawFd, pid: i32, peer_fd: i64, fd: RawFd) -> io::Result<()> {
    let (saddr, len) = transport_name_gen(pid, peer_fd)?;
    log::info!("Send fd {} to {}", fd, transport_name(&saddr, len));
    scm::send_fd(sock, &saddr, len, fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_transport_name_is_deterministic() {
        let (a, alen) = transport_name_gen(10, 3).unwrap();
        let (b, blen) = transport_name_gen(10, 3).unwrap();
        assert_eq!(alen, blen);
        assert_eq!(a.sun_path[..alen as usize - 2], b.sun_path[..blen as usize - 2]);
        assert_eq!(a.sun_path[0], 0);
        assert_eq!(transport_name(&a, alen), "crust-fd-10-3");

        let (_, clen) = transport_name_gen(10, 30).unwrap();
        assert_eq!(clen, alen + 1);
    }

    #[test]
    fn test_send_to_bound_transport() {
        // Unique name: this test process's pid and an fd number nobody else uses.
        let me = std::process::id() as i32;
        let rx = open_transport_sock(me, 90001).unwrap();
        let tx = socket_dgram().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"x").unwrap();

        send_fd_to(tx.as_raw_fd(), me, 90001, file.as_raw_fd()).unwrap();
        let got = scm::recv_fd(rx.as_raw_fd()).unwrap();
        assert!(got.as_raw_fd() >= 0);

        // Binding the same name twice fails.
        assert!(open_transport_sock(me, 90001).is_err());
    }
}
