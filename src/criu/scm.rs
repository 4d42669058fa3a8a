//! SCM_RIGHTS descriptor passing over unix datagram sockets.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::ptr;

pub const CR_SCM_MSG_SIZE: usize = 64;

/// One-fd message: header, one dummy payload byte and the control buffer.
#[repr(C)]
pub struct ScmFdset {
    pub hdr: libc::msghdr,
    pub iov: libc::iovec,
    pub dummy: u8,
    pub msg_buf: [u64; CR_SCM_MSG_SIZE / 8],
}

impl ScmFdset {
    pub fn new() -> Self {
        Self {
            hdr: unsafe { mem::zeroed() },
            iov: libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            },
            dummy: 0,
            msg_buf: [0u64; CR_SCM_MSG_SIZE / 8],
        }
    }
}

impl Default for ScmFdset {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire up the header for a single fd and return the cmsg data slot.
///
/// The pointers stored in `fdset.hdr` point into `fdset` itself, so it
/// must not move until the message is sent/received.
pub fn scm_fdset_init(
    fdset: &mut ScmFdset,
    saddr: Option<(&libc::sockaddr_un, libc::socklen_t)>,
) -> *mut i32 {
    const _: () = assert!(
        CR_SCM_MSG_SIZE >= unsafe { libc::CMSG_SPACE(mem::size_of::<i32>() as u32) as usize }
    );

    // At least one byte of payload, SOCK_DGRAM drops empty messages' cmsg
    fdset.iov.iov_base = &mut fdset.dummy as *mut u8 as *mut libc::c_void;
    fdset.iov.iov_len = 1;

    fdset.hdr.msg_iov = &mut fdset.iov as *mut libc::iovec;
    fdset.hdr.msg_iovlen = 1;

    match saddr {
        Some((addr, len)) => {
            fdset.hdr.msg_name = addr as *const libc::sockaddr_un as *mut libc::c_void;
            fdset.hdr.msg_namelen = len;
        }
        None => {
            fdset.hdr.msg_name = ptr::null_mut();
            fdset.hdr.msg_namelen = 0;
        }
    }

    fdset.hdr.msg_control = fdset.msg_buf.as_mut_ptr() as *mut libc::c_void;
    fdset.hdr.msg_controllen =
        unsafe { libc::CMSG_SPACE(mem::size_of::<i32>() as u32) as usize } as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&fdset.hdr) };
    unsafe {
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<i32>() as u32) as _;
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;

        libc::CMSG_DATA(cmsg) as *mut i32
    }
}

/// Send `fd` to the socket bound at `saddr`.
pub fn send_fd(
    sock: RawFd,
    saddr: &libc::sockaddr_un,
    saddr_len: libc::socklen_t,
    fd: RawFd,
) -> io::Result<()> {
    let mut fdset = ScmFdset::new();
    let cmsg_data = scm_fdset_init(&mut fdset, Some((saddr, saddr_len)));
    unsafe { ptr::write_unaligned(cmsg_data, fd) };

    loop {
        let ret = unsafe { libc::sendmsg(sock, &fdset.hdr, 0) };
        if ret > 0 {
            return Ok(());
        }
        if ret == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "sendmsg sent nothing"));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Block until one descriptor arrives on `sock`.
pub fn recv_fd(sock: RawFd) -> io::Result<OwnedFd> {
    let mut fdset = ScmFdset::new();
    let cmsg_data = scm_fdset_init(&mut fdset, None);

    let ret = loop {
        let ret = unsafe { libc::recvmsg(sock, &mut fdset.hdr, libc::MSG_CMSG_CLOEXEC) };
        if ret >= 0 {
            break ret;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    if ret == 0 {
        return Err(io::Error::from_raw_os_error(libc::ENOMSG));
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&fdset.hdr) };
    if cmsg.is_null() {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let (cmsg_level, cmsg_type, cmsg_len) =
        unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len as usize) };
    if cmsg_level != libc::SOL_SOCKET || cmsg_type != libc::SCM_RIGHTS {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    if (fdset.hdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::from_raw_os_error(libc::ENFILE));
    }
    if cmsg_len != unsafe { libc::CMSG_LEN(mem::size_of::<i32>() as u32) as usize } {
        return Err(io::Error::from_raw_os_error(libc::EBADFD));
    }

    let fd = unsafe { ptr::read_unaligned(cmsg_data) };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
