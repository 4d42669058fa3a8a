use std::ffi::CString;
use std::io::{self, ErrorKind};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::OnceLock;

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Move `old_fd` onto slot `new_fd`, closing `old_fd`.
pub fn reopen_fd_as(new_fd: RawFd, old_fd: RawFd) -> io::Result<()> {
    if old_fd != new_fd {
        let tmp = unsafe { libc::dup2(old_fd, new_fd) };
        if tmp < 0 {
            return Err(io::Error::last_os_error());
        }
        if tmp != new_fd {
            unsafe { libc::close(tmp) };
            return Err(io::Error::new(ErrorKind::AddrInUse, "fd already in use"));
        }
        unsafe { libc::close(old_fd) };
    }
    Ok(())
}

/// Install an owned descriptor at slot `new_fd`. The slot now owns it.
pub fn install_fd_as(new_fd: RawFd, fd: OwnedFd) -> io::Result<()> {
    let old_fd = fd.into_raw_fd();
    reopen_fd_as(new_fd, old_fd).inspect_err(|_| {
        if old_fd != new_fd {
            unsafe { libc::close(old_fd) };
        }
    })
}

/// Duplicate `old_fd` onto `new_fd`, leaving `old_fd` open.
pub fn dup_fd_as(new_fd: RawFd, old_fd: RawFd) -> io::Result<()> {
    if unsafe { libc::dup2(old_fd, new_fd) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn path_cstring(path: &[u8]) -> io::Result<CString> {
    CString::new(path).map_err(|_| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("path {} has an interior NUL", String::from_utf8_lossy(path)),
        )
    })
}

pub fn open_path(path: &[u8], flags: i32) -> io::Result<OwnedFd> {
    let c_path = path_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o600 as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}
