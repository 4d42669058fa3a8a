//! Helpers for tests that run restored tasks as forked processes.

#![allow(dead_code)]

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crust_fds::images::{FdRecord, ImageDir};

/// Forking tests share the fd table and the child reaping of this process.
static FORK_LOCK: Mutex<()> = Mutex::new(());

pub fn fork_lock() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `f` in a child process; the child exits 0 iff `f` returns true.
pub fn fork_task<F: FnOnce() -> bool>(f: F) -> libc::pid_t {
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let ok = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(false);
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }
    pid
}

pub fn wait_ok(pid: libc::pid_t) -> bool {
    let mut status = 0;
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    ret == pid && libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}

pub fn write_image(img: &ImageDir, pid: i32, records: &[FdRecord]) {
    let mut w = img.create_fdinfo(pid).unwrap();
    for r in records {
        w.write_record(r).unwrap();
    }
    w.finish().unwrap();
}

pub fn path_bytes(p: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    p.as_os_str().as_bytes().to_vec()
}

/// (dev, ino) of the file open at `fd`.
pub fn file_key(fd: RawFd) -> Option<(u64, u64)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return None;
    }
    Some((st.st_dev as u64, st.st_ino as u64))
}

pub fn fd_pos(fd: RawFd) -> i64 {
    unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) as i64 }
}
