//! Futex-backed wait word living in shared memory.
//!
//! The word is placed in a MAP_SHARED mapping created before the restored
//! processes are forked, so the non-private futex ops are used: a waiter in
//! one process is woken by a store in another.

use std::sync::atomic::{AtomicI32, Ordering};

/// Upper bound for a single FUTEX_WAIT; the waiter re-polls afterwards.
const FUTEX_POLL_SECS: libc::time_t = 1;

#[derive(Debug)]
#[repr(C)]
pub struct Futex {
    pub raw: AtomicI32,
}

impl Default for Futex {
    fn default() -> Self {
        Self::new()
    }
}

impl Futex {
    pub const fn new() -> Self {
        Self {
            raw: AtomicI32::new(0),
        }
    }

    pub fn get(&self) -> u32 {
        self.raw.load(Ordering::Acquire) as u32
    }

    /// Publish `v` with release ordering and wake every waiter.
    pub fn set(&self, v: u32) {
        self.raw.store(v as i32, Ordering::Release);
        self.wake();
    }

    pub fn wake(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn sys_futex_wait(&self, expected: u32, timeout: &libc::timespec) -> i32 {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.raw as *const AtomicI32,
                libc::FUTEX_WAIT,
                expected as i32,
                timeout as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            -unsafe { *libc::__errno_location() }
        } else {
            ret as i32
        }
    }

    /// Block while the word equals `v`, returning the first other value seen.
    ///
    /// There is no overall timeout: a peer that never stores leaves the
    /// caller blocked.
    pub fn wait_while(&self, v: u32) -> u32 {
        let timeout = libc::timespec {
            tv_sec: FUTEX_POLL_SECS,
            tv_nsec: 0,
        };
        loop {
            let tmp = self.get();
            if tmp != v {
                return tmp;
            }
            let ret = self.sys_futex_wait(v, &timeout);
            if ret < 0
                && ret != -libc::ETIMEDOUT
                && ret != -libc::EINTR
                && ret != -libc::EWOULDBLOCK
            {
                // Futex unusable here (e.g. seccomp); degrade to polling.
                log::debug!("futex_wait failed: {}, polling", -ret);
                std::thread::yield_now();
            }
        }
    }

    pub fn wait_until_nonzero(&self) -> u32 {
        self.wait_while(0)
    }
}
