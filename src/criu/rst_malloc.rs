//! Fork-visible shared allocations for restore.
//!
//! Objects that every restored process needs to see (the fd sharing table
//! and its wait words) are kept in anonymous MAP_SHARED memory that is set
//! up before the first restored process is forked. Anon shared memory can't
//! grow with mremap (the backing file size doesn't change and accesses past
//! it raise SIGBUS), so each buffer is sized once up front and a push past
//! that size is reported instead of growing.

use std::marker::PhantomData;
use std::mem;
use std::ptr;

use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};

use crate::criu::util::page_size;
use crate::error::{CrustError, Result};

fn rst_mem_size(bytes: usize) -> usize {
    let page = page_size();
    let bytes = bytes.max(1);
    (bytes + page - 1) & !(page - 1)
}

/// Fixed-capacity array of `T` in MAP_SHARED memory.
///
/// The length is process-local: all pushes must happen before forking,
/// children then see the same elements at the same indices. Elements must
/// not hold pointers, only indices, since they're read from many processes.
pub struct ShVec<T> {
    buf: *mut T,
    cap: usize,
    len: usize,
    map_len: usize,
    what: &'static str,
    _marker: PhantomData<T>,
}

impl<T> ShVec<T> {
    pub fn with_capacity(cap: usize, what: &'static str) -> Result<Self> {
        let bytes = cap.checked_mul(mem::size_of::<T>()).ok_or(CrustError::Capacity {
            what,
            capacity: cap,
        })?;
        let map_len = rst_mem_size(bytes);

        let aux = unsafe {
            mmap(
                ptr::null_mut(),
                map_len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if aux == MAP_FAILED {
            log::error!("Can't map {} ({} bytes)", what, map_len);
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self {
            buf: aux as *mut T,
            cap,
            len: 0,
            map_len,
            what,
            _marker: PhantomData,
        })
    }

    /// Append `v`, returning its index.
    pub fn push(&mut self, v: T) -> Result<usize> {
        if self.len >= self.cap {
            log::error!("OOM storing {}", self.what);
            return Err(CrustError::Capacity {
                what: self.what,
                capacity: self.cap,
            });
        }
        let idx = self.len;
        unsafe { ptr::write(self.buf.add(idx), v) };
        self.len += 1;
        Ok(idx)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.cap - self.len
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.buf, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.len) }
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.as_slice().get(idx)
    }

    #[inline]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(idx)
    }
}

impl<T> Drop for ShVec<T> {
    fn drop(&mut self) {
        unsafe {
            if mem::needs_drop::<T>() {
                ptr::drop_in_place(self.as_mut_slice() as *mut [T]);
            }
            munmap(self.buf as *mut c_void, self.map_len);
        }
    }
}
