use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::criu::util::open_path;
use crate::error::{CrustError, Result};
use crate::images::FdRecord;

/// Flags that only make sense when a file is first opened.
const OPEN_ONLY_FLAGS: i32 = libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

/// Open the file of a record with its saved flags and position.
///
/// The file must already exist; it is never created or truncated.
pub fn open_fe_fd(fe: &FdRecord) -> Result<OwnedFd> {
    let tmp = open_path(&fe.path, fe.flags & !OPEN_ONLY_FLAGS).inspect_err(|e| {
        log::error!("Can't open file {}: {}", fe.path_lossy(), e);
    })?;

    if unsafe { libc::lseek(tmp.as_raw_fd(), fe.pos as libc::off_t, libc::SEEK_SET) } < 0 {
        let err = io::Error::last_os_error();
        log::error!("Can't restore position {} of {}: {}", fe.pos, fe.path_lossy(), err);
        return Err(err.into());
    }

    Ok(tmp)
}

pub fn restore_cwd(fe: &FdRecord) -> Result<()> {
    log::info!("Restore CWD {}", fe.path_lossy());

    let dir = open_path(&fe.path, libc::O_RDONLY | libc::O_DIRECTORY).inspect_err(|e| {
        log::error!("Can't open dir {}: {}", fe.path_lossy(), e);
    })?;

    if unsafe { libc::fchdir(dir.as_raw_fd()) } < 0 {
        let err = io::Error::last_os_error();
        log::error!("Can't change dir {}: {}", fe.path_lossy(), err);
        return Err(err.into());
    }

    Ok(())
}

/// The exe link can only be changed once the rest of the task is
/// restored (the kernel refuses while other mappings of the old exe
/// exist), so it is left to the final restore stage.
pub fn restore_exe_early(_fe: &FdRecord) -> Result<()> {
    log::debug!("Deferring exe link restore");
    Ok(())
}

/// Fds backing file mappings, keyed by (pid, VMA start).
#[derive(Debug, Default)]
pub struct FmapCache {
    fds: HashMap<(i32, u64), OwnedFd>,
}

impl FmapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pid: i32, start: u64, fd: OwnedFd) -> Result<()> {
        if self.fds.contains_key(&(pid, start)) {
            return Err(CrustError::InvalidImage {
                reason: format!("{}: two file mappings at {:#x}", pid, start),
            });
        }
        self.fds.insert((pid, start), fd);
        Ok(())
    }

    /// Remove and return the fd of the mapping at `start`, if any.
    pub fn pull(&mut self, pid: i32, start: u64) -> Option<OwnedFd> {
        log::info!("{}: Looking for {:#x} : ", pid, start);
        let fd = self.fds.remove(&(pid, start));
        log::info!("{}", if fd.is_some() { "found" } else { "not found" });
        fd
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

pub fn open_fmap(cache: &mut FmapCache, pid: i32, fe: &FdRecord) -> Result<()> {
    let tmp = open_fe_fd(fe)?;

    log::info!("{}:\t\tWill map {:#x} to {}", pid, fe.addr, tmp.as_raw_fd());

    cache.add(pid, fe.addr as u64, tmp)
}
