//! Fd restore driver.
//!
//! Collects the fdinfo images of all tasks into the shared table, then
//! forks one process per task that rebuilds its fd table. The collection
//! of every task has to finish before the first fork: the owner of a file
//! must know all of its sharers before it starts sending.

use std::collections::HashMap;

use crate::criu::files::{prepare_fd_pid, FdRestore, FdinfoTable};
use crate::criu::options::FdRestoreOpts;
use crate::error::{CrustError, Result};
use crate::images::ImageDir;

/// Allocate the shared fdinfo table for `pids`.
pub fn prepare_shared_fdinfo(
    opts: &FdRestoreOpts,
    img: &ImageDir,
    pids: &[i32],
) -> Result<FdinfoTable> {
    match opts.fdinfo_capacity {
        Some(cap) => FdinfoTable::with_capacity(cap, cap),
        None => FdinfoTable::sized_for(img, pids),
    }
}

pub fn collect_fds(table: &mut FdinfoTable, img: &ImageDir, pids: &[i32]) -> Result<()> {
    log::info!("Collecting fdinfo-s");
    for &pid in pids {
        let nr = prepare_fd_pid(table, img, pid)?;
        log::debug!("{}: collected {} fds", pid, nr);
    }
    log::debug!(" `- ... done");
    Ok(())
}

/// Restore the fds of `pid` in the calling process.
pub fn restore_task<'a>(table: &'a FdinfoTable, img: &ImageDir, pid: i32) -> Result<FdRestore<'a>> {
    let mut rst = FdRestore::new(table, img, pid)?;
    rst.prepare_fds()?;
    rst.stats().show(pid);
    Ok(rst)
}

fn show_fds(pid: i32) {
    let Ok(dir) = std::fs::read_dir("/proc/self/fd") else {
        return;
    };
    for entry in dir.flatten() {
        let target = std::fs::read_link(entry.path())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "?".to_string());
        log::debug!("{}: fd {} -> {}", pid, entry.file_name().to_string_lossy(), target);
    }
}

fn kill_all(children: &HashMap<libc::pid_t, i32>) {
    for &child in children.keys() {
        unsafe { libc::kill(child, libc::SIGKILL) };
    }
}

/// Collect all `pids`, then restore each one in its own forked process.
///
/// Fails if any task fails; the remaining tasks are killed then, since
/// they may wait forever for a peer that's gone.
pub fn restore_files(opts: &FdRestoreOpts, pids: &[i32]) -> Result<()> {
    opts.validate()?;
    let img = ImageDir::open(&opts.image_dir)?;

    let mut table = prepare_shared_fdinfo(opts, &img, pids)?;
    collect_fds(&mut table, &img, pids)?;
    table.show();

    let mut children: HashMap<libc::pid_t, i32> = HashMap::new();
    for &pid in pids {
        let child = unsafe { libc::fork() };
        if child < 0 {
            let err = std::io::Error::last_os_error();
            log::error!("Can't fork for {}: {}", pid, err);
            kill_all(&children);
            return Err(err.into());
        }

        if child == 0 {
            let code = match restore_task(&table, &img, pid) {
                Ok(_) => {
                    show_fds(pid);
                    0
                }
                Err(e) => {
                    log::error!("{}: fd restore failed: {}", pid, e);
                    1
                }
            };
            unsafe { libc::_exit(code) };
        }

        log::info!("Forked task {} as {}", pid, child);
        children.insert(child, pid);
    }

    let mut failure = None;
    while !children.is_empty() {
        let mut status = 0;
        let child = unsafe { libc::waitpid(-1, &mut status, 0) };
        if child < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            kill_all(&children);
            return Err(err.into());
        }

        let Some(pid) = children.remove(&child) else {
            continue;
        };

        if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
            log::info!("{}: fds restored", pid);
            continue;
        }

        log::error!("{}: task {} exited with status {:#x}", pid, child, status);
        if failure.is_none() {
            failure = Some(CrustError::TaskFailed { pid, status });
            kill_all(&children);
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
