//! Restore of (possibly shared) file descriptors.
//!
//! Before any restored task is forked, every task's fdinfo image is read
//! and each file id is collected into an `FdinfoTable` that lives in
//! shared memory. For every id one task is picked as the owner: it opens
//! the real file and hands a copy to every other task using the id over
//! unix sockets. Each task then runs three passes over its own records:
//!
//! - PREPARE: non-owners bind a transport socket onto the fd slot and
//!   announce their pid in the entry's wait word;
//! - CREATE: owners open files and send them to every announced sharer;
//! - RECEIVE: non-owners pick the fd up from the transport, owners dup
//!   their extra slots. Special records are handled here too.

use std::collections::HashMap;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;

use crate::criu::files_reg::{open_fe_fd, open_fmap, restore_cwd, restore_exe_early, FmapCache};
use crate::criu::lock::Futex;
use crate::criu::rst_malloc::ShVec;
use crate::criu::scm::recv_fd;
use crate::criu::sk_unix::{open_transport_sock, send_fd_to, socket_dgram};
use crate::criu::stats::{FdCnt, FdRestoreStats};
use crate::criu::util::{dup_fd_as, install_fd_as};
use crate::error::{CrustError, Result};
use crate::images::{FdKind, FdRecord, ImageDir};

const FLE_NONE: u32 = u32::MAX;

/// Does restore pid `a` take ownership of a shared file from `b`?
///
/// The numerically largest pid referencing an id opens the file.
#[inline]
pub fn fd_owner_prio(a: i32, b: i32) -> bool {
    a > b
}

/// Shared file - one per checkpoint file id, allocated in shared memory.
#[repr(C)]
pub struct FdinfoDesc {
    pub id: u64,
    /// Owner's fd number.
    pub addr: i64,
    /// Owner's restore pid.
    pub pid: i32,
    pub users: u32,
    first: u32,
    last: u32,
}

/// One (pid, fd) referencing an `FdinfoDesc`.
#[repr(C)]
pub struct FdinfoListEntry {
    pub pid: i32,
    pub fd: i64,
    /// OS pid of the task once its end of the transport is ready, 0 before.
    pub real_pid: Futex,
    next: u32,
}

/// Sharing table for all restored tasks.
///
/// Filled by `collect_fd` in the restore driver before forking, read-only
/// in the restored tasks afterwards (except for the entries' wait words).
pub struct FdinfoTable {
    descs: ShVec<FdinfoDesc>,
    list: ShVec<FdinfoListEntry>,
    index: HashMap<u64, usize>,
}

impl FdinfoTable {
    pub fn with_capacity(nr_descs: usize, nr_entries: usize) -> Result<Self> {
        Ok(Self {
            descs: ShVec::with_capacity(nr_descs, "fdinfo descriptions")?,
            list: ShVec::with_capacity(nr_entries, "fdinfo list entries")?,
            index: HashMap::new(),
        })
    }

    /// Pre-scan the images of `pids` and size the table to fit them.
    pub fn sized_for(img: &ImageDir, pids: &[i32]) -> Result<Self> {
        let mut nr = 0usize;
        for &pid in pids {
            let Some(mut fi) = img.open_fdinfo(pid)? else {
                continue;
            };
            while let Some(fe) = fi.read_record()? {
                if !fe.is_special() {
                    nr += 1;
                }
            }
        }
        log::debug!("Sizing fdinfo table for {} entries", nr);
        Self::with_capacity(nr, nr)
    }

    pub fn nr_descs(&self) -> usize {
        self.descs.len()
    }

    pub fn nr_entries(&self) -> usize {
        self.list.len()
    }

    pub fn descs(&self) -> &[FdinfoDesc] {
        self.descs.as_slice()
    }

    pub fn find_fd(&self, id: u64) -> Option<&FdinfoDesc> {
        self.index.get(&id).and_then(|&i| self.descs.get(i))
    }

    /// Entries referencing `desc`, in collection order.
    pub fn sharers<'a>(&'a self, desc: &FdinfoDesc) -> Sharers<'a> {
        Sharers {
            list: self.list.as_slice(),
            cur: desc.first,
        }
    }

    pub fn find_fdinfo_list_entry(
        &self,
        pid: i32,
        fd: i64,
        desc: &FdinfoDesc,
    ) -> Result<&FdinfoListEntry> {
        self.sharers(desc)
            .find(|fle| fle.pid == pid && fle.fd == fd)
            .ok_or_else(|| {
                CrustError::Invariant(format!(
                    "no fdinfo entry pid={} fd={} for id {:#x}",
                    pid, fd, desc.id
                ))
            })
    }

    /// Account one non-special record of `pid`.
    pub fn collect_fd(&mut self, pid: i32, fe: &FdRecord) -> Result<()> {
        log::info!("Collect fdinfo pid={} fd={} id={:#016x}", pid, fe.addr, fe.id);

        fe.fd()?;
        let existing = self.index.get(&fe.id).copied();

        // Check both arrays before touching either one.
        if self.list.remaining() == 0 {
            log::error!("OOM storing fdinfo_list_entries");
            return Err(CrustError::Capacity {
                what: "fdinfo list entries",
                capacity: self.list.capacity(),
            });
        }
        if existing.is_none() && self.descs.remaining() == 0 {
            log::error!("OOM storing fdinfo descriptions");
            return Err(CrustError::Capacity {
                what: "fdinfo descriptions",
                capacity: self.descs.capacity(),
            });
        }

        let le = self.list.push(FdinfoListEntry {
            pid,
            fd: fe.addr,
            real_pid: Futex::new(),
            next: FLE_NONE,
        })? as u32;

        let di = match existing {
            Some(di) => di,
            None => {
                let di = self.descs.push(FdinfoDesc {
                    id: fe.id,
                    addr: fe.addr,
                    pid,
                    users: 0,
                    first: FLE_NONE,
                    last: FLE_NONE,
                })?;
                self.index.insert(fe.id, di);
                di
            }
        };

        let last = {
            let desc = &mut self.descs.as_mut_slice()[di];
            desc.users += 1;
            if fd_owner_prio(pid, desc.pid) {
                desc.pid = pid;
                desc.addr = fe.addr;
            }
            let last = desc.last;
            if desc.first == FLE_NONE {
                desc.first = le;
            }
            desc.last = le;
            last
        };
        if last != FLE_NONE {
            self.list.as_mut_slice()[last as usize].next = le;
        }

        Ok(())
    }

    pub fn show(&self) {
        for desc in self.descs() {
            let sharers: Vec<String> = self
                .sharers(desc)
                .map(|fle| format!("{}:{}", fle.pid, fle.fd))
                .collect();
            log::info!(
                "fdinfo {:#016x}: owner {}:{} users {} [{}]",
                desc.id,
                desc.pid,
                desc.addr,
                desc.users,
                sharers.join(" ")
            );
        }
    }
}

pub struct Sharers<'a> {
    list: &'a [FdinfoListEntry],
    cur: u32,
}

impl<'a> Iterator for Sharers<'a> {
    type Item = &'a FdinfoListEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == FLE_NONE {
            return None;
        }
        let fle = self.list.get(self.cur as usize)?;
        self.cur = fle.next;
        Some(fle)
    }
}

/// Collect the fdinfo image of `pid` into `table`.
///
/// A task without an image has no fds. Returns the number of fds collected.
pub fn prepare_fd_pid(table: &mut FdinfoTable, img: &ImageDir, pid: i32) -> Result<usize> {
    let Some(mut fi) = img.open_fdinfo(pid)? else {
        log::debug!("{}: No fdinfo image", pid);
        return Ok(0);
    };

    let mut nr = 0;
    while let Some(fe) = fi.read_record()? {
        if fe.is_special() {
            continue;
        }
        table.collect_fd(pid, &fe)?;
        nr += 1;
    }
    Ok(nr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    Prepare,
    Create,
    Receive,
}

impl FdState {
    pub const ALL: [FdState; 3] = [FdState::Prepare, FdState::Create, FdState::Receive];
}

/// Fd restore of one task, run inside the restored process.
pub struct FdRestore<'a> {
    pid: i32,
    table: &'a FdinfoTable,
    records: Vec<FdRecord>,
    fmap: FmapCache,
    stats: FdRestoreStats,
}

impl<'a> FdRestore<'a> {
    pub fn new(table: &'a FdinfoTable, img: &ImageDir, pid: i32) -> Result<Self> {
        log::info!("{}: Opening fdinfo-s", pid);
        let records = match img.open_fdinfo(pid)? {
            Some(mut fi) => fi.read_all()?,
            None => Vec::new(),
        };
        Ok(Self::from_records(table, pid, records))
    }

    pub fn from_records(table: &'a FdinfoTable, pid: i32, records: Vec<FdRecord>) -> Self {
        Self {
            pid,
            table,
            records,
            fmap: FmapCache::new(),
            stats: FdRestoreStats::new(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn stats(&self) -> &FdRestoreStats {
        &self.stats
    }

    /// Run all three passes.
    pub fn prepare_fds(&mut self) -> Result<()> {
        for state in FdState::ALL {
            self.restore_phase(state)?;
        }
        Ok(())
    }

    /// Run one pass over this task's records.
    pub fn restore_phase(&mut self, state: FdState) -> Result<()> {
        log::debug!("{}: fd restore pass {:?}", self.pid, state);

        let records = mem::take(&mut self.records);
        let mut ret = records
            .iter()
            .filter(|fe| !fe.is_special())
            .try_for_each(|fe| self.open_fdinfo(fe, state));
        // Specials keep fds at the lowest free numbers, which must not be
        // slots this task still has to fill.
        if ret.is_ok() {
            ret = records
                .iter()
                .filter(|fe| fe.is_special())
                .try_for_each(|fe| self.open_special_fdinfo(fe, state));
        }
        self.records = records;
        ret
    }

    fn open_fdinfo(&self, fe: &FdRecord, state: FdState) -> Result<()> {
        let fi = self.table.find_fd(fe.id).ok_or_else(|| {
            CrustError::Invariant(format!("{}: no fdinfo desc for id {:#x}", self.pid, fe.id))
        })?;

        log::info!(
            "\t{}: Got fd for {} namelen {} users {}",
            self.pid,
            fe.addr,
            fe.path.len(),
            fi.users
        );

        match state {
            FdState::Prepare => self.open_transport_fd(fe, fi),
            FdState::Create => self.open_fd(fe, fi),
            FdState::Receive => self.receive_fd(fe, fi),
        }
    }

    fn open_transport_fd(&self, fe: &FdRecord, fi: &FdinfoDesc) -> Result<()> {
        if fi.pid == self.pid {
            return Ok(());
        }

        let slot = fe.fd()?;
        let me = getpid();
        log::info!(
            "\t{}: Create transport fd for {} users {}",
            self.pid,
            fe.addr,
            fi.users
        );

        let fle = self.table.find_fdinfo_list_entry(self.pid, fe.addr, fi)?;

        let sock = open_transport_sock(me, fe.addr)
            .map_err(|e| CrustError::transport("bind", me, fe.addr, e))?;
        install_fd_as(slot, sock)?;
        self.stats.cnt_inc(FdCnt::TransportsPrepared);

        log::info!("Wake up fdinfo pid={} fd={}", fle.pid, fle.fd);
        fle.real_pid.set(me as u32);

        Ok(())
    }

    fn open_fd(&self, fe: &FdRecord, fi: &FdinfoDesc) -> Result<()> {
        if fi.pid != self.pid || fe.addr != fi.addr {
            return Ok(());
        }

        let slot = fe.fd()?;
        let tmp = open_fe_fd(fe)?;
        install_fd_as(slot, tmp)?;
        self.stats.cnt_inc(FdCnt::FilesOpened);

        if fi.users == 1 {
            return Ok(());
        }

        let me = getpid();
        let sock = socket_dgram().map_err(|e| CrustError::transport("socket", me, fe.addr, e))?;

        let own = self.table.find_fdinfo_list_entry(self.pid, fe.addr, fi)?;
        own.real_pid.set(me as u32);

        log::info!(
            "\t{}: Create fd for {} users {}",
            self.pid,
            fe.addr,
            fi.users
        );

        let mut users = fi.users;
        for fle in self.table.sharers(fi) {
            users -= 1;

            if fle.pid == self.pid {
                continue;
            }

            log::info!("Wait fdinfo pid={} fd={}", fle.pid, fle.fd);
            let real_pid = fle.real_pid.wait_until_nonzero() as i32;

            send_fd_to(sock.as_raw_fd(), real_pid, fle.fd, slot)
                .map_err(|e| CrustError::transport("send", real_pid, fle.fd, e))?;
            self.stats.cnt_inc(FdCnt::FdsSent);
        }

        if users != 0 {
            return Err(CrustError::Invariant(format!(
                "{}: {} users of {:#x} left unserved",
                self.pid, users, fi.id
            )));
        }

        Ok(())
    }

    fn receive_fd(&self, fe: &FdRecord, fi: &FdinfoDesc) -> Result<()> {
        let slot = fe.fd()?;
        if fi.pid == self.pid {
            if fi.addr != fe.addr {
                dup_fd_as(slot, fi.addr as RawFd).inspect_err(|e| {
                    log::error!("Can't duplicate fd {} {}: {}", fi.addr, fe.addr, e)
                })?;
                self.stats.cnt_inc(FdCnt::FdsDuplicated);
            }
            return Ok(());
        }

        log::info!(
            "\t{}: Receive fd for {} users {}",
            self.pid,
            fe.addr,
            fi.users
        );

        let tmp = recv_fd(slot).map_err(|e| {
            log::error!("Can't get fd {}: {}", fe.addr, e);
            CrustError::transport("recv", self.pid, fe.addr, e)
        })?;
        unsafe { libc::close(slot) };

        install_fd_as(slot, tmp)?;
        self.stats.cnt_inc(FdCnt::FdsReceived);
        Ok(())
    }

    fn open_special_fdinfo(&mut self, fe: &FdRecord, state: FdState) -> Result<()> {
        if state != FdState::Receive {
            return Ok(());
        }

        match fe.kind {
            FdKind::FileMappedRegion => {
                open_fmap(&mut self.fmap, self.pid, fe)?;
                self.stats.cnt_inc(FdCnt::FmapsCached);
                Ok(())
            }
            FdKind::WorkingDir => restore_cwd(fe),
            FdKind::Executable => restore_exe_early(fe),
            FdKind::Regular => Err(CrustError::Invariant(format!(
                "{}: fd {} is not special",
                self.pid, fe.addr
            ))),
        }
    }

    /// Take the fd opened for the file mapping starting at `start`.
    ///
    /// None means no file backs that region.
    pub fn get_filemap_fd(&mut self, pid: i32, start: u64) -> Option<std::os::fd::OwnedFd> {
        self.fmap.pull(pid, start)
    }

    /// Hand the file-mapping fds over to the memory restorer.
    pub fn into_fmap(self) -> FmapCache {
        self.fmap
    }
}

fn getpid() -> i32 {
    unsafe { libc::getpid() }
}
