use std::sync::atomic::{AtomicU64, Ordering};

#[repr(usize)]
#[derive(Debug, Clone, Copy)]
pub enum FdCnt {
    /// Real files opened by an owner.
    FilesOpened = 0,
    /// Transport sockets bound by non-owners.
    TransportsPrepared,
    FdsSent,
    FdsReceived,
    /// Extra slots of an owner filled with dup2.
    FdsDuplicated,
    FmapsCached,
}

pub const FD_CNT_NR_STATS: usize = 6;

/// Per-process counters of one fd restore.
#[derive(Debug, Default)]
pub struct FdRestoreStats {
    counts: [AtomicU64; FD_CNT_NR_STATS],
}

impl FdRestoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cnt_add(&self, c: FdCnt, val: u64) {
        self.counts[c as usize].fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn cnt_inc(&self, c: FdCnt) {
        self.cnt_add(c, 1);
    }

    pub fn get(&self, c: FdCnt) -> u64 {
        self.counts[c as usize].load(Ordering::Relaxed)
    }

    pub fn show(&self, pid: i32) {
        log::info!(
            "{}: fds: opened {} sent {} received {} duped {} transports {} fmaps {}",
            pid,
            self.get(FdCnt::FilesOpened),
            self.get(FdCnt::FdsSent),
            self.get(FdCnt::FdsReceived),
            self.get(FdCnt::FdsDuplicated),
            self.get(FdCnt::TransportsPrepared),
            self.get(FdCnt::FmapsCached),
        );
    }
}
