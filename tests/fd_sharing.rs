//! Cross-process fd restore: every task runs in its own forked process.

mod common;

use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use common::{fd_pos, file_key, fork_lock, fork_task, path_bytes, wait_ok, write_image};
use crust_fds::criu::cr_restore::{collect_fds, restore_task};
use crust_fds::criu::files::{FdRestore, FdState, FdinfoTable};
use crust_fds::criu::options::FdRestoreOpts;
use crust_fds::criu::stats::FdCnt;
use crust_fds::images::{FdRecord, ImageDir};
use crust_fds::{restore_files, CrustError};
use tempfile::{NamedTempFile, TempDir};

fn scratch_file(len: usize) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(&vec![b'z'; len]).unwrap();
    f
}

#[test]
fn test_single_user_file_round_trip() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let file = scratch_file(200);
    let path = path_bytes(file.path());

    const SLOT: RawFd = 600;
    write_image(&img, 1, &[FdRecord::regular(0x100, SLOT as i64, &path, libc::O_RDWR, 100)]);

    let mut table = FdinfoTable::with_capacity(4, 4).unwrap();
    collect_fds(&mut table, &img, &[1]).unwrap();
    assert_eq!(table.find_fd(0x100).unwrap().users, 1);

    let expected = std::fs::canonicalize(file.path()).unwrap();
    let child = fork_task(|| {
        let rst = restore_task(&table, &img, 1).unwrap();
        let s = rst.stats();
        let link = std::fs::read_link(format!("/proc/self/fd/{}", SLOT)).unwrap();

        s.get(FdCnt::FilesOpened) == 1
            && s.get(FdCnt::FdsSent) == 0
            && s.get(FdCnt::FdsReceived) == 0
            && s.get(FdCnt::TransportsPrepared) == 0
            && fd_pos(SLOT) == 100
            && link == expected
    });
    assert!(wait_ok(child));
}

#[test]
fn test_shared_file_reaches_every_sharer() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let file = scratch_file(64);
    let path = path_bytes(file.path());
    let id = 0x2000;

    // 7 is the owner and holds the file twice (dup'ed), 3 and 5 share it.
    write_image(
        &img,
        3,
        &[FdRecord::regular(id, 611, &path, libc::O_RDWR, 10)],
    );
    write_image(
        &img,
        5,
        &[FdRecord::regular(id, 612, &path, libc::O_RDWR, 10)],
    );
    write_image(
        &img,
        7,
        &[
            FdRecord::regular(id, 610, &path, libc::O_RDWR, 10),
            FdRecord::regular(id, 613, &path, libc::O_RDWR, 10),
        ],
    );

    let mut table = FdinfoTable::sized_for(&img, &[3, 5, 7]).unwrap();
    collect_fds(&mut table, &img, &[3, 5, 7]).unwrap();
    let desc = table.find_fd(id).unwrap();
    assert_eq!((desc.pid, desc.addr, desc.users), (7, 610, 4));

    let key = file_key(file.as_file().as_raw_fd()).unwrap();

    let sharer = |pid: i32, slot: RawFd| {
        let table = &table;
        let img = &img;
        move || {
            let rst = restore_task(table, img, pid).unwrap();
            let s = rst.stats();
            s.get(FdCnt::FdsReceived) == 1
                && s.get(FdCnt::FdsSent) == 0
                && s.get(FdCnt::FilesOpened) == 0
                && file_key(slot) == Some(key)
                && fd_pos(slot) == 10
        }
    };

    let c3 = fork_task(sharer(3, 611));
    let c5 = fork_task(sharer(5, 612));
    let c7 = fork_task(|| {
        let rst = restore_task(&table, &img, 7).unwrap();
        let s = rst.stats();
        // Both sharers served, nothing sent to itself.
        s.get(FdCnt::FdsSent) == 2
            && s.get(FdCnt::FilesOpened) == 1
            && s.get(FdCnt::FdsDuplicated) == 1
            && s.get(FdCnt::FdsReceived) == 0
            && file_key(610) == Some(key)
            && file_key(613) == Some(key)
    });

    assert!(wait_ok(c3));
    assert!(wait_ok(c5));
    assert!(wait_ok(c7));
}

#[test]
fn test_receiver_blocks_until_owner_creates() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let file = scratch_file(8);
    let path = path_bytes(file.path());

    const DELAY: Duration = Duration::from_millis(300);
    write_image(&img, 10, &[FdRecord::regular(0x30, 620, &path, libc::O_RDONLY, 0)]);
    write_image(&img, 4, &[FdRecord::regular(0x30, 621, &path, libc::O_RDONLY, 0)]);

    let mut table = FdinfoTable::with_capacity(1, 2).unwrap();
    collect_fds(&mut table, &img, &[10, 4]).unwrap();
    assert_eq!(table.find_fd(0x30).unwrap().pid, 10);

    let b = fork_task(|| {
        let start = Instant::now();
        let mut rst = FdRestore::new(&table, &img, 4).unwrap();
        rst.prepare_fds().unwrap();
        start.elapsed() >= DELAY - Duration::from_millis(20) && file_key(621).is_some()
    });

    let a = fork_task(|| {
        let mut rst = FdRestore::new(&table, &img, 10).unwrap();
        rst.restore_phase(FdState::Prepare).unwrap();
        std::thread::sleep(DELAY);
        rst.restore_phase(FdState::Create).unwrap();
        rst.restore_phase(FdState::Receive).unwrap();
        rst.stats().get(FdCnt::FdsSent) == 1
    });

    assert!(wait_ok(a));
    assert!(wait_ok(b));
}

#[test]
fn test_task_both_receives_and_owns() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let (fx, fy, fz) = (scratch_file(1), scratch_file(2), scratch_file(3));
    let (px, py, pz) = (path_bytes(fx.path()), path_bytes(fy.path()), path_bytes(fz.path()));
    let kx = file_key(fx.as_file().as_raw_fd()).unwrap();
    let ky = file_key(fy.as_file().as_raw_fd()).unwrap();
    let kz = file_key(fz.as_file().as_raw_fd()).unwrap();

    // 5 owns X and Z, 3 gets X from 5 and owns Y, 2 gets Y from 3 and Z from 5.
    write_image(
        &img,
        5,
        &[
            FdRecord::regular(0x61, 660, &px, libc::O_RDONLY, 0),
            FdRecord::regular(0x63, 664, &pz, libc::O_RDONLY, 0),
        ],
    );
    write_image(
        &img,
        3,
        &[
            FdRecord::regular(0x61, 661, &px, libc::O_RDONLY, 0),
            FdRecord::regular(0x62, 662, &py, libc::O_RDONLY, 0),
        ],
    );
    write_image(
        &img,
        2,
        &[
            FdRecord::regular(0x63, 665, &pz, libc::O_RDONLY, 0),
            FdRecord::regular(0x62, 663, &py, libc::O_RDONLY, 0),
        ],
    );

    let mut table = FdinfoTable::sized_for(&img, &[5, 3, 2]).unwrap();
    collect_fds(&mut table, &img, &[5, 3, 2]).unwrap();
    assert_eq!(table.find_fd(0x61).unwrap().pid, 5);
    assert_eq!(table.find_fd(0x62).unwrap().pid, 3);
    assert_eq!(table.find_fd(0x63).unwrap().pid, 5);

    let c5 = fork_task(|| {
        let rst = restore_task(&table, &img, 5).unwrap();
        let s = rst.stats();
        s.get(FdCnt::FilesOpened) == 2
            && s.get(FdCnt::FdsSent) == 2
            && file_key(660) == Some(kx)
            && file_key(664) == Some(kz)
    });
    let c3 = fork_task(|| {
        let rst = restore_task(&table, &img, 3).unwrap();
        let s = rst.stats();
        s.get(FdCnt::FilesOpened) == 1
            && s.get(FdCnt::FdsSent) == 1
            && s.get(FdCnt::FdsReceived) == 1
            && file_key(661) == Some(kx)
            && file_key(662) == Some(ky)
    });
    // Last sharer shows up late: 3 has to wait for it while 5 is sending.
    std::thread::sleep(Duration::from_millis(200));
    let c2 = fork_task(|| {
        let rst = restore_task(&table, &img, 2).unwrap();
        rst.stats().get(FdCnt::FdsReceived) == 2
            && file_key(663) == Some(ky)
            && file_key(665) == Some(kz)
    });

    assert!(wait_ok(c5));
    assert!(wait_ok(c3));
    assert!(wait_ok(c2));
}

#[test]
fn test_restore_files_end_to_end() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let file = scratch_file(16);
    let path = path_bytes(file.path());

    write_image(&img, 20, &[FdRecord::regular(0x40, 630, &path, libc::O_RDONLY, 0)]);
    write_image(&img, 21, &[FdRecord::regular(0x40, 631, &path, libc::O_RDONLY, 0)]);

    // 22 has no image at all: it just has no fds.
    let opts = FdRestoreOpts::new(dir.path());
    restore_files(&opts, &[20, 21, 22]).unwrap();
}

#[test]
fn test_failed_owner_fails_restore() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let missing = dir.path().join("gone");
    let path = path_bytes(&missing);

    write_image(&img, 31, &[FdRecord::regular(0x50, 640, &path, libc::O_RDONLY, 0)]);
    write_image(&img, 30, &[FdRecord::regular(0x50, 641, &path, libc::O_RDONLY, 0)]);

    // 31 owns a file that can't be opened; 30 would wait for it forever.
    let opts = FdRestoreOpts::new(dir.path());
    match restore_files(&opts, &[30, 31]) {
        Err(CrustError::TaskFailed { pid, .. }) => assert_eq!(pid, 31),
        other => panic!("expected task failure, got {:?}", other),
    }
}

#[test]
fn test_capacity_error_before_any_task_runs() {
    let _g = fork_lock();
    let dir = TempDir::new().unwrap();
    let img = ImageDir::open(dir.path()).unwrap();
    let missing = dir.path().join("never-opened");
    let path = path_bytes(&missing);

    write_image(
        &img,
        40,
        &[
            FdRecord::regular(1, 650, &path, libc::O_RDONLY, 0),
            FdRecord::regular(2, 651, &path, libc::O_RDONLY, 0),
            FdRecord::regular(3, 652, &path, libc::O_RDONLY, 0),
        ],
    );

    let mut opts = FdRestoreOpts::new(dir.path());
    opts.fdinfo_capacity = Some(2);
    assert!(matches!(
        restore_files(&opts, &[40]),
        Err(CrustError::Capacity { capacity: 2, .. })
    ));
    // Nothing was installed in this process either.
    assert!(file_key(650).is_none());
}
