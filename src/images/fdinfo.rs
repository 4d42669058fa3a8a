// fdinfo image records
//
// Layout (little-endian):
// - 4 bytes: FDINFO_MAGIC
// - records: [8 id][8 addr][4 type][4 flags][8 pos][4 len] + len path bytes
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::os::unix::io::RawFd;

use crate::error::{CrustError, Result};

pub const FDINFO_MAGIC: u32 = 0x56213732;
pub const FDINFO_HEAD_SIZE: usize = 36;

/// Longest path accepted from an image (PATH_MAX).
pub const FDINFO_PATH_MAX: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FdKind {
    Regular = 0,
    /// Backing file of a file-mapped VMA, `addr` is the VMA start.
    FileMappedRegion = 1,
    WorkingDir = 2,
    Executable = 3,
}

impl FdKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FdKind::Regular),
            1 => Some(FdKind::FileMappedRegion),
            2 => Some(FdKind::WorkingDir),
            3 => Some(FdKind::Executable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdRecord {
    pub id: u64,
    /// Descriptor number, or region start for `FileMappedRegion`.
    pub addr: i64,
    pub kind: FdKind,
    pub flags: i32,
    pub pos: i64,
    /// Raw path bytes. Empty for `Executable`, whose payload is skipped.
    pub path: Vec<u8>,
}

impl FdRecord {
    pub fn regular(id: u64, fd: i64, path: impl AsRef<[u8]>, flags: i32, pos: i64) -> Self {
        Self {
            id,
            addr: fd,
            kind: FdKind::Regular,
            flags,
            pos,
            path: path.as_ref().to_vec(),
        }
    }

    pub fn fmap(start: i64, path: impl AsRef<[u8]>, flags: i32, pos: i64) -> Self {
        Self {
            id: 0,
            addr: start,
            kind: FdKind::FileMappedRegion,
            flags,
            pos,
            path: path.as_ref().to_vec(),
        }
    }

    pub fn cwd(path: impl AsRef<[u8]>) -> Self {
        Self {
            id: 0,
            addr: 0,
            kind: FdKind::WorkingDir,
            flags: libc::O_RDONLY | libc::O_DIRECTORY,
            pos: 0,
            path: path.as_ref().to_vec(),
        }
    }

    pub fn exe(path: impl AsRef<[u8]>) -> Self {
        Self {
            id: 0,
            addr: 0,
            kind: FdKind::Executable,
            flags: libc::O_RDONLY,
            pos: 0,
            path: path.as_ref().to_vec(),
        }
    }

    /// Special records describe something other than a reopenable fd.
    #[inline]
    pub fn is_special(&self) -> bool {
        self.kind != FdKind::Regular
    }

    /// Slot number of a regular record, rejected if it isn't a valid fd.
    pub fn fd(&self) -> Result<RawFd> {
        match RawFd::try_from(self.addr) {
            Ok(fd) if fd >= 0 => Ok(fd),
            _ => Err(CrustError::InvalidImage {
                reason: format!("fd {} of id {:#x} out of range", self.addr, self.id),
            }),
        }
    }

    pub fn path_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Fill `buf` completely. Returns Ok(false) on a clean EOF before any byte.
fn read_full(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if off == 0 {
        return Ok(false);
    }
    if off != buf.len() {
        return Err(CrustError::InvalidImage {
            reason: format!("{} trimmed {}/{}", what, off, buf.len()),
        });
    }
    Ok(true)
}

pub struct FdinfoImage {
    rd: BufReader<File>,
    name: String,
}

impl FdinfoImage {
    pub(crate) fn open(file: File, name: String) -> Result<Self> {
        let mut rd = BufReader::new(file);

        let mut magic = [0u8; 4];
        if !read_full(&mut rd, &mut magic, &name)? {
            return Err(CrustError::InvalidImage {
                reason: format!("{} is empty", name),
            });
        }
        let magic = u32::from_le_bytes(magic);
        if magic != FDINFO_MAGIC {
            return Err(CrustError::InvalidImage {
                reason: format!("{} has bad magic {:#x}", name, magic),
            });
        }

        Ok(Self { rd, name })
    }

    /// Read the next record, None at end of image.
    pub fn read_record(&mut self) -> Result<Option<FdRecord>> {
        let mut head = [0u8; FDINFO_HEAD_SIZE];
        if !read_full(&mut self.rd, &mut head, &self.name)? {
            return Ok(None);
        }

        let id = le_u64(&head[0..8]);
        let addr = le_u64(&head[8..16]) as i64;
        let raw_type = le_u32(&head[16..20]);
        let flags = le_u32(&head[20..24]) as i32;
        let pos = le_u64(&head[24..32]) as i64;
        let len = le_u32(&head[32..36]);

        let kind = FdKind::from_raw(raw_type).ok_or_else(|| CrustError::InvalidImage {
            reason: format!("{}: unknown fdinfo type {}", self.name, raw_type),
        })?;

        let path = if kind == FdKind::Executable {
            // Restored at a later stage, only step over it here.
            let skipped = std::io::copy(&mut (&mut self.rd).take(len as u64), &mut std::io::sink())?;
            if skipped != len as u64 {
                return Err(CrustError::InvalidImage {
                    reason: format!("{}: exe payload trimmed {}/{}", self.name, skipped, len),
                });
            }
            Vec::new()
        } else {
            if len == 0 || len >= FDINFO_PATH_MAX {
                return Err(CrustError::InvalidImage {
                    reason: format!("{}: bad path length {} for fd {}", self.name, len, addr),
                });
            }
            let mut path = vec![0u8; len as usize];
            if !read_full(&mut self.rd, &mut path, &self.name)? {
                return Err(CrustError::InvalidImage {
                    reason: format!("{}: missing path for fd {}", self.name, addr),
                });
            }
            path
        };

        let fe = FdRecord {
            id,
            addr,
            kind,
            flags,
            pos,
            path,
        };
        if kind == FdKind::Regular && fe.fd().is_err() {
            return Err(CrustError::InvalidImage {
                reason: format!("{}: fd {} of id {:#x} out of range", self.name, addr, id),
            });
        }

        Ok(Some(fe))
    }

    /// Read all remaining records.
    pub fn read_all(&mut self) -> Result<Vec<FdRecord>> {
        let mut records = Vec::new();
        while let Some(fe) = self.read_record()? {
            records.push(fe);
        }
        Ok(records)
    }
}

pub struct FdinfoImageWriter {
    wr: BufWriter<File>,
}

impl FdinfoImageWriter {
    pub(crate) fn create(file: File) -> Result<Self> {
        let mut wr = BufWriter::new(file);
        wr.write_all(&FDINFO_MAGIC.to_le_bytes())?;
        Ok(Self { wr })
    }

    pub fn write_record(&mut self, fe: &FdRecord) -> Result<()> {
        let len = fe.path.len() as u32;

        let mut head = [0u8; FDINFO_HEAD_SIZE];
        head[0..8].copy_from_slice(&fe.id.to_le_bytes());
        head[8..16].copy_from_slice(&fe.addr.to_le_bytes());
        head[16..20].copy_from_slice(&(fe.kind as u32).to_le_bytes());
        head[20..24].copy_from_slice(&fe.flags.to_le_bytes());
        head[24..32].copy_from_slice(&fe.pos.to_le_bytes());
        head[32..36].copy_from_slice(&len.to_le_bytes());

        self.wr.write_all(&head)?;
        self.wr.write_all(&fe.path)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.wr.flush()?;
        Ok(())
    }
}
