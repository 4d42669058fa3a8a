use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrustError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Image file not found: {path}")]
    ImageNotFound { path: String },

    #[error("Invalid image format: {reason}")]
    InvalidImage { reason: String },

    #[error("Out of shared memory storing {what} (capacity {capacity})")]
    Capacity { what: &'static str, capacity: usize },

    #[error("Transport {op} failed for pid {pid} fd {fd}: {source}")]
    Transport {
        op: &'static str,
        pid: i32,
        fd: i64,
        #[source]
        source: io::Error,
    },

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("BUG: {0}")]
    Invariant(String),

    #[error("Restore of task {pid} failed with status {status:#x}")]
    TaskFailed { pid: i32, status: i32 },
}

impl CrustError {
    pub fn transport(op: &'static str, pid: i32, fd: i64, source: io::Error) -> Self {
        CrustError::Transport { op, pid, fd, source }
    }
}

pub type Result<T> = std::result::Result<T, CrustError>;
