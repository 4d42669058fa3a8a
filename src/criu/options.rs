//! Restore options - global configuration for the fd restore driver.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{CrustError, Result};

/// Abstract socket name prefix of the fd transport.
pub const DEFAULT_TRANSPORT_PREFIX: &str = "crust-fd";

/// Longest abstract socket name (sun_path without the leading NUL).
pub const TRANSPORT_NAME_MAX: usize = 107;

/// Widest "-<pid>-<fd>" suffix for any i32 pid and non-negative fd.
const TRANSPORT_SUFFIX_MAX: usize = 1 + 11 + 1 + 10;

/// Global options instance - initialized once at startup, read everywhere.
pub static OPTS: OnceLock<FdRestoreOpts> = OnceLock::new();

/// Initialize the global options.
pub fn opts_init(opts: FdRestoreOpts) -> std::result::Result<(), FdRestoreOpts> {
    OPTS.set(opts)
}

/// Get reference to global options. Panics if not initialized.
pub fn opts() -> &'static FdRestoreOpts {
    OPTS.get().expect("OPTS not initialized")
}

/// Get reference to global options, returning None if not initialized.
pub fn opts_try() -> Option<&'static FdRestoreOpts> {
    OPTS.get()
}

#[derive(Debug, Clone)]
pub struct FdRestoreOpts {
    pub image_dir: PathBuf,
    /// Capacity of the shared fdinfo table. `None` sizes it from the images.
    pub fdinfo_capacity: Option<usize>,
    pub transport_prefix: String,
    pub verbose: bool,
}

impl Default for FdRestoreOpts {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("."),
            fdinfo_capacity: None,
            transport_prefix: DEFAULT_TRANSPORT_PREFIX.to_string(),
            verbose: false,
        }
    }
}

impl FdRestoreOpts {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            ..Self::default()
        }
    }

    /// Reject options the restore can't honour.
    pub fn validate(&self) -> Result<()> {
        let max = TRANSPORT_NAME_MAX - TRANSPORT_SUFFIX_MAX;
        if self.transport_prefix.len() > max {
            return Err(CrustError::InvalidOption(format!(
                "transport prefix is {} bytes, at most {} fit in a socket name",
                self.transport_prefix.len(),
                max
            )));
        }
        Ok(())
    }
}

/// Transport prefix from the global options, or the default.
pub fn transport_prefix() -> &'static str {
    opts_try()
        .map(|o| o.transport_prefix.as_str())
        .unwrap_or(DEFAULT_TRANSPORT_PREFIX)
}
