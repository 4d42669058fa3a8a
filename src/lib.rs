// Core modules
pub mod criu;
pub mod error;
pub mod images;

pub use criu::cr_restore::restore_files;
pub use criu::files::{FdRestore, FdState, FdinfoTable};
pub use error::{CrustError, Result};
