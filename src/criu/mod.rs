pub mod cr_restore;
pub mod files;
pub mod files_reg;
pub mod lock;
pub mod log;
pub mod options;
pub mod rst_malloc;
pub mod scm;
pub mod sk_unix;
pub mod stats;
pub mod util;
