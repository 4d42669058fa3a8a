pub mod fdinfo;
pub mod reader;

pub use fdinfo::{FdKind, FdRecord, FdinfoImage, FdinfoImageWriter};
pub use reader::ImageDir;
