// Image directory access
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::fdinfo::{FdinfoImage, FdinfoImageWriter};
use crate::error::{CrustError, Result};

pub struct ImageDir {
    path: PathBuf,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(CrustError::ImageNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(ImageDir { path })
    }

    pub fn fdinfo_name(pid: i32) -> String {
        format!("fdinfo-{}.img", pid)
    }

    /// Open fdinfo image for a restored pid.
    ///
    /// A process without an image simply has no fds, so a missing file
    /// is `Ok(None)` rather than an error.
    pub fn open_fdinfo(&self, pid: i32) -> Result<Option<FdinfoImage>> {
        let filename = Self::fdinfo_name(pid);
        let img_path = self.path.join(&filename);
        match File::open(&img_path) {
            Ok(file) => FdinfoImage::open(file, filename).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_fdinfo(&self, pid: i32) -> Result<FdinfoImageWriter> {
        let img_path = self.path.join(Self::fdinfo_name(pid));
        let file = File::create(&img_path)?;
        FdinfoImageWriter::create(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
