//! small filesystem helpers shared by the on-disk layers

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

/// fresh, uniquely named path inside the staging directory
pub(crate) fn tmp_file_path(tmp_dir: &Path) -> PathBuf {
    tmp_dir.join(uuid::Uuid::new_v4().to_string())
}

/// fsync a directory
pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

/// remove leftover staging files, returning how many were removed
pub(crate) fn clear_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        let path = entry.path();
        if path.is_file() {
            fs::remove_file(&path).with_path(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
