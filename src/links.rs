use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use crate::alloc::Handle;
use crate::error::{Error, IoResultExt, Result};
use crate::fsutil::{fsync_dir, tmp_file_path};
use crate::hash::Hash;

/// handle -> digest bindings, one small file per handle under `links/`
///
/// no internal synchronization: every call happens under the store lock.
#[derive(Debug)]
pub struct LinkTable {
    dir: PathBuf,
    tmp_dir: PathBuf,
    sync: bool,
}

impl LinkTable {
    pub fn new(dir: PathBuf, tmp_dir: PathBuf, sync: bool) -> Self {
        Self { dir, tmp_dir, sync }
    }

    /// write a link (create or overwrite a stale leftover)
    pub fn create(&self, handle: Handle, hash: &Hash) -> Result<()> {
        let link_path = self.path(handle);

        // atomic write: temp -> fsync -> rename
        let tmp_path = tmp_file_path(&self.tmp_dir);
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file
                .write_all(hash.to_hex().as_bytes())
                .with_path(&tmp_path)?;
            if self.sync {
                tmp_file.sync_all().with_path(&tmp_path)?;
            }
        }

        if let Err(e) = fs::rename(&tmp_path, &link_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io {
                path: link_path,
                source: e,
            });
        }

        if self.sync {
            fsync_dir(&self.dir)?;
        }

        Ok(())
    }

    /// read the digest a handle points at, `None` if the handle is not live
    pub fn read(&self, handle: Handle) -> Result<Option<Hash>> {
        let link_path = self.path(handle);

        let content = match fs::read_to_string(&link_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(Error::CorruptLink {
                    handle,
                    message: "not utf-8".to_string(),
                })
            }
            Err(e) => {
                return Err(Error::Io {
                    path: link_path,
                    source: e,
                })
            }
        };

        Hash::from_hex(content.trim())
            .map(Some)
            .map_err(|_| Error::CorruptLink {
                handle,
                message: format!("not a digest: {:?}", content),
            })
    }

    /// remove a link; absent links are fine
    pub fn remove(&self, handle: Handle) -> Result<()> {
        let link_path = self.path(handle);
        match fs::remove_file(&link_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io {
                path: link_path,
                source: e,
            }),
        }
    }

    /// list all live handles, sorted
    ///
    /// file names that are not handles are returned separately so callers
    /// (fsck) can report them.
    pub fn list(&self) -> Result<(Vec<Handle>, Vec<String>)> {
        let mut handles = Vec::new();
        let mut strays = Vec::new();

        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            let entry = entry.with_path(&self.dir)?;
            let name = entry.file_name().to_string_lossy().to_string();
            match name.parse::<Handle>() {
                Ok(h) if h.get() > 0 => handles.push(h),
                _ => strays.push(name),
            }
        }

        handles.sort();
        Ok((handles, strays))
    }

    fn path(&self, handle: Handle) -> PathBuf {
        self.dir.join(handle.to_string())
    }
}
