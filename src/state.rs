use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::fsutil::{fsync_dir, tmp_file_path};

/// persisted allocator state stored in `<root>/state`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    /// highest handle ever issued
    pub next_handle: u64,
    /// freed handles awaiting reuse, in pool order
    pub free_handles: Vec<u64>,
}

impl StoreState {
    /// load state; a missing file means a fresh store
    pub fn load(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        ciborium::from_reader(BufReader::new(file)).map_err(|e| Error::CorruptState {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// save state atomically via a temp file in `tmp_dir`
    pub fn save(&self, path: &Path, tmp_dir: &Path, sync: bool) -> Result<()> {
        let tmp_path = tmp_file_path(tmp_dir);
        {
            let file = File::create(&tmp_path).with_path(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            ciborium::into_writer(self, &mut writer)?;
            writer.flush().with_path(&tmp_path)?;
            if sync {
                writer.get_ref().sync_all().with_path(&tmp_path)?;
            }
        }

        fs::rename(&tmp_path, path).with_path(path)?;

        if sync {
            if let Some(parent) = path.parent() {
                fsync_dir(parent)?;
            }
        }

        Ok(())
    }
}
