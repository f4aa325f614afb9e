//! reference-counted content files
//!
//! each unique blob lives in `data/<digest-hex>` as
//!
//! ```text
//! [refcount: i64 LE, 8 bytes][raw content bytes]
//! ```
//!
//! new content is written to a private file under `tmp/` without holding
//! the store lock ([`ContentFiles::stage`]), then installed under the lock
//! ([`ContentFiles::install`]). the header is the only part of a content
//! file that ever changes after install.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::fsutil::{fsync_dir, tmp_file_path};
use crate::hash::{ContentHasher, Hash};

/// size of the reference count header
pub const HEADER_LEN: u64 = 8;

const COPY_BUF_LEN: usize = 64 * 1024;

/// the `data/` directory
#[derive(Debug)]
pub struct ContentFiles {
    dir: PathBuf,
    tmp_dir: PathBuf,
    sync: bool,
}

impl ContentFiles {
    pub fn new(dir: PathBuf, tmp_dir: PathBuf, sync: bool) -> Self {
        Self { dir, tmp_dir, sync }
    }

    /// canonical path of a content file
    pub fn path(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hash.to_hex())
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.path(hash).exists()
    }

    /// write a zero-count header and `content` to a private temp file
    ///
    /// lock-free: nothing under `data/` is touched.
    pub fn stage(&self, hash: Hash, content: &[u8]) -> Result<StagedContent> {
        let staged = StagedContent::new(hash, tmp_file_path(&self.tmp_dir));
        {
            let path = &staged.path;
            let mut file = File::create(path).with_path(path)?;
            file.write_all(&0i64.to_le_bytes()).with_path(path)?;
            file.write_all(content).with_path(path)?;
            if self.sync {
                file.sync_all().with_path(path)?;
            }
        }
        Ok(staged)
    }

    /// stage content from a reader, hashing it on the way through
    pub fn stage_reader<R: Read>(&self, reader: &mut R) -> Result<StagedContent> {
        let mut staged = StagedContent::new(Hash::ZERO, tmp_file_path(&self.tmp_dir));

        let mut hasher = ContentHasher::new();
        {
            let path = &staged.path;
            let mut file = File::create(path).with_path(path)?;
            file.write_all(&0i64.to_le_bytes()).with_path(path)?;

            let mut buf = vec![0u8; COPY_BUF_LEN];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e).with_path(path),
                };
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).with_path(path)?;
            }

            if self.sync {
                file.sync_all().with_path(path)?;
            }
        }

        staged.hash = hasher.finalize();
        Ok(staged)
    }

    /// make a staged file canonical unless the digest already has one
    ///
    /// caller must hold the store lock. if the digest is already stored the
    /// staged copy is handed back untouched; dropping it removes the temp
    /// file, so callers drop it after releasing the lock.
    pub fn install(&self, mut staged: StagedContent) -> Result<Option<StagedContent>> {
        let target = self.path(&staged.hash);
        if target.exists() {
            debug!(hash = %staged.hash, "content already stored, discarding staged copy");
            return Ok(Some(staged));
        }

        fs::rename(&staged.path, &target).with_path(&target)?;
        staged.installed = true;

        if self.sync {
            fsync_dir(&self.dir)?;
        }

        debug!(hash = %staged.hash, "installed content");
        Ok(None)
    }

    /// add `delta` to the reference count, deleting the file at zero
    ///
    /// caller must hold the store lock. a missing file is an
    /// inconsistency, never a silent success.
    pub fn adjust_refcount(&self, hash: &Hash, delta: i64) -> Result<i64> {
        let path = self.path(hash);

        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingContent(*hash))
            }
            Err(e) => return Err(Error::Io { path, source: e }),
        };

        let current = read_header(&mut file, hash, &path)?;
        let updated = match current.checked_add(delta) {
            Some(n) if n >= 0 => n,
            _ => return Err(Error::RefcountUnderflow(*hash)),
        };

        if updated == 0 {
            drop(file);
            fs::remove_file(&path).with_path(&path)?;
            debug!(hash = %hash, "last reference dropped, content removed");
            return Ok(0);
        }

        file.seek(SeekFrom::Start(0)).with_path(&path)?;
        file.write_all(&updated.to_le_bytes()).with_path(&path)?;
        if self.sync {
            file.sync_data().with_path(&path)?;
        }

        Ok(updated)
    }

    /// current reference count
    pub fn refcount(&self, hash: &Hash) -> Result<i64> {
        let path = self.path(hash);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingContent(*hash))
            }
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        read_header(&mut file, hash, &path)
    }

    /// open a content file positioned after the header
    ///
    /// the open must happen under the store lock so the file cannot be
    /// unlinked between lookup and open. reading may continue after the
    /// lock is released, even if the file is unlinked meanwhile.
    pub fn open_for_read(&self, hash: &Hash) -> Result<ContentReader> {
        let path = self.path(hash);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingContent(*hash))
            }
            Err(e) => return Err(Error::Io { path, source: e }),
        };

        let total = file.metadata().with_path(&path)?.len();
        if total < HEADER_LEN {
            return Err(Error::CorruptContent {
                hash: *hash,
                message: format!("file is {} bytes, shorter than header", total),
            });
        }
        file.seek(SeekFrom::Start(HEADER_LEN)).with_path(&path)?;

        Ok(ContentReader {
            file,
            path,
            hash: *hash,
            len: total - HEADER_LEN,
        })
    }

    /// list stored digests; names that are not digests are returned separately
    pub fn list(&self) -> Result<(Vec<Hash>, Vec<String>)> {
        let mut hashes = Vec::new();
        let mut strays = Vec::new();

        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            let entry = entry.with_path(&self.dir)?;
            let name = entry.file_name().to_string_lossy().to_string();
            match Hash::from_hex(&name) {
                Ok(h) => hashes.push(h),
                Err(_) => strays.push(name),
            }
        }

        hashes.sort();
        Ok((hashes, strays))
    }
}

fn read_header(file: &mut File, hash: &Hash, path: &Path) -> Result<i64> {
    let mut header = [0u8; HEADER_LEN as usize];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::CorruptContent {
                hash: *hash,
                message: "truncated header".to_string(),
            })
        }
        Err(e) => return Err(e).with_path(path),
    }

    let count = i64::from_le_bytes(header);
    if count < 0 {
        return Err(Error::CorruptContent {
            hash: *hash,
            message: format!("negative reference count {}", count),
        });
    }
    Ok(count)
}

/// a fully written temp file that is not yet canonical
///
/// removed on drop unless it was installed.
#[derive(Debug)]
pub struct StagedContent {
    hash: Hash,
    path: PathBuf,
    installed: bool,
}

impl StagedContent {
    fn new(hash: Hash, path: PathBuf) -> Self {
        Self {
            hash,
            path,
            installed: false,
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl Drop for StagedContent {
    fn drop(&mut self) {
        if !self.installed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// open read handle on one content file, positioned at the payload
#[derive(Debug)]
pub struct ContentReader {
    file: File,
    path: PathBuf,
    hash: Hash,
    len: u64,
}

impl ContentReader {
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// payload length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// read the whole payload
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut content = Vec::with_capacity(self.len as usize);
        self.file
            .read_to_end(&mut content)
            .with_path(&self.path)?;
        Ok(content)
    }

    /// stream the payload into a writer
    pub fn copy_to<W: Write>(mut self, writer: &mut W) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut total = 0u64;
        loop {
            let n = self.file.read(&mut buf).with_path(&self.path)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).with_path(&self.path)?;
            total += n as u64;
        }
        Ok(total)
    }
}

impl Read for ContentReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}
