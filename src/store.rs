use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::alloc::{Handle, HandleAllocator};
use crate::config::{Config, PersistMode};
use crate::content::{ContentFiles, ContentReader, StagedContent};
use crate::error::{Error, IoResultExt, Result};
use crate::fsutil::clear_dir;
use crate::hash::{digest, Hash};
use crate::links::LinkTable;
use crate::state::StoreState;

const DATA_DIR: &str = "data";
const LINKS_DIR: &str = "links";
const TMP_DIR: &str = "tmp";
const STATE_FILE: &str = "state";
const CONFIG_FILE: &str = "config.toml";

/// a deduplicating object store rooted at one directory
///
/// share it between threads as `Arc<ObjectStore>`. one mutex serializes
/// metadata changes (links, allocator, reference counts); content bytes are
/// written and read outside of it.
///
/// # Platform requirement
///
/// reads rely on delete-on-last-close: a content file opened under the lock
/// must stay readable after a concurrent delete unlinks it. this holds on
/// unix, and on windows for handles opened by the standard library (which
/// requests `FILE_SHARE_DELETE`).
///
/// only one process may use a store directory at a time; nothing here
/// guards against a second one.
pub struct ObjectStore {
    path: PathBuf,
    config: Config,
    content: ContentFiles,
    inner: Mutex<Inner>,
}

/// everything guarded by the store lock
pub(crate) struct Inner {
    pub(crate) allocator: HandleAllocator,
    pub(crate) links: LinkTable,
    closed: bool,
}

impl ObjectStore {
    /// open (or create) a store, reading `config.toml` if present
    pub fn open(path: &Path) -> Result<Self> {
        let config = Config::load_or_default(&path.join(CONFIG_FILE))?;
        Self::open_with_config(path, config)
    }

    /// open (or create) a store with an explicit configuration
    pub fn open_with_config(path: &Path, config: Config) -> Result<Self> {
        let data_path = path.join(DATA_DIR);
        let links_path = path.join(LINKS_DIR);
        let tmp_path = path.join(TMP_DIR);

        // create_dir_all only tolerates "already exists"
        fs::create_dir_all(&data_path).with_path(&data_path)?;
        fs::create_dir_all(&links_path).with_path(&links_path)?;
        fs::create_dir_all(&tmp_path).with_path(&tmp_path)?;

        let stale = clear_dir(&tmp_path)?;
        if stale > 0 {
            warn!(count = stale, "removed stale staging files");
        }

        let state_path = path.join(STATE_FILE);
        let state = StoreState::load(&state_path)?;
        let mut allocator = HandleAllocator::restore(state).map_err(|message| {
            Error::CorruptState {
                path: state_path.clone(),
                message,
            }
        })?;

        // a crash before close leaves the state file behind links/
        let links = LinkTable::new(links_path, tmp_path.clone(), config.fsync);
        let (live, _) = links.list()?;
        let saved_next = allocator.next_handle();
        let unfreed = allocator.reconcile(&live);
        if allocator.next_handle() != saved_next || unfreed > 0 {
            warn!(
                saved_next,
                next_handle = allocator.next_handle(),
                unfreed,
                "allocator state behind links, repaired"
            );
        }

        info!(
            path = %path.display(),
            next_handle = allocator.next_handle(),
            free_handles = allocator.free_handles().len(),
            "opened object store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            content: ContentFiles::new(data_path, tmp_path, config.fsync),
            inner: Mutex::new(Inner {
                allocator,
                links,
                closed: false,
            }),
            config,
        })
    }

    /// store root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// store configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// path to content files
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    /// path to link records
    pub fn links_path(&self) -> PathBuf {
        self.path.join(LINKS_DIR)
    }

    /// path to the staging directory
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join(TMP_DIR)
    }

    /// path to the persisted allocator state
    pub fn state_path(&self) -> PathBuf {
        self.path.join(STATE_FILE)
    }

    /// store a blob and return a fresh handle for it
    ///
    /// after return, `get(handle)` yields `content` until `delete(handle)`.
    pub fn put(&self, content: &[u8]) -> Result<Handle> {
        let hash = digest(content);

        let staged = if self.content.exists(&hash) {
            None
        } else {
            Some(self.content.stage(hash, content)?)
        };

        if let Some(handle) = self.link_content(hash, staged)? {
            return Ok(handle);
        }

        // the content existed at the check but its last handle was deleted
        // before we got the lock
        debug!(hash = %hash, "content vanished before linking, staging");
        let staged = self.content.stage(hash, content)?;
        self.link_content(hash, Some(staged))?
            .ok_or(Error::MissingContent(hash))
    }

    /// store a blob read from `reader`, streaming it to disk
    pub fn put_reader<R: Read>(&self, reader: &mut R) -> Result<Handle> {
        let staged = self.content.stage_reader(reader)?;
        let hash = staged.hash();
        self.link_content(hash, Some(staged))?
            .ok_or(Error::MissingContent(hash))
    }

    /// install (if needed), allocate, link and count, in one critical section
    ///
    /// returns `None` only if nothing was staged and the content is gone.
    fn link_content(&self, hash: Hash, staged: Option<StagedContent>) -> Result<Option<Handle>> {
        // declared before the guard so its temp file goes after unlock
        let mut discarded = None;
        let mut inner = self.lock()?;

        let mut installed = false;
        if !self.content.exists(&hash) {
            match staged {
                Some(staged) => {
                    discarded = self.content.install(staged)?;
                    installed = discarded.is_none();
                }
                None => return Ok(None),
            }
        }

        // undo this call's own steps; a fresh install must not stay behind
        // with a zero count
        let unwind = |inner: &mut Inner, handle: Option<Handle>| {
            if let Some(handle) = handle {
                if let Err(e) = inner.links.remove(handle) {
                    warn!(handle = %handle, error = %e, "failed to roll back link");
                }
                inner.allocator.release(handle);
            }
            if installed {
                let path = self.content.path(&hash);
                if let Err(e) = fs::remove_file(&path) {
                    warn!(hash = %hash, error = %e, "failed to roll back installed content");
                }
            }
        };

        let handle = match inner.allocator.allocate() {
            Ok(handle) => handle,
            Err(e) => {
                unwind(&mut *inner, None);
                return Err(e);
            }
        };

        if let Err(e) = inner.links.create(handle, &hash) {
            unwind(&mut *inner, Some(handle));
            return Err(e);
        }

        if let Err(e) = self.content.adjust_refcount(&hash, 1) {
            unwind(&mut *inner, Some(handle));
            return Err(e);
        }

        self.checkpoint(&inner);
        debug!(handle = %handle, hash = %hash, "put");
        Ok(Some(handle))
    }

    /// fetch a blob, `None` if the handle is not live
    pub fn get(&self, handle: Handle) -> Result<Option<Vec<u8>>> {
        match self.reader(handle)? {
            Some(reader) => reader.read_all().map(Some),
            None => Ok(None),
        }
    }

    /// stream a blob into `writer`, returning the byte count
    pub fn get_to<W: Write>(&self, handle: Handle, writer: &mut W) -> Result<Option<u64>> {
        match self.reader(handle)? {
            Some(reader) => reader.copy_to(writer).map(Some),
            None => Ok(None),
        }
    }

    /// resolve a handle and open its content
    ///
    /// the lock is held only for the lookup and the open; reading from the
    /// returned reader happens without it.
    pub fn reader(&self, handle: Handle) -> Result<Option<ContentReader>> {
        let inner = self.lock()?;
        let Some(hash) = inner.links.read(handle)? else {
            return Ok(None);
        };
        let reader = self.content.open_for_read(&hash)?;
        drop(inner);
        Ok(Some(reader))
    }

    /// true if the handle is live
    pub fn contains(&self, handle: Handle) -> Result<bool> {
        let inner = self.lock()?;
        Ok(inner.links.read(handle)?.is_some())
    }

    /// drop a handle, removing its content if it was the last reference
    ///
    /// deleting a handle that is not live is a no-op and returns false.
    pub fn delete(&self, handle: Handle) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(hash) = inner.links.read(handle)? else {
            return Ok(false);
        };

        let remaining = self.content.adjust_refcount(&hash, -1)?;
        inner.links.remove(handle)?;
        inner.allocator.release(handle);

        self.checkpoint(&inner);
        debug!(handle = %handle, hash = %hash, remaining, "delete");
        Ok(true)
    }

    /// persist allocator state; later calls fail with `Error::Closed`
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        self.save_state(&inner)?;
        inner.closed = true;
        info!(path = %self.path.display(), "closed object store");
        Ok(())
    }

    /// run `f` while holding the store lock
    pub(crate) fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner, &ContentFiles) -> Result<T>,
    {
        let inner = self.lock()?;
        f(&*inner, &self.content)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        Ok(inner)
    }

    fn save_state(&self, inner: &Inner) -> Result<()> {
        inner
            .allocator
            .snapshot()
            .save(&self.state_path(), &self.tmp_path(), self.config.fsync)
    }

    /// in `mutation` mode, save state after a change
    ///
    /// the change itself already happened, so a failed save is logged and
    /// retried at the next change or at close.
    fn checkpoint(&self, inner: &Inner) {
        if self.config.persist != PersistMode::Mutation {
            return;
        }
        if let Err(e) = self.save_state(inner) {
            warn!(error = %e, "failed to checkpoint store state");
        }
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.closed {
            return;
        }
        let result = inner.allocator.snapshot().save(
            &self.path.join(STATE_FILE),
            &self.path.join(TMP_DIR),
            self.config.fsync,
        );
        if let Err(e) = result {
            warn!(error = %e, "failed to save store state on drop");
        }
    }
}
