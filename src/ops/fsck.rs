use std::collections::HashMap;
use std::fmt;

use crate::alloc::Handle;
use crate::content::ContentReader;
use crate::error::{Error, Result};
use crate::hash::{ContentHasher, Hash};
use crate::store::ObjectStore;

/// fsck report
#[derive(Debug, Default)]
pub struct FsckReport {
    /// link records checked
    pub links_checked: usize,
    /// content files checked
    pub content_checked: usize,
    pub problems: Vec<Problem>,
}

impl FsckReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// one broken invariant found by [`fsck`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    /// link record that does not hold a digest
    CorruptLink { handle: Handle, message: String },
    /// link pointing at content that is not stored
    DanglingLink { handle: Handle, hash: Hash },
    /// live link whose handle the allocator considers free or never issued
    UnissuedHandle(Handle),
    /// stored count differs from the number of links
    RefcountMismatch { hash: Hash, stored: i64, links: usize },
    /// content file with a bad header
    CorruptContent { hash: Hash, message: String },
    /// content whose digest does not match its name
    DigestMismatch { hash: Hash, actual: Hash },
    /// file that does not belong in `data/` or `links/`
    StrayFile { dir: &'static str, name: String },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::CorruptLink { handle, message } => {
                write!(f, "link {}: corrupt: {}", handle, message)
            }
            Problem::DanglingLink { handle, hash } => {
                write!(f, "link {}: content {} missing", handle, hash)
            }
            Problem::UnissuedHandle(handle) => {
                write!(f, "link {}: handle is free or was never issued", handle)
            }
            Problem::RefcountMismatch {
                hash,
                stored,
                links,
            } => write!(
                f,
                "content {}: refcount {} but {} links",
                hash, stored, links
            ),
            Problem::CorruptContent { hash, message } => {
                write!(f, "content {}: corrupt: {}", hash, message)
            }
            Problem::DigestMismatch { hash, actual } => {
                write!(f, "content {}: payload hashes to {}", hash, actual)
            }
            Problem::StrayFile { dir, name } => write!(f, "{}/{}: unexpected file", dir, name),
        }
    }
}

/// verify store integrity
///
/// holds the store lock for the whole check, so concurrent callers stall
/// until it finishes.
pub fn fsck(store: &ObjectStore) -> Result<FsckReport> {
    store.with_lock(|inner, content| {
        let mut report = FsckReport::default();

        // links: parse, check allocator agreement, count per digest
        let (handles, link_strays) = inner.links.list()?;
        let mut linked: HashMap<Hash, Vec<Handle>> = HashMap::new();

        for handle in handles {
            report.links_checked += 1;

            if !inner.allocator.is_issued(handle) {
                report.problems.push(Problem::UnissuedHandle(handle));
            }

            match inner.links.read(handle) {
                Ok(Some(hash)) => linked.entry(hash).or_default().push(handle),
                Ok(None) => {}
                Err(Error::CorruptLink { handle, message }) => {
                    report.problems.push(Problem::CorruptLink { handle, message })
                }
                Err(e) => return Err(e),
            }
        }

        for name in link_strays {
            report.problems.push(Problem::StrayFile { dir: "links", name });
        }

        // content: header, refcount vs links, payload digest
        let (hashes, data_strays) = content.list()?;

        for hash in &hashes {
            report.content_checked += 1;
            let links = linked.remove(hash).map_or(0, |handles| handles.len());

            let stored = match content.refcount(hash) {
                Ok(n) => n,
                Err(Error::CorruptContent { message, .. }) => {
                    report.problems.push(Problem::CorruptContent {
                        hash: *hash,
                        message,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            if stored <= 0 || stored as usize != links {
                report.problems.push(Problem::RefcountMismatch {
                    hash: *hash,
                    stored,
                    links,
                });
            }

            if let Some(problem) = check_payload(content.open_for_read(hash)?)? {
                report.problems.push(problem);
            }
        }

        for name in data_strays {
            report.problems.push(Problem::StrayFile { dir: "data", name });
        }

        // whatever is left was linked but never found on disk
        let mut dangling: Vec<(Hash, Vec<Handle>)> = linked.into_iter().collect();
        dangling.sort();
        for (hash, handles) in dangling {
            for handle in handles {
                report.problems.push(Problem::DanglingLink { handle, hash });
            }
        }

        Ok(report)
    })
}

/// rehash the payload and compare it with the name it is stored under
fn check_payload(reader: ContentReader) -> Result<Option<Problem>> {
    let hash = reader.hash();
    let mut hasher = ContentHasher::new();
    reader.copy_to(&mut hasher)?;
    let actual = hasher.finalize();
    Ok((actual != hash).then_some(Problem::DigestMismatch { hash, actual }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PersistMode};
    use crate::hash::digest;
    use std::fs;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let config = Config {
            fsync: false,
            persist: PersistMode::Close,
        };
        let store = ObjectStore::open_with_config(&dir.path().join("store"), config).unwrap();
        (dir, store)
    }

    #[test]
    fn test_fsck_clean_store() {
        let (_dir, store) = test_store();
        store.put(b"a").unwrap();
        store.put(b"a").unwrap();
        store.put(b"b").unwrap();
        store.delete(Handle::from_raw(3)).unwrap();

        let report = fsck(&store).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.links_checked, 2);
        assert_eq!(report.content_checked, 1);
    }

    #[test]
    fn test_fsck_dangling_link() {
        let (_dir, store) = test_store();
        let handle = store.put(b"gone").unwrap();
        fs::remove_file(store.data_path().join(digest(b"gone").to_hex())).unwrap();

        let report = fsck(&store).unwrap();
        assert_eq!(
            report.problems,
            vec![Problem::DanglingLink {
                handle,
                hash: digest(b"gone")
            }]
        );
    }

    #[test]
    fn test_fsck_refcount_mismatch() {
        let (_dir, store) = test_store();
        store.put(b"x").unwrap();
        store.put(b"x").unwrap();
        fs::remove_file(store.links_path().join("2")).unwrap();

        let report = fsck(&store).unwrap();
        assert_eq!(
            report.problems,
            vec![Problem::RefcountMismatch {
                hash: digest(b"x"),
                stored: 2,
                links: 1
            }]
        );
    }

    #[test]
    fn test_fsck_digest_mismatch() {
        let (_dir, store) = test_store();
        store.put(b"original").unwrap();

        let path = store.data_path().join(digest(b"original").to_hex());
        let mut raw = fs::read(&path).unwrap();
        raw.truncate(8);
        raw.extend_from_slice(b"tampered");
        fs::write(&path, raw).unwrap();

        let report = fsck(&store).unwrap();
        assert_eq!(
            report.problems,
            vec![Problem::DigestMismatch {
                hash: digest(b"original"),
                actual: digest(b"tampered")
            }]
        );
    }

    #[test]
    fn test_fsck_corrupt_link_and_strays() {
        let (_dir, store) = test_store();
        store.put(b"x").unwrap();
        fs::write(store.links_path().join("1"), "not a digest").unwrap();
        fs::write(store.data_path().join("junk"), b"").unwrap();

        let report = fsck(&store).unwrap();
        assert!(report
            .problems
            .iter()
            .any(|p| matches!(p, Problem::CorruptLink { .. })));
        assert!(report.problems.contains(&Problem::StrayFile {
            dir: "data",
            name: "junk".to_string()
        }));
        // the content lost its only parseable link
        assert!(report
            .problems
            .iter()
            .any(|p| matches!(p, Problem::RefcountMismatch { links: 0, .. })));
    }

    #[test]
    fn test_fsck_unissued_handle() {
        let (_dir, store) = test_store();
        store.put(b"x").unwrap();
        fs::copy(store.links_path().join("1"), store.links_path().join("50")).unwrap();

        let report = fsck(&store).unwrap();
        assert!(report
            .problems
            .contains(&Problem::UnissuedHandle(Handle::from_raw(50))));
    }

    #[test]
    fn test_problem_display() {
        let p = Problem::UnissuedHandle(Handle::from_raw(7));
        assert_eq!(p.to_string(), "link 7: handle is free or was never issued");
    }
}
