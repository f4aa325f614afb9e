//! objstore - deduplicating object store
//!
//! callers hand in opaque byte blobs and get back small integer handles.
//! identical content is stored once on disk with a reference count of the
//! handles pointing at it; the file goes away when the last handle is
//! deleted. handles are recycled after delete.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   data/<sha256-hex>   [refcount: i64 LE][content]
//!   links/<handle>      hex digest the handle points at
//!   state               CBOR allocator state (next handle, free pool)
//!   tmp/                private staging files
//!   config.toml         optional, see [`Config`]
//! ```
//!
//! # Concurrency
//!
//! one [`ObjectStore`] can be shared between threads. a single lock
//! serializes link, allocator and refcount changes. content bytes are
//! written to a staging file and read from an already-open file without
//! holding it, so slow I/O on one blob does not stall other callers.
//!
//! # Example usage
//!
//! ```no_run
//! use objstore::ObjectStore;
//! use std::path::Path;
//!
//! let store = ObjectStore::open(Path::new("/path/to/store")).unwrap();
//!
//! let a = store.put(b"hello world!").unwrap();
//! let b = store.put(b"hello world!").unwrap(); // same content, one file
//! assert_ne!(a, b);
//!
//! assert_eq!(store.get(a).unwrap().as_deref(), Some(&b"hello world!"[..]));
//!
//! store.delete(a).unwrap();
//! store.close().unwrap();
//! ```

mod alloc;
mod config;
mod content;
mod error;
mod fsutil;
mod hash;
mod links;
mod state;
mod store;

pub mod ops;

pub use alloc::{Handle, HandleAllocator};
pub use config::{Config, PersistMode};
pub use content::{ContentReader, HEADER_LEN};
pub use error::{Error, Result};
pub use hash::{digest, ContentHasher, Hash};
pub use state::StoreState;
pub use store::ObjectStore;
