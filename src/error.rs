use std::path::PathBuf;

use crate::alloc::Handle;
use crate::Hash;

/// error type for object store operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store is closed")]
    Closed,

    #[error("content missing for {0}")]
    MissingContent(Hash),

    #[error("corrupt content file for {hash}: {message}")]
    CorruptContent { hash: Hash, message: String },

    #[error("reference count underflow for {0}")]
    RefcountUnderflow(Hash),

    #[error("corrupt link for handle {handle}: {message}")]
    CorruptLink { handle: Handle, message: String },

    #[error("corrupt store state at {path}: {message}")]
    CorruptState { path: PathBuf, message: String },

    #[error("handle space exhausted")]
    HandlesExhausted,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cbor serialization error: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),
}

impl Error {
    /// true for errors that mean the on-disk invariants are broken
    /// (external tampering or a bug), as opposed to plain I/O failure
    pub fn is_inconsistency(&self) -> bool {
        matches!(
            self,
            Error::MissingContent(_)
                | Error::CorruptContent { .. }
                | Error::RefcountUnderflow(_)
                | Error::CorruptLink { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistency_classification() {
        assert!(Error::MissingContent(Hash::ZERO).is_inconsistency());
        assert!(Error::RefcountUnderflow(Hash::ZERO).is_inconsistency());
        assert!(Error::CorruptLink {
            handle: Handle::from_raw(3),
            message: "bad".into(),
        }
        .is_inconsistency());

        assert!(!Error::Closed.is_inconsistency());
        assert!(!Error::HandlesExhausted.is_inconsistency());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(!Err::<(), _>(io).with_path("/x").unwrap_err().is_inconsistency());
    }

    #[test]
    fn test_io_error_carries_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = Err::<(), _>(io).with_path("/store/data/abc").unwrap_err();
        assert!(err.to_string().contains("/store/data/abc"));
    }
}
