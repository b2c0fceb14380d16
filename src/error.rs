//! Unified error surface for volume, file and device operations.
//!
//! The engine reports structural rejects through the same taxonomy so hosts
//! see one error type regardless of which side of the boundary failed.
//! `From<std::io::Error>` folds device-level failures into it.

use crate::engine::FileId;
use std::fmt;
use std::io::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VolError>;

/// Optional file-id context for log/display purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHint(Option<FileId>);

impl FileHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(file: FileId) -> Self {
        Self(Some(file))
    }
}

impl fmt::Display for FileHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, ": file {id}"),
            None => Ok(()),
        }
    }
}

impl From<FileId> for FileHint {
    fn from(value: FileId) -> Self {
        Self::some(value)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VolError {
    #[error("not found{file}")]
    NotFound { file: FileHint },

    #[error("already exists{file}")]
    AlreadyExists { file: FileHint },

    #[error("not empty{file}")]
    NotEmpty { file: FileHint },

    #[error("too many links")]
    TooManyLinks,

    #[error("name too long")]
    NameTooLong,

    #[error("invalid name")]
    InvalidName,

    #[error("no space left on volume")]
    NoSpace,

    #[error("file too big")]
    FileTooBig,

    #[error("read-only volume")]
    ReadOnly,

    #[error("not supported")]
    NotSupported,

    #[error("corruption detected{file}")]
    Corruption { file: FileHint },

    #[error("stale handle")]
    Stale,

    #[error("i/o error")]
    IoError,
}

impl VolError {
    pub fn not_found(file: FileId) -> Self {
        VolError::NotFound { file: file.into() }
    }

    pub fn corruption(file: FileId) -> Self {
        VolError::Corruption { file: file.into() }
    }

    /// Whether the error poisons a later fsync when hit on a write-back path.
    pub(crate) fn is_sticky(&self) -> bool {
        matches!(self, VolError::Corruption { .. } | VolError::IoError)
    }
}

impl From<std::io::Error> for VolError {
    fn from(value: std::io::Error) -> Self {
        // Device and host I/O errors; anything without a clear slot is IoError.
        match value.kind() {
            ErrorKind::NotFound => VolError::NotFound {
                file: FileHint::none(),
            },
            ErrorKind::AlreadyExists => VolError::AlreadyExists {
                file: FileHint::none(),
            },
            ErrorKind::DirectoryNotEmpty => VolError::NotEmpty {
                file: FileHint::none(),
            },
            ErrorKind::TooManyLinks => VolError::TooManyLinks,
            ErrorKind::InvalidFilename => VolError::InvalidName,
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => VolError::NoSpace,
            ErrorKind::FileTooLarge => VolError::FileTooBig,
            ErrorKind::ReadOnlyFilesystem => VolError::ReadOnly,
            ErrorKind::Unsupported => VolError::NotSupported,
            ErrorKind::InvalidData => VolError::Corruption {
                file: FileHint::none(),
            },
            ErrorKind::StaleNetworkFileHandle => VolError::Stale,
            _ => VolError::IoError,
        }
    }
}
