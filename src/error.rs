use thiserror::Error;

use crate::branch::BIndex;

#[derive(Error, Debug)]
pub enum UnionError {
    /// No writable branch can take the write.
    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    /// Cached branch linkage no longer matches the real objects.
    #[error("busy or stale linkage: {0}")]
    Stale(String),

    #[error("branch busy: {0}")]
    BranchBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("permission denied: {0}")]
    Access(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("cross-branch operation not supported: {0}")]
    CrossDevice(String),

    #[error("invalid branch: {0}")]
    InvalidBranch(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("branch index {0} out of range")]
    NoSuchBranch(BIndex),

    #[error("work queue closed")]
    QueueClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl UnionError {
    /// POSIX errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            UnionError::ReadOnly(_) => libc::EROFS,
            UnionError::Stale(_) => libc::ESTALE,
            UnionError::BranchBusy(_) => libc::EBUSY,
            UnionError::NotFound(_) => libc::ENOENT,
            UnionError::AlreadyExists(_) => libc::EEXIST,
            UnionError::NotADirectory(_) => libc::ENOTDIR,
            UnionError::IsADirectory(_) => libc::EISDIR,
            UnionError::NotEmpty(_) => libc::ENOTEMPTY,
            UnionError::Access(_) => libc::EACCES,
            UnionError::NotPermitted(_) => libc::EPERM,
            UnionError::NameTooLong(_) => libc::ENAMETOOLONG,
            UnionError::CrossDevice(_) => libc::EXDEV,
            UnionError::InvalidBranch(_) | UnionError::Invalid(_) => libc::EINVAL,
            UnionError::NoSuchBranch(_) => libc::ENOENT,
            UnionError::QueueClosed => libc::EIO,
            UnionError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            UnionError::Json(_) => libc::EINVAL,
            UnionError::Nix(e) => *e as i32,
        }
    }

    /// True for the busy/stale class: the caller raced a concurrent mutation.
    pub fn is_stale(&self) -> bool {
        matches!(self, UnionError::Stale(_))
    }
}

pub type Result<T> = std::result::Result<T, UnionError>;
