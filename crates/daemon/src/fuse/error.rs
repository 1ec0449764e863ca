use common::error::RemoteError;

/// Failures of a filesystem operation, before they are turned into an errno
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("{0} is not open")]
    NotOpen(String),
    #[error("{0} is a directory")]
    IsDirectory(String),
    #[error("{0} is not a directory")]
    NotDirectory(String),
    /// The local scratch copy could not be read or written
    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is busy")]
    Busy(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::Remote(RemoteError::NotFound(_)) => libc::ENOENT,
            FsError::Remote(RemoteError::PermissionDenied(_)) => libc::EPERM,
            FsError::Remote(_) => libc::EIO,
            FsError::NotOpen(_) => libc::EBADF,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::Io(_) => libc::EIO,
            FsError::Busy(_) => libc::EBUSY,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Remote(RemoteError::NotFound(_)))
    }
}
