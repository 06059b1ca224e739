use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("connect fail: {0}")]
    Connect(String),
    #[error("device not connected")]
    NotConnected,
    #[error("invalid device type {0}")]
    InvalidDeviceType(String),
    #[error("storage group {0} already exists")]
    StorageGroupExists(String),
    #[error("storage group {0} does not exist")]
    StorageGroupNotFound(String),
    #[error("container {0} already exists")]
    ContainerExists(String),
    #[error("container {0} does not exist")]
    ContainerNotFound(String),
    #[error("no active storage group")]
    NoActiveStorageGroup,
    #[error("io fail on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("short transfer on {path}, expected {expected} bytes, transferred {actual}")]
    ShortTransfer {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid config: {0}")]
    Config(String),
    #[error("unknown error")]
    Unknown,
}

impl DeviceError {
    /// Wraps an io error with the path it happened on. Device errors that were
    /// tunnelled through an `io::Error` by a `Read`/`Write` impl come back out as-is.
    pub fn from_io(path: impl Into<String>, err: io::Error) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<DeviceError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(e) = inner.downcast::<DeviceError>() {
                    return *e;
                }
            }
            return DeviceError::Unknown;
        }
        DeviceError::Io {
            path: path.into(),
            source: err,
        }
    }

    pub fn not_found(path: impl Into<String>, detail: &str) -> Self {
        DeviceError::Io {
            path: path.into(),
            source: io::Error::new(io::ErrorKind::NotFound, detail.to_owned()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Self::StorageGroupNotFound(_) | Self::ContainerNotFound(_) => true,
            _ => false,
        }
    }

    pub fn is_namespace(&self) -> bool {
        matches!(
            self,
            Self::StorageGroupExists(_)
                | Self::StorageGroupNotFound(_)
                | Self::ContainerExists(_)
                | Self::ContainerNotFound(_)
                | Self::NoActiveStorageGroup
        )
    }
}

impl PartialEq for DeviceError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io { source: l, .. }, Self::Io { source: r, .. }) => l.kind() == r.kind(),
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<DeviceError> for io::Error {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Io { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

pub(crate) trait IoResultExt<T> {
    fn at(self, path: &str) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &str) -> Result<T> {
        self.map_err(|e| DeviceError::from_io(path, e))
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
