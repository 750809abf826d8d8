use std::path::{Path, PathBuf};

use thiserror::Error;

/// Coarse class of an [`UpdateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Protocol,
    Format,
    Integrity,
    Stale,
    Storage,
    Codec,
    Archive,
    Precondition,
    Config,
    Internal,
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("network error while fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server returned HTTP {status} for {url} (expected {expected})")]
    Status {
        url: String,
        status: u16,
        expected: u16,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("corrupt download: {0}")]
    Corrupt(String),

    #[error("unsupported patch format: pack version {0}")]
    UnsupportedPackVersion(u8),

    #[error("corrupt download: patch checksum does not match its contents")]
    Integrity,

    #[error("not a newer version: remote patch {remote} is not newer than local version {local}")]
    Stale { remote: u32, local: u32 },

    #[error("nothing to install: {} is missing", .0.display())]
    NoPatchFound(PathBuf),

    #[error("the active bundle has no assets archive at {}", .0.display())]
    MissingLocalAssets(PathBuf),

    #[error("no active bundle generation")]
    NoActiveGeneration,

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("archive extraction failed: {0}")]
    Archive(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background task panicked or was cancelled.
    #[error("update worker failed: {0}")]
    Worker(String),
}

impl UpdateError {
    pub fn storage(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        UpdateError::Storage {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn network(url: &str, source: reqwest::Error) -> Self {
        UpdateError::Network {
            url: url.to_string(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Network { .. } | UpdateError::Status { .. } => ErrorKind::Network,
            UpdateError::Protocol(_) => ErrorKind::Protocol,
            UpdateError::Corrupt(_) | UpdateError::UnsupportedPackVersion(_) => ErrorKind::Format,
            UpdateError::Integrity => ErrorKind::Integrity,
            UpdateError::Stale { .. } => ErrorKind::Stale,
            UpdateError::Storage { .. } => ErrorKind::Storage,
            UpdateError::Codec(_) => ErrorKind::Codec,
            UpdateError::Archive(_) => ErrorKind::Archive,
            UpdateError::NoPatchFound(_)
            | UpdateError::MissingLocalAssets(_)
            | UpdateError::NoActiveGeneration => ErrorKind::Precondition,
            UpdateError::Config(_) => ErrorKind::Config,
            UpdateError::Worker(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
