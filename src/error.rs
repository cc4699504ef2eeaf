use std::path::{Path, PathBuf};

/// Failures surfaced by the sync core and the remote store.
///
/// Per-file errors are logged and retried at the next natural trigger; only
/// construction-time errors (`Config`, folder resolution) are fatal.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("sync engine already running")]
    AlreadyRunning,

    #[error("sync engine not running")]
    NotRunning,
}

impl SyncError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        SyncError::Remote(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Remote(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mentions_path() {
        let err = SyncError::io(
            Path::new("/tmp/missing.txt"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/tmp/missing.txt"));
        assert!(!SyncError::remote("boom").is_not_found());
    }
}
