use std::path::PathBuf;

/// error type for archivist operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid resource name: {0}")]
    InvalidResource(String),

    #[error("invalid generation: {0}")]
    InvalidGeneration(String),

    #[error("invalid compression mode: {0}")]
    InvalidCompression(String),

    #[error("corrupt archive: {message}")]
    CorruptArchive { message: String },

    #[error("unexpected local state at {0}")]
    StaleState(PathBuf),

    #[error("source directory not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("resource is locked by another process: {0}")]
    LockContention(PathBuf),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("backend misconfigured: {0}")]
    Backend(String),
}

impl Error {
    /// network or filesystem failures the caller may choose to retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Transport { .. })
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Error::CorruptArchive {
            message: message.into(),
        }
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
    fn test_transient_classification() {
        let io = Error::Io {
            path: PathBuf::from("/tmp/x"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        };
        assert!(io.is_transient());
        assert!(Error::transport("connection reset").is_transient());

        assert!(!Error::NotFound("svc/res.tgz".into()).is_transient());
        assert!(!Error::corrupt("bad header").is_transient());
        assert!(!Error::StaleState(PathBuf::from("/x/current")).is_transient());
    }

    #[test]
    fn test_with_path_keeps_context() {
        let res: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = res.with_path("/some/where").unwrap_err();
        match err {
            Error::Io { path, source } => {
                assert_eq!(path, PathBuf::from("/some/where"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
