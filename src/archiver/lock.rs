use std::fs::{self, File};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, IoResultExt, Result};

/// guard that holds an exclusive per-resource lock until dropped
///
/// downloads do not take this lock themselves; callers that may run
/// concurrent downloads of one resource on the same host wrap them in it.
pub struct ResourceLock {
    #[allow(dead_code)]
    flock: Flock<File>,
    path: PathBuf,
}
// lock is released automatically when Flock is dropped

impl ResourceLock {
    /// acquire the lock at `path` without blocking
    pub fn acquire(path: &Path) -> Result<Self> {
        match Self::try_acquire(path)? {
            Some(lock) => Ok(lock),
            None => Err(Error::LockContention(path.to_path_buf())),
        }
    }

    /// try to acquire the lock, returning None if another holder has it
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let file = File::create(path).with_path(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self {
                flock,
                path: path.to_path_buf(),
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(errno),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
