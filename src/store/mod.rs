//! generation-addressed blob backends
//!
//! a backend stores immutable revisions of content at a path. every
//! successful write yields a new generation, assigned by the backend and
//! never reused; readers address content by path (latest) or by an explicit
//! generation.

pub mod gcs;
pub mod local;

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

pub use gcs::GcsStore;
pub use local::LocalFsStore;

/// backend-assigned revision identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Generation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Generation)
            .map_err(|_| Error::InvalidGeneration(s.to_string()))
    }
}

/// address of a blob: bucket plus object path
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobId {
    pub bucket: String,
    pub path: String,
}

impl BlobId {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}

/// metadata for one revision of a blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    pub generation: Generation,
    pub size: Option<u64>,
}

/// chunked sink for large uploads
///
/// nothing becomes visible until `finish` succeeds. dropping the writer
/// without finishing abandons the upload.
pub trait BlobWriter: Write {
    /// finalize the upload atomically, returning the new generation
    fn finish(self: Box<Self>) -> Result<Generation>;
}

/// capability surface of a generation-addressed blob backend
///
/// stores are shared across threads; callers serialize work per resource.
pub trait VersionStore: Send + Sync {
    /// metadata for the latest generation at `id`
    fn get(&self, id: &BlobId) -> Result<Blob>;

    /// atomically store a small payload as a new generation
    fn create(&self, id: &BlobId, content: &[u8]) -> Result<Generation>;

    /// open a chunked writer for a large payload
    fn writer(&self, id: &BlobId) -> Result<Box<dyn BlobWriter>>;

    /// stream the content of one generation
    fn open(&self, id: &BlobId, generation: Generation) -> Result<Box<dyn Read>>;

    /// copy the content of one generation into a local file
    fn download_to(&self, id: &BlobId, generation: Generation, dest: &Path) -> Result<u64> {
        let mut reader = self.open(id, generation)?;
        let mut file = File::create(dest).with_path(dest)?;
        let copied = io::copy(&mut reader, &mut file).map_err(|e| {
            Error::transport(format!("downloading {id}@{generation}: {e}"))
        })?;
        file.sync_all().with_path(dest)?;
        Ok(copied)
    }

    /// full object paths in `bucket` starting with `prefix`
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}
