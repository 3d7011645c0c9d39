//! local filesystem blob backend
//!
//! each blob path is a directory holding one file per generation:
//!
//! ```text
//! <root>/<bucket>/svc/res.tgz/1700000000000000000
//! <root>/<bucket>/svc/res.tgz/1700000000000000001
//! ```
//!
//! writes land in a temp file inside the blob directory and are published
//! with a hardlink to the generation name, which fails if the name is taken,
//! so generations are never reused or overwritten.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;
use walkdir::WalkDir;

use super::{Blob, BlobId, BlobWriter, Generation, VersionStore};
use crate::error::{Error, IoResultExt, Result};

/// blob store backed by a local directory
#[derive(Clone, Debug)]
pub struct LocalFsStore {
    root: PathBuf,
    first_generation: Option<u64>,
}

impl LocalFsStore {
    /// store assigning generations from the wall clock in nanoseconds
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            first_generation: None,
        }
    }

    /// store assigning `first` to the first write of each blob, then counting up
    pub fn with_first_generation(root: impl Into<PathBuf>, first: Generation) -> Self {
        Self {
            root: root.into(),
            first_generation: Some(first.value()),
        }
    }

    /// root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// directory holding all generations of a blob
    pub fn blob_dir(&self, id: &BlobId) -> PathBuf {
        self.root.join(&id.bucket).join(&id.path)
    }

    /// file holding one generation of a blob
    pub fn generation_path(&self, id: &BlobId, generation: Generation) -> PathBuf {
        self.blob_dir(id).join(generation.to_string())
    }

    /// store content under an exact generation
    ///
    /// fails with `StaleState` if that generation already exists.
    pub fn create_with_generation(
        &self,
        id: &BlobId,
        content: &[u8],
        generation: Generation,
    ) -> Result<()> {
        let tmp = self.stage(id, content)?;
        let result = self.publish_exact(&tmp, id, generation);
        let _ = fs::remove_file(&tmp);
        result
    }

    /// all generations present for a blob, ascending
    pub fn generations(&self, id: &BlobId) -> Result<Vec<Generation>> {
        let dir = self.blob_dir(id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(Error::Io { path: dir, source: e }),
        };

        let mut gens = Vec::new();
        for entry in entries {
            let entry = entry.with_path(&dir)?;
            if let Some(gen) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<Generation>().ok())
            {
                gens.push(gen);
            }
        }
        gens.sort();
        Ok(gens)
    }

    fn latest(&self, id: &BlobId) -> Result<Option<Generation>> {
        Ok(self.generations(id)?.pop())
    }

    /// write content to a temp file inside the blob directory
    fn stage(&self, id: &BlobId, content: &[u8]) -> Result<PathBuf> {
        let tmp = self.temp_path(id)?;
        let mut file = File::create(&tmp).with_path(&tmp)?;
        file.write_all(content).with_path(&tmp)?;
        file.sync_all().with_path(&tmp)?;
        Ok(tmp)
    }

    fn temp_path(&self, id: &BlobId) -> Result<PathBuf> {
        let dir = self.blob_dir(id);
        fs::create_dir_all(&dir).with_path(&dir)?;
        Ok(dir.join(format!(".{}.tmp", uuid::Uuid::new_v4())))
    }

    fn publish_exact(&self, tmp: &Path, id: &BlobId, generation: Generation) -> Result<()> {
        let target = self.generation_path(id, generation);
        match fs::hard_link(tmp, &target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::StaleState(target)),
            Err(e) => Err(Error::Io {
                path: target,
                source: e,
            }),
        }
    }

    /// publish a staged file under the next free generation
    fn publish(&self, tmp: &Path, id: &BlobId) -> Result<Generation> {
        let start = self.first_generation.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        });
        let floor = match self.latest(id)? {
            Some(latest) => next_generation(id, latest.value())?,
            None => 0,
        };
        let mut candidate = start.max(floor);

        loop {
            match self.publish_exact(tmp, id, Generation::new(candidate)) {
                Ok(()) => break,
                // another writer took this generation, try the next one
                Err(Error::StaleState(_)) => candidate = next_generation(id, candidate)?,
                Err(e) => return Err(e),
            }
        }

        fs::remove_file(tmp).with_path(tmp)?;
        let generation = Generation::new(candidate);
        debug!(blob = %id, %generation, "published generation");
        Ok(generation)
    }
}

/// generation following `value`, refusing to wrap around
fn next_generation(id: &BlobId, value: u64) -> Result<u64> {
    value
        .checked_add(1)
        .ok_or_else(|| Error::InvalidGeneration(format!("{id}: no generation after {value}")))
}

impl VersionStore for LocalFsStore {
    fn get(&self, id: &BlobId) -> Result<Blob> {
        let generation = self
            .latest(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let path = self.generation_path(id, generation);
        let size = fs::metadata(&path).with_path(&path)?.len();
        Ok(Blob {
            id: id.clone(),
            generation,
            size: Some(size),
        })
    }

    fn create(&self, id: &BlobId, content: &[u8]) -> Result<Generation> {
        let tmp = self.stage(id, content)?;
        let result = self.publish(&tmp, id);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn writer(&self, id: &BlobId) -> Result<Box<dyn BlobWriter>> {
        let tmp = self.temp_path(id)?;
        let file = File::create(&tmp).with_path(&tmp)?;
        Ok(Box::new(LocalBlobWriter {
            store: self.clone(),
            id: id.clone(),
            tmp,
            file: Some(BufWriter::new(file)),
        }))
    }

    fn open(&self, id: &BlobId, generation: Generation) -> Result<Box<dyn Read>> {
        let path = self.generation_path(id, generation);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{id}@{generation}")))
            }
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let bucket_dir = self.root.join(bucket);
        if !bucket_dir.exists() {
            return Ok(vec![]);
        }

        let mut names = BTreeSet::new();
        for entry in WalkDir::new(&bucket_dir).min_depth(2) {
            let entry = entry.map_err(|e| Error::Io {
                path: bucket_dir.clone(),
                source: e.into_io_error().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "walkdir error")
                }),
            })?;

            if !entry.file_type().is_file() {
                continue;
            }
            let is_generation = entry
                .file_name()
                .to_str()
                .map(|n| n.parse::<Generation>().is_ok())
                .unwrap_or(false);
            if !is_generation {
                continue;
            }

            // the blob path is the generation file's parent, relative to the bucket
            let Some(parent) = entry.path().parent() else {
                continue;
            };
            let Ok(rel) = parent.strip_prefix(&bucket_dir) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) {
                names.insert(name);
            }
        }

        Ok(names.into_iter().collect())
    }
}

/// chunked writer staging into a temp file until finished
struct LocalBlobWriter {
    store: LocalFsStore,
    id: BlobId,
    tmp: PathBuf,
    file: Option<BufWriter<File>>,
}

impl LocalBlobWriter {
    fn file(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already finished"))
    }
}

impl Write for LocalBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl BlobWriter for LocalBlobWriter {
    fn finish(mut self: Box<Self>) -> Result<Generation> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::StaleState(self.tmp.clone()))?;
        let file = file
            .into_inner()
            .map_err(|e| Error::Io {
                path: self.tmp.clone(),
                source: e.into_error(),
            })?;
        file.sync_all().with_path(&self.tmp)?;
        drop(file);

        self.store.publish(&self.tmp, &self.id)
    }
}

impl Drop for LocalBlobWriter {
    fn drop(&mut self) {
        // unfinished or failed uploads leave nothing behind
        if self.tmp.exists() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}
