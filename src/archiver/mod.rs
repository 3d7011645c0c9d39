//! versioned upload and download of resource directories
//!
//! an upload packages a directory and stores it as a new generation of one
//! blob. a download materializes a generation under
//! `<archive_dir>/<service>/<resource>/<generation>/`, repoints the
//! `current` symlink at it and prunes older generations.

mod cleanup;
mod download;
mod layout;
mod lock;
mod upload;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::compression::CompressionMode;
use crate::error::{Error, IoResultExt, Result};
use crate::pack::IncludeFilter;
use crate::store::{BlobId, Generation, VersionStore};

pub use cleanup::{
    cleanup, cleanup_candidate, cleanup_with, is_generation_token, remove_version, CleanupStats,
    Verdict,
};
pub use layout::{blob_path, Layout, ResourceKey, CURRENT};
pub use lock::ResourceLock;
pub use upload::{transfer_file, TransferKind, SMALL_UPLOAD_LIMIT, UPLOAD_CHUNK};

/// construction-time settings of an archiver
#[derive(Clone, Debug)]
pub struct ArchiverOptions {
    /// local root for materialized versions
    pub archive_dir: PathBuf,
    /// bucket holding the archives
    pub bucket: String,
    /// optional leading path for every blob
    pub path_prefix: Option<String>,
    /// archive format, fixed for the lifetime of the archiver
    pub compression: CompressionMode,
    /// extract straight from the backend stream instead of a temp file
    pub download_as_stream: bool,
}

impl ArchiverOptions {
    pub fn new(archive_dir: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            bucket: bucket.into(),
            path_prefix: None,
            compression: CompressionMode::default(),
            download_as_stream: true,
        }
    }
}

/// orchestrates uploads to and downloads from a version store
pub struct Archiver {
    store: Box<dyn VersionStore>,
    options: ArchiverOptions,
    layout: Layout,
}

impl Archiver {
    pub fn new(store: impl VersionStore + 'static, options: ArchiverOptions) -> Self {
        Self::with_store(Box::new(store), options)
    }

    pub fn with_store(store: Box<dyn VersionStore>, options: ArchiverOptions) -> Self {
        let layout = Layout::new(options.archive_dir.clone());
        Self {
            store,
            options,
            layout,
        }
    }

    pub fn options(&self) -> &ArchiverOptions {
        &self.options
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &dyn VersionStore {
        self.store.as_ref()
    }

    /// blob address of a resource under the active compression mode
    pub fn blob_id(&self, key: &ResourceKey) -> BlobId {
        BlobId::new(
            self.options.bucket.clone(),
            blob_path(
                self.options.path_prefix.as_deref(),
                key,
                self.options.compression,
            ),
        )
    }

    /// package `source_dir` and store it as a new generation
    ///
    /// with both include lists empty the whole tree is packaged. returns the
    /// generation now visible at the blob path, as a string.
    pub fn upload<F, D>(
        &self,
        key: &ResourceKey,
        source_dir: &Path,
        include_files: F,
        include_parent_dirs: D,
    ) -> Result<String>
    where
        F: IntoIterator,
        F::Item: AsRef<Path>,
        D: IntoIterator,
        D::Item: AsRef<Path>,
    {
        let filter = IncludeFilter::new(source_dir, include_files, include_parent_dirs);
        upload::upload(self, key, source_dir, &filter)
    }

    /// materialize the latest generation and make it current
    pub fn download(&self, key: &ResourceKey) -> Result<PathBuf> {
        download::download(self, key, None)
    }

    /// materialize an exact generation and make it current
    pub fn download_version(&self, key: &ResourceKey, generation: Generation) -> Result<PathBuf> {
        download::download(self, key, Some(generation))
    }

    /// names of every resource of `service` stored under the active mode
    pub fn list_resources(&self, service: &str) -> Result<Vec<String>> {
        layout::validate_name(service)?;
        let prefix = layout::service_prefix(self.options.path_prefix.as_deref(), service);
        let suffix = format!(".{}", self.options.compression.suffix());

        let mut names: Vec<String> = self
            .store
            .list(&self.options.bucket, &prefix)?
            .into_iter()
            .filter_map(|path| {
                let rest = path.strip_prefix(&prefix)?;
                let name = rest.strip_suffix(&suffix)?;
                // nested paths belong to some other layout
                if name.is_empty() || name.contains('/') {
                    None
                } else {
                    Some(name.to_string())
                }
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// resources of `service` whose name matches a glob pattern
    pub fn list_resources_matching(&self, service: &str, pattern: &str) -> Result<Vec<String>> {
        let glob =
            glob::Pattern::new(pattern).map_err(|e| Error::InvalidResource(e.to_string()))?;
        Ok(self
            .list_resources(service)?
            .into_iter()
            .filter(|name| glob.matches(name))
            .collect())
    }

    /// generation the current pointer refers to, if any
    pub fn current_version(&self, key: &ResourceKey) -> Result<Option<String>> {
        let link = self.layout.current_link(key);
        match fs::read_link(&link) {
            Ok(target) => Ok(Some(target.to_string_lossy().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(Error::StaleState(link))
            }
            Err(e) => Err(Error::Io {
                path: link,
                source: e,
            }),
        }
    }

    /// generations materialized locally, oldest first
    pub fn local_versions(&self, key: &ResourceKey) -> Result<Vec<String>> {
        let dir = self.layout.resource_dir(key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Io {
                    path: dir,
                    source: e,
                })
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.with_path(&dir)?;
            let is_dir = entry.file_type().with_path(entry.path())?.is_dir();
            let name = entry.file_name().to_string_lossy().to_string();
            if is_dir && is_generation_token(&name) {
                versions.push(name);
            }
        }
        // equal-width numbers sort lexically; shorter means smaller
        versions.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Ok(versions)
    }

    /// remove every local trace of a resource
    ///
    /// the pointer goes first so readers never follow it into a half-deleted
    /// version. returns false if there was nothing to remove.
    pub fn delete_local_files(&self, key: &ResourceKey) -> Result<bool> {
        let dir = self.layout.resource_dir(key);
        if fs::symlink_metadata(&dir).is_err() {
            return Ok(false);
        }

        let link = self.layout.current_link(key);
        if let Ok(meta) = fs::symlink_metadata(&link) {
            if meta.file_type().is_symlink() {
                fs::remove_file(&link).with_path(&link)?;
            }
        }

        cleanup::remove_version(&dir).with_path(&dir)?;
        info!(resource = %key, dir = %dir.display(), "deleted local files");
        Ok(true)
    }

    /// take the per-resource lock without blocking
    pub fn lock_resource(&self, key: &ResourceKey) -> Result<ResourceLock> {
        ResourceLock::acquire(&self.layout.lock_path(key))
    }
}
