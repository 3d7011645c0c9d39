//! tar packaging of directory trees
//!
//! archives are rooted at the source directory: a file `<source>/a/b` is
//! stored as `a/b` and extracted to `<dest>/a/b`.

use std::cell::Cell;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::compression::CompressionMode;
use crate::error::{Error, IoResultExt, Result};

/// selection of paths to package from a source directory
///
/// both lists empty means the whole tree. paths may be relative to the
/// source directory or absolute paths inside it.
#[derive(Clone, Debug, Default)]
pub struct IncludeFilter {
    files: Vec<PathBuf>,
    parent_dirs: Vec<PathBuf>,
}

impl IncludeFilter {
    /// build a filter anchored at `source_dir`
    pub fn new<F, D>(source_dir: &Path, files: F, parent_dirs: D) -> Self
    where
        F: IntoIterator,
        F::Item: AsRef<Path>,
        D: IntoIterator,
        D::Item: AsRef<Path>,
    {
        Self {
            files: files
                .into_iter()
                .filter_map(|p| anchor(source_dir, p.as_ref()))
                .collect(),
            parent_dirs: parent_dirs
                .into_iter()
                .filter_map(|p| anchor(source_dir, p.as_ref()))
                .collect(),
        }
    }

    /// true if the filter selects everything
    pub fn is_all(&self) -> bool {
        self.files.is_empty() && self.parent_dirs.is_empty()
    }

    fn in_parent_dir(&self, rel: &Path) -> bool {
        self.parent_dirs.iter().any(|dir| rel.starts_with(dir))
    }

    /// whether a file (or symlink) at `rel` is packaged
    pub fn includes_file(&self, rel: &Path) -> bool {
        self.is_all() || self.files.iter().any(|f| f == rel) || self.in_parent_dir(rel)
    }

    /// whether a directory entry at `rel` is packaged
    ///
    /// directories outside included parents are not stored; extraction
    /// recreates them as needed for included files.
    pub fn includes_dir(&self, rel: &Path) -> bool {
        self.is_all() || self.in_parent_dir(rel)
    }
}

/// make a filter path relative to the source dir, dropping paths outside it
fn anchor(source_dir: &Path, path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        match path.strip_prefix(source_dir) {
            Ok(rel) => Some(rel.to_path_buf()),
            Err(_) => {
                warn!(
                    path = %path.display(),
                    source = %source_dir.display(),
                    "ignoring include path outside source directory"
                );
                None
            }
        }
    } else {
        Some(path.to_path_buf())
    }
}

/// counts from a packaging run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
}

/// write a compressed tar of `source_dir` into `sink`, returning the sink
pub fn build_archive<W: Write>(
    source_dir: &Path,
    filter: &IncludeFilter,
    mode: CompressionMode,
    sink: W,
) -> Result<(W, PackStats)> {
    if !source_dir.is_dir() {
        return Err(Error::SourceNotFound(source_dir.to_path_buf()));
    }

    let mut builder = tar::Builder::new(mode.encoder(sink));
    builder.follow_symlinks(false);
    let mut stats = PackStats::default();

    for entry in WalkDir::new(source_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io {
            path: source_dir.to_path_buf(),
            source: e.into_io_error().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "walkdir error")
            }),
        })?;

        let path = entry.path();
        let rel = match path.strip_prefix(source_dir) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if filter.includes_dir(rel) {
                builder.append_dir(rel, path).with_path(path)?;
                stats.dirs += 1;
            }
        } else if file_type.is_file() || file_type.is_symlink() {
            if filter.includes_file(rel) {
                builder.append_path_with_name(path, rel).with_path(path)?;
                if file_type.is_symlink() {
                    stats.symlinks += 1;
                } else {
                    stats.files += 1;
                }
            }
        } else {
            warn!(path = %path.display(), "skipping special file");
        }
    }

    let encoder = builder.into_inner().with_path(source_dir)?;
    let sink = encoder.finish().with_path(source_dir)?;

    debug!(
        source = %source_dir.display(),
        files = stats.files,
        dirs = stats.dirs,
        "built archive"
    );
    Ok((sink, stats))
}

/// reader that remembers whether it ever returned an error
struct FaultTracking<R> {
    inner: R,
    faulted: Rc<Cell<bool>>,
}

impl<R: Read> Read for FaultTracking<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let res = self.inner.read(buf);
        if res.is_err() {
            self.faulted.set(true);
        }
        res
    }
}

/// extract a compressed tar stream into `dest`, returning the entry count
///
/// errors are classified by where they surfaced: the raw stream (transient),
/// the decompressor or tar framing (corrupt archive), or the local
/// filesystem while writing entries (io).
pub fn extract_archive<R: Read>(source: R, mode: CompressionMode, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_path(dest)?;

    let source_fault = Rc::new(Cell::new(false));
    let decode_fault = Rc::new(Cell::new(false));

    let raw = FaultTracking {
        inner: source,
        faulted: Rc::clone(&source_fault),
    };
    let decoded = FaultTracking {
        inner: mode.decoder(raw),
        faulted: Rc::clone(&decode_fault),
    };

    let mut archive = tar::Archive::new(decoded);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    let classify = |e: io::Error, path: &Path| -> Error {
        if source_fault.get() {
            Error::transport(format!("reading archive stream: {e}"))
        } else if decode_fault.get() || e.kind() == io::ErrorKind::UnexpectedEof {
            Error::corrupt(format!("{mode} stream: {e}"))
        } else {
            Error::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    };

    let entries = archive
        .entries()
        .map_err(|e| Error::corrupt(format!("tar stream: {e}")))?;

    // directory entries are applied last so their permissions and mtimes
    // neither block nor get clobbered by the files written inside them
    let mut directories = Vec::new();
    let mut count = 0;
    for entry in entries {
        let mut entry = entry.map_err(|e| {
            if source_fault.get() || decode_fault.get() {
                classify(e, dest)
            } else {
                Error::corrupt(format!("tar header: {e}"))
            }
        })?;

        let entry_path = entry
            .path()
            .map(|p| p.into_owned())
            .map_err(|e| Error::corrupt(format!("tar entry path: {e}")))?;

        if entry.header().entry_type() == tar::EntryType::Directory {
            directories.push((entry_path, entry));
            continue;
        }

        if unpack_entry(&mut entry, &entry_path, dest, &classify)? {
            count += 1;
        }
    }

    // children before parents, so a read-only parent is sealed last
    directories.sort_by(|a, b| b.0.cmp(&a.0));
    for (entry_path, mut entry) in directories {
        if unpack_entry(&mut entry, &entry_path, dest, &classify)? {
            count += 1;
        }
    }

    Ok(count)
}

/// unpack one entry below `dest`, returning false if it was skipped
fn unpack_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    entry_path: &Path,
    dest: &Path,
    classify: &dyn Fn(io::Error, &Path) -> Error,
) -> Result<bool> {
    let unpacked = entry
        .unpack_in(dest)
        .map_err(|e| classify(e, &dest.join(entry_path)))?;
    if !unpacked {
        warn!(entry = %entry_path.display(), "skipped archive entry escaping destination");
    }
    Ok(unpacked)
}
