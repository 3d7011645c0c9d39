//! archivist - versioned artifact archiver
//!
//! packages directories into compressed tarballs, stores them as immutable
//! generations of a blob, and materializes any generation locally with an
//! atomically switched `current` pointer.
//!
//! # Core concepts
//!
//! - **Resource**: a (service, resource) pair naming one artifact family
//! - **Generation**: backend-assigned, never reused revision of a blob
//! - **Version directory**: `<archive_dir>/<service>/<resource>/<generation>/`,
//!   only ever visible fully extracted
//! - **Current pointer**: relative symlink `current -> <generation>`
//!
//! # Blob layout
//!
//! `[<prefix>/]<service>/<resource>.tgz` for gzip archives, or
//! `.tar.lz4` for lz4 archives.
//!
//! # Example usage
//!
//! ```no_run
//! use archivist::{Archiver, ArchiverOptions, LocalFsStore, ResourceKey};
//! use std::path::Path;
//!
//! let store = LocalFsStore::new("/srv/blobs");
//! let archiver = Archiver::new(store, ArchiverOptions::new("/var/archive", "artifacts"));
//! let key = ResourceKey::new("search", "index").unwrap();
//!
//! // upload everything under a directory
//! let none: [&str; 0] = [];
//! let generation = archiver.upload(&key, Path::new("/build/index"), none, none).unwrap();
//!
//! // materialize the latest generation and read through the pointer
//! let current = archiver.download(&key).unwrap();
//! println!("{} -> {}", generation, current.display());
//! ```

mod config;
mod error;

pub mod archiver;
pub mod compression;
pub mod pack;
pub mod store;

pub use archiver::{Archiver, ArchiverOptions, CleanupStats, ResourceKey, ResourceLock};
pub use compression::CompressionMode;
pub use config::{BackendConfig, Config};
pub use error::{Error, IoResultExt, Result};
pub use pack::{build_archive, extract_archive, IncludeFilter, PackStats};
pub use store::{Blob, BlobId, BlobWriter, GcsStore, Generation, LocalFsStore, VersionStore};
