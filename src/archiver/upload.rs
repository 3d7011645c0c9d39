use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use super::{Archiver, ResourceKey};
use crate::error::{Error, IoResultExt, Result};
use crate::pack::{build_archive, IncludeFilter};
use crate::store::{BlobId, Generation, VersionStore};

/// archives below this size go up in a single request
pub const SMALL_UPLOAD_LIMIT: u64 = 1_000_000;

/// read buffer for chunked uploads
pub const UPLOAD_CHUNK: usize = 10_240;

/// how an archive file was handed to the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Single,
    Chunked,
}

pub(super) fn upload(
    archiver: &Archiver,
    key: &ResourceKey,
    source_dir: &Path,
    filter: &IncludeFilter,
) -> Result<String> {
    let blob_id = archiver.blob_id(key);
    let mode = archiver.options.compression;

    // the guard deletes the archive on every exit path
    let mut archive = tempfile::Builder::new()
        .prefix(&format!("{}-{}-", key.service(), key.resource()))
        .suffix(&format!(".{}", mode.suffix()))
        .tempfile()
        .with_path(std::env::temp_dir())?;

    let (_, stats) = build_archive(source_dir, filter, mode, archive.as_file_mut())?;
    let file = archive.as_file();
    file.sync_all().with_path(archive.path())?;
    let size = file.metadata().with_path(archive.path())?.len();
    info!(
        resource = %key,
        blob = %blob_id,
        bytes = size,
        files = stats.files,
        "uploading archive"
    );

    let (written, kind) = transfer_file(archiver.store.as_ref(), &blob_id, archive.path(), size)?;
    debug!(blob = %blob_id, generation = %written, ?kind, "transfer complete");

    let tmp_path = archive.path().to_path_buf();
    if let Err(e) = archive.close() {
        warn!(path = %tmp_path.display(), error = %e, "failed to delete temporary archive");
    }

    let latest = archiver.store.get(&blob_id)?.generation;
    if latest != written {
        warn!(
            blob = %blob_id,
            written = %written,
            latest = %latest,
            "blob was replaced by a concurrent upload"
        );
    }
    Ok(latest.to_string())
}

/// send a local file to the store, picking single or chunked transfer by size
pub fn transfer_file(
    store: &dyn VersionStore,
    blob_id: &BlobId,
    path: &Path,
    size: u64,
) -> Result<(Generation, TransferKind)> {
    if size < SMALL_UPLOAD_LIMIT {
        let bytes = fs::read(path).with_path(path)?;
        let generation = store.create(blob_id, &bytes)?;
        return Ok((generation, TransferKind::Single));
    }

    let mut writer = store.writer(blob_id)?;
    let mut input = File::open(path).with_path(path)?;
    let mut buffer = [0u8; UPLOAD_CHUNK];
    loop {
        let n = input.read(&mut buffer).with_path(path)?;
        if n == 0 {
            break;
        }
        // dropping the writer on error abandons the upload
        writer
            .write_all(&buffer[..n])
            .map_err(|e| Error::transport(format!("writing {blob_id}: {e}")))?;
    }
    let generation = writer.finish()?;
    Ok((generation, TransferKind::Chunked))
}
