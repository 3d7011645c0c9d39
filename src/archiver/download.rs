use std::fs::{self, File};
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::cleanup::{cleanup_with, remove_version, CleanupStats};
use super::layout::{temp_name, CURRENT, TMP_SUFFIX};
use super::{Archiver, ResourceKey};
use crate::error::{Error, IoResultExt, Result};
use crate::pack::extract_archive;
use crate::store::Generation;

pub(super) fn download(
    archiver: &Archiver,
    key: &ResourceKey,
    requested: Option<Generation>,
) -> Result<PathBuf> {
    let (path, _) = download_with(archiver, key, requested, remove_version)?;
    Ok(path)
}

/// download with a custom removal step for superseded versions
fn download_with<F>(
    archiver: &Archiver,
    key: &ResourceKey,
    requested: Option<Generation>,
    remove: F,
) -> Result<(PathBuf, CleanupStats)>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let root = archiver.layout.root();
    fs::create_dir_all(root).with_path(root)?;

    let blob_id = archiver.blob_id(key);
    let generation = match requested {
        Some(generation) => generation,
        None => archiver.store.get(&blob_id)?.generation,
    };
    let version = generation.to_string();
    info!(resource = %key, blob = %blob_id, %generation, "downloading");

    let resource_dir = archiver.layout.resource_dir(key);
    fs::create_dir_all(&resource_dir).with_path(&resource_dir)?;
    let version_dir = archiver.layout.version_dir(key, &version);

    match fs::symlink_metadata(&version_dir) {
        Ok(meta) if meta.is_dir() => {
            info!(dir = %version_dir.display(), "version already present, skipping extraction");
        }
        Ok(_) => return Err(Error::StaleState(version_dir)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            materialize(archiver, key, generation, &resource_dir, &version_dir)?;
        }
        Err(e) => {
            return Err(Error::Io {
                path: version_dir,
                source: e,
            })
        }
    }

    point_current(&resource_dir, &version)?;

    let stats = cleanup_with(&resource_dir, &version, remove);
    debug!(
        removed = stats.removed.len(),
        kept = stats.kept.len(),
        failed = stats.failed.len(),
        "cleanup finished"
    );

    let resource_dir = fs::canonicalize(&resource_dir).with_path(&resource_dir)?;
    Ok((resource_dir.join(CURRENT), stats))
}

/// extract one generation into a temp dir and rename it into place
///
/// the temp dir and temp file are guards: every early return removes them,
/// and after a successful rename the staging guard has nothing left to delete.
fn materialize(
    archiver: &Archiver,
    key: &ResourceKey,
    generation: Generation,
    resource_dir: &Path,
    version_dir: &Path,
) -> Result<()> {
    let blob_id = archiver.blob_id(key);
    let mode = archiver.options.compression;

    let staging = tempfile::Builder::new()
        .prefix(".")
        .suffix(TMP_SUFFIX)
        .tempdir_in(resource_dir)
        .with_path(resource_dir)?;

    let entries = if archiver.options.download_as_stream {
        debug!(blob = %blob_id, "extracting from backend stream");
        let stream = archiver.store.open(&blob_id, generation)?;
        extract_archive(stream, mode, staging.path())?
    } else {
        let archive = tempfile::Builder::new()
            .prefix(".")
            .suffix(TMP_SUFFIX)
            .tempfile_in(resource_dir)
            .with_path(resource_dir)?;
        let bytes = archiver
            .store
            .download_to(&blob_id, generation, archive.path())?;
        debug!(blob = %blob_id, bytes, path = %archive.path().display(), "downloaded archive");

        let file = File::open(archive.path()).with_path(archive.path())?;
        extract_archive(file, mode, staging.path())?
    };
    info!(resource = %key, %generation, entries, "extracted archive");

    if let Err(e) = fs::rename(staging.path(), version_dir) {
        // a concurrent download of the same generation may have won
        if version_dir.is_dir() {
            warn!(dir = %version_dir.display(), "version appeared during extraction, keeping it");
            return Ok(());
        }
        return Err(Error::Io {
            path: version_dir.to_path_buf(),
            source: e,
        });
    }
    sync_dir(resource_dir)
}

/// atomically repoint `current` at `version`
fn point_current(resource_dir: &Path, version: &str) -> Result<()> {
    let current = resource_dir.join(CURRENT);
    if let Ok(meta) = fs::symlink_metadata(&current) {
        if !meta.file_type().is_symlink() {
            return Err(Error::StaleState(current));
        }
    }

    let tmp_link = resource_dir.join(temp_name());
    symlink(version, &tmp_link).with_path(&tmp_link)?;
    if let Err(e) = fs::rename(&tmp_link, &current) {
        let _ = fs::remove_file(&tmp_link);
        return Err(Error::Io {
            path: current,
            source: e,
        });
    }
    info!(link = %current.display(), target = version, "switched current version");

    sync_dir(resource_dir)
}

fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).with_path(dir)?;
    handle.sync_all().with_path(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::download_with;
    use super::super::{Archiver, ArchiverOptions, ResourceKey};
    use crate::compression::CompressionMode;
    use crate::error::Error;
    use crate::store::{BlobId, Generation, LocalFsStore};
    use std::fs;
    use std::io;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use std::path::{Path, PathBuf};
    use tempfile::{tempdir, TempDir};

    const NONE: [&str; 0] = [];

    struct Fixture {
        dir: TempDir,
        source: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let source = dir.path().join("source");
            fs::create_dir_all(&source).unwrap();
            Self { dir, source }
        }

        fn root(&self) -> PathBuf {
            self.dir.path().join("archive")
        }

        fn store(&self) -> LocalFsStore {
            LocalFsStore::new(self.dir.path().join("store"))
        }

        fn archiver(&self, mode: CompressionMode, stream: bool) -> Archiver {
            let mut options = ArchiverOptions::new(self.root(), "bucket");
            options.compression = mode;
            options.download_as_stream = stream;
            Archiver::new(self.store(), options)
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new("svc", "res").unwrap()
    }

    fn entry_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_upload_then_download_example() {
        let fx = Fixture::new();
        fs::write(fx.source.join("foo"), "bar").unwrap();

        let store = LocalFsStore::with_first_generation(
            fx.dir.path().join("store"),
            Generation::new(424242),
        );
        let archiver = Archiver::new(store, ArchiverOptions::new(fx.root(), "bucket"));
        let k = key();

        let generation = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        assert_eq!(generation, "424242");

        let path = archiver.download(&k).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("svc/res/current"));
        assert_eq!(fs::read_to_string(path.join("foo")).unwrap(), "bar");
        assert_eq!(fs::read_link(&path).unwrap(), PathBuf::from("424242"));
        assert_eq!(archiver.current_version(&k).unwrap().as_deref(), Some("424242"));
    }

    #[test]
    fn test_round_trip_all_modes() {
        for mode in [CompressionMode::Gzip, CompressionMode::Lz4] {
            for stream in [true, false] {
                let fx = Fixture::new();
                fs::create_dir_all(fx.source.join("nested/deeper")).unwrap();
                fs::write(fx.source.join("top.txt"), "top").unwrap();
                fs::write(fx.source.join("nested/deeper/leaf.bin"), vec![7u8; 4096]).unwrap();
                symlink("top.txt", fx.source.join("alias")).unwrap();

                let archiver = fx.archiver(mode, stream);
                let k = key();
                archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
                let path = archiver.download(&k).unwrap();

                assert_eq!(fs::read_to_string(path.join("top.txt")).unwrap(), "top");
                assert_eq!(
                    fs::read(path.join("nested/deeper/leaf.bin")).unwrap(),
                    vec![7u8; 4096]
                );
                assert_eq!(
                    fs::read_link(path.join("alias")).unwrap(),
                    PathBuf::from("top.txt")
                );
                assert!(archiver
                    .store()
                    .get(&archiver.blob_id(&k))
                    .unwrap()
                    .id
                    .path
                    .ends_with(mode.suffix()));
            }
        }
    }

    #[test]
    fn test_download_is_idempotent() {
        let fx = Fixture::new();
        fs::write(fx.source.join("foo"), "bar").unwrap();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();
        let generation = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();

        let first = archiver.download(&k).unwrap();
        let version_dir = archiver.layout().version_dir(&k, &generation);
        let inode = fs::metadata(&version_dir).unwrap().ino();
        let file_inode = fs::metadata(version_dir.join("foo")).unwrap().ino();

        let second = archiver.download(&k).unwrap();
        assert_eq!(first, second);
        // the directory was not re-extracted
        assert_eq!(fs::metadata(&version_dir).unwrap().ino(), inode);
        assert_eq!(fs::metadata(version_dir.join("foo")).unwrap().ino(), file_inode);
        assert_eq!(
            entry_names(&archiver.layout().resource_dir(&k)),
            vec![generation, "current".to_string()]
        );
    }

    #[test]
    fn test_cleanup_keeps_only_latest_and_foreign_entries() {
        let fx = Fixture::new();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();

        let mut generations = Vec::new();
        for i in 0..3 {
            fs::write(fx.source.join("foo"), format!("v{i}")).unwrap();
            generations.push(archiver.upload(&k, &fx.source, NONE, NONE).unwrap());
            archiver.download(&k).unwrap();
            if i == 0 {
                fs::create_dir(archiver.layout().resource_dir(&k).join("notes")).unwrap();
            }
        }

        let latest = generations.last().unwrap().clone();
        let mut expected = vec![latest.clone(), "current".to_string(), "notes".to_string()];
        expected.sort();
        assert_eq!(entry_names(&archiver.layout().resource_dir(&k)), expected);
        assert_eq!(archiver.local_versions(&k).unwrap(), vec![latest]);

        let current = archiver.layout().current_link(&k);
        assert_eq!(fs::read_to_string(current.join("foo")).unwrap(), "v2");
    }

    #[test]
    fn test_download_explicit_generation() {
        let fx = Fixture::new();
        let archiver = fx.archiver(CompressionMode::Lz4, true);
        let k = key();

        fs::write(fx.source.join("foo"), "old").unwrap();
        let old = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        fs::write(fx.source.join("foo"), "new").unwrap();
        let new = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        assert_ne!(old, new);

        let path = archiver
            .download_version(&k, old.parse().unwrap())
            .unwrap();
        assert_eq!(fs::read_to_string(path.join("foo")).unwrap(), "old");

        let path = archiver.download(&k).unwrap();
        assert_eq!(fs::read_to_string(path.join("foo")).unwrap(), "new");
        assert_eq!(archiver.local_versions(&k).unwrap(), vec![new]);
    }

    #[test]
    fn test_download_missing_blob() {
        let fx = Fixture::new();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();

        assert!(matches!(archiver.download(&k), Err(Error::NotFound(_))));

        fs::write(fx.source.join("foo"), "bar").unwrap();
        archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        assert!(matches!(
            archiver.download_version(&k, Generation::new(1)),
            Err(Error::NotFound(_))
        ));
        assert!(archiver.current_version(&k).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_blob_leaves_no_partial_state() {
        for stream in [true, false] {
            let fx = Fixture::new();
            let archiver = fx.archiver(CompressionMode::Gzip, stream);
            let k = key();

            let id: BlobId = archiver.blob_id(&k);
            archiver
                .store()
                .create(&id, b"definitely not a gzip stream")
                .unwrap();

            let err = archiver.download(&k).unwrap_err();
            assert!(matches!(err, Error::CorruptArchive { .. }), "{err:?}");

            // no temp dir, no temp file, no version dir, no pointer
            let res = archiver.layout().resource_dir(&k);
            assert!(entry_names(&res).is_empty());
        }
    }

    #[test]
    fn test_non_symlink_current_is_stale_state() {
        let fx = Fixture::new();
        fs::write(fx.source.join("foo"), "bar").unwrap();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();
        archiver.upload(&k, &fx.source, NONE, NONE).unwrap();

        fs::create_dir_all(archiver.layout().current_link(&k)).unwrap();
        assert!(matches!(archiver.download(&k), Err(Error::StaleState(_))));
    }

    #[test]
    fn test_version_path_occupied_by_file_is_stale_state() {
        let fx = Fixture::new();
        fs::write(fx.source.join("foo"), "bar").unwrap();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();
        let generation = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();

        let res = archiver.layout().resource_dir(&k);
        fs::create_dir_all(&res).unwrap();
        fs::write(res.join(&generation), "squatter").unwrap();
        assert!(matches!(archiver.download(&k), Err(Error::StaleState(_))));
    }

    #[test]
    fn test_upload_with_include_filters() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.source.join("keep/sub")).unwrap();
        fs::create_dir_all(fx.source.join("skip")).unwrap();
        fs::write(fx.source.join("keep/sub/a"), "a").unwrap();
        fs::write(fx.source.join("skip/b"), "b").unwrap();
        fs::write(fx.source.join("single"), "s").unwrap();
        fs::write(fx.source.join("other"), "o").unwrap();

        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();
        archiver
            .upload(&k, &fx.source, ["single"], [fx.source.join("keep")])
            .unwrap();
        let path = archiver.download(&k).unwrap();

        assert_eq!(fs::read_to_string(path.join("keep/sub/a")).unwrap(), "a");
        assert_eq!(fs::read_to_string(path.join("single")).unwrap(), "s");
        assert!(!path.join("skip").exists());
        assert!(!path.join("other").exists());
    }

    #[test]
    fn test_large_archive_round_trip() {
        let fx = Fixture::new();
        // incompressible content forces the chunked path
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let data: Vec<u8> = (0..1_500_000)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect();
        fs::write(fx.source.join("big"), &data).unwrap();

        let archiver = fx.archiver(CompressionMode::Lz4, false);
        let k = key();
        archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        let size = archiver
            .store()
            .get(&archiver.blob_id(&k))
            .unwrap()
            .size
            .unwrap();
        assert!(size >= super::super::SMALL_UPLOAD_LIMIT);

        let path = archiver.download(&k).unwrap();
        assert_eq!(fs::read(path.join("big")).unwrap(), data);
    }

    #[test]
    fn test_cleanup_failure_does_not_fail_download() {
        let fx = Fixture::new();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();

        fs::write(fx.source.join("foo"), "v1").unwrap();
        let old = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        archiver.download(&k).unwrap();

        fs::write(fx.source.join("foo"), "v2").unwrap();
        let new = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        let (path, stats) = download_with(&archiver, &k, None, |_| {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        })
        .unwrap();

        assert_eq!(stats.failed, vec![old.clone()]);
        assert!(stats.removed.is_empty());
        assert_eq!(fs::read_to_string(path.join("foo")).unwrap(), "v2");
        assert_eq!(archiver.current_version(&k).unwrap(), Some(new.clone()));
        assert_eq!(archiver.local_versions(&k).unwrap(), vec![old, new]);
    }

    #[test]
    fn test_failed_redownload_keeps_previous_current() {
        for stream in [true, false] {
            let fx = Fixture::new();
            let archiver = fx.archiver(CompressionMode::Lz4, stream);
            let k = key();

            fs::write(fx.source.join("foo"), "bar").unwrap();
            let good = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
            archiver.download(&k).unwrap();

            archiver
                .store()
                .create(&archiver.blob_id(&k), b"not an lz4 frame")
                .unwrap();
            let err = archiver.download(&k).unwrap_err();
            assert!(matches!(err, Error::CorruptArchive { .. }), "{err:?}");

            // previous version still current and complete, no temp entries
            assert_eq!(archiver.current_version(&k).unwrap(), Some(good.clone()));
            let current = archiver.layout().current_link(&k);
            assert_eq!(fs::read_to_string(current.join("foo")).unwrap(), "bar");
            assert_eq!(
                entry_names(&archiver.layout().resource_dir(&k)),
                vec![good, "current".to_string()]
            );
        }
    }

    #[test]
    fn test_read_only_directory_round_trip() {
        let fx = Fixture::new();
        let archiver = fx.archiver(CompressionMode::Gzip, true);
        let k = key();

        fs::create_dir_all(fx.source.join("ro")).unwrap();
        fs::write(fx.source.join("ro/file"), "sealed").unwrap();
        fs::write(fx.source.join("top"), "v1").unwrap();
        fs::set_permissions(fx.source.join("ro"), fs::Permissions::from_mode(0o555)).unwrap();

        archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        let path = archiver.download(&k).unwrap();
        assert_eq!(fs::read_to_string(path.join("ro/file")).unwrap(), "sealed");
        let mode = fs::metadata(path.join("ro")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);

        // a superseded version holding a read-only directory is still pruned
        fs::write(fx.source.join("top"), "v2").unwrap();
        let new = archiver.upload(&k, &fx.source, NONE, NONE).unwrap();
        let path = archiver.download(&k).unwrap();
        assert_eq!(fs::read_to_string(path.join("top")).unwrap(), "v2");
        assert_eq!(archiver.local_versions(&k).unwrap(), vec![new]);

        for dir in [fx.source.join("ro"), path.join("ro")] {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }
}
