//! pruning of superseded local versions
//!
//! the decision is a pure function of an entry's name and type; the sweep
//! applies it and never fails the caller.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::layout::CURRENT;

/// true if `name` looks like a generation directory name (hex digits only)
///
/// decimal generations are a subset of hex, so both schemes qualify.
pub fn is_generation_token(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// what cleanup does with one entry of a resource directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Remove,
    KeepPointer,
    KeepActive,
    KeepNotDirectory,
    KeepUnrecognized,
}

/// decide the fate of an entry named `name` given the active version
pub fn verdict(name: &str, active: &str, is_dir: bool) -> Verdict {
    if name == CURRENT {
        Verdict::KeepPointer
    } else if name == active {
        Verdict::KeepActive
    } else if !is_dir {
        Verdict::KeepNotDirectory
    } else if !is_generation_token(name) {
        Verdict::KeepUnrecognized
    } else {
        Verdict::Remove
    }
}

/// true if cleanup would delete the entry
pub fn cleanup_candidate(name: &str, active: &str, is_dir: bool) -> bool {
    verdict(name, active, is_dir) == Verdict::Remove
}

/// outcome of a cleanup sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
    pub failed: Vec<String>,
}

/// remove every generation directory in `resource_dir` other than `active`
///
/// best effort: failures are logged and reported in the stats, never returned.
pub fn cleanup(resource_dir: &Path, active: &str) -> CleanupStats {
    cleanup_with(resource_dir, active, remove_version)
}

/// delete a version directory, unlocking read-only subdirectories if needed
pub fn remove_version(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_dir() {
                    let mut perms = entry.metadata().map_err(io::Error::from)?.permissions();
                    perms.set_mode(perms.mode() | 0o700);
                    fs::set_permissions(entry.path(), perms)?;
                }
            }
            fs::remove_dir_all(path)
        }
        other => other,
    }
}

/// cleanup sweep with a custom removal step
pub fn cleanup_with<F>(resource_dir: &Path, active: &str, mut remove: F) -> CleanupStats
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut stats = CleanupStats::default();

    let entries = match fs::read_dir(resource_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %resource_dir.display(), error = %e, "cannot list resource directory for cleanup");
            return stats;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %resource_dir.display(), error = %e, "cannot read directory entry");
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().to_string();
        // symlinks are never treated as directories
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        match verdict(&name, active, is_dir) {
            Verdict::Remove => {
                let path = entry.path();
                info!(path = %path.display(), "removing superseded version");
                match remove(&path) {
                    Ok(()) => stats.removed.push(name),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to remove superseded version");
                        stats.failed.push(name);
                    }
                }
            }
            Verdict::KeepPointer | Verdict::KeepActive => {
                debug!(entry = %name, "keeping live entry");
                stats.kept.push(name);
            }
            Verdict::KeepNotDirectory => {
                warn!(entry = %name, "unexpected non-directory entry found while cleaning up");
                stats.kept.push(name);
            }
            Verdict::KeepUnrecognized => {
                warn!(entry = %name, "not cleaning up directory because name doesn't match pattern");
                stats.kept.push(name);
            }
        }
    }

    stats.removed.sort();
    stats.kept.sort();
    stats.failed.sort();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn test_generation_tokens() {
        assert!(is_generation_token("424242"));
        assert!(is_generation_token("1"));
        assert!(is_generation_token("cafe"));
        assert!(is_generation_token("DEADbeef01"));

        assert!(!is_generation_token(""));
        assert!(!is_generation_token("current"));
        assert!(!is_generation_token("notes"));
        assert!(!is_generation_token("12a-34"));
        assert!(!is_generation_token(".5c1e0a3e.tmp"));
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(verdict("current", "2", false), Verdict::KeepPointer);
        assert_eq!(verdict("2", "2", true), Verdict::KeepActive);
        assert_eq!(verdict("1", "2", false), Verdict::KeepNotDirectory);
        assert_eq!(verdict("notes", "2", true), Verdict::KeepUnrecognized);
        assert_eq!(verdict("1", "2", true), Verdict::Remove);
        assert_eq!(verdict("abc", "2", true), Verdict::Remove);

        assert!(cleanup_candidate("1", "2", true));
        assert!(!cleanup_candidate("current", "2", true));
    }

    #[test]
    fn test_cleanup_removes_only_superseded_generations() {
        let dir = tempdir().unwrap();
        let res = dir.path();

        for name in ["100", "200", "300", "notes", ".x.tmp"] {
            fs::create_dir(res.join(name)).unwrap();
        }
        fs::write(res.join("100/file"), "old").unwrap();
        fs::write(res.join("400"), "a file named like a generation").unwrap();
        symlink("300", res.join("current")).unwrap();

        let stats = cleanup(res, "300");

        assert_eq!(stats.removed, vec!["100", "200"]);
        assert!(stats.failed.is_empty());
        assert!(!res.join("100").exists());
        assert!(!res.join("200").exists());
        assert!(res.join("300").is_dir());
        assert!(res.join("notes").is_dir());
        assert!(res.join(".x.tmp").is_dir());
        assert!(res.join("400").is_file());
        assert!(res.join("current").symlink_metadata().is_ok());
    }

    #[test]
    fn test_cleanup_does_not_follow_symlinked_versions() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("keep"), "x").unwrap();

        let res = dir.path().join("res");
        fs::create_dir(&res).unwrap();
        symlink(&outside, res.join("abcd")).unwrap();

        let stats = cleanup(&res, "1");
        assert!(stats.removed.is_empty());
        assert!(outside.join("keep").exists());
    }

    #[test]
    fn test_cleanup_failures_are_reported_not_returned() {
        let dir = tempdir().unwrap();
        let res = dir.path();
        for name in ["1", "2", "3"] {
            fs::create_dir(res.join(name)).unwrap();
        }

        let stats = cleanup_with(res, "3", |path| {
            if path.ends_with("1") {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
            } else {
                fs::remove_dir_all(path)
            }
        });

        assert_eq!(stats.failed, vec!["1"]);
        assert_eq!(stats.removed, vec!["2"]);
        assert!(res.join("1").is_dir());
        assert!(res.join("3").is_dir());
    }

    #[test]
    fn test_remove_version_with_read_only_dirs() {
        let dir = tempdir().unwrap();
        let version = dir.path().join("10");
        fs::create_dir_all(version.join("ro/inner")).unwrap();
        fs::write(version.join("ro/inner/file"), "x").unwrap();
        for sub in ["ro/inner", "ro"] {
            fs::set_permissions(version.join(sub), fs::Permissions::from_mode(0o555)).unwrap();
        }

        remove_version(&version).unwrap();
        assert!(!version.exists());
    }

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        let dir = tempdir().unwrap();
        let stats = cleanup(&dir.path().join("missing"), "1");
        assert_eq!(stats, CleanupStats::default());
    }
}
