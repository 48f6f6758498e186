//! Temp-then-atomic-rename publishing with byte-identical-or-fail idempotence.
//!
//! # Contract
//!
//! - Content is written to a private staging location in the same directory
//!   as the final path, fsynced, then renamed into place.
//! - If the final path already exists, the staged content must be
//!   byte-identical to it: the publish then succeeds with `resumed = true` and
//!   the staged copy is discarded. Any difference fails with
//!   `partition_exists_nonidentical` and the existing content is left alone.
//! - [`AtomicPublisher::check_bytes`] and [`AtomicPublisher::check_dir`] apply
//!   the same rule without writing, so a caller publishing several outputs
//!   can refuse all of them before the first one lands.
//! - Staging entries left behind by a cancelled run carry the
//!   [`STAGING_PREFIX`] and are removed by [`AtomicPublisher::sweep_orphans`].

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::hashing::{list_files_sorted, sha256_bytes, sha256_dir, sha256_file};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tracing::{debug, info, warn};

/// Name prefix of every staging file and directory.
pub const STAGING_PREFIX: &str = ".sealgen-tmp-";

/// Result of one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub path: PathBuf,
    pub sha256_hex: String,
    pub bytes: u64,
    /// The final path already held identical content.
    pub resumed: bool,
}

/// A directory being filled before it is published as a whole.
#[derive(Debug)]
pub struct StagedDir {
    temp: TempDir,
    final_dir: PathBuf,
}

impl StagedDir {
    /// Where the caller writes the partition's files.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }
}

#[derive(Debug, Clone, Default)]
pub struct AtomicPublisher;

impl AtomicPublisher {
    pub fn new() -> Self {
        Self
    }

    /// Publish `bytes` at `final_path`.
    pub fn publish_bytes(&self, final_path: &Path, bytes: &[u8]) -> CoreResult<PublishOutcome> {
        let parent = parent_of(final_path)?;
        std::fs::create_dir_all(parent).map_err(|e| CoreError::io(e, parent))?;
        let sha256_hex = sha256_bytes(bytes);

        if final_path.exists() {
            return self.compare_existing_file(final_path, bytes, sha256_hex);
        }

        let mut tmp = Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(parent)
            .map_err(|e| CoreError::io(e, parent))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CoreError::io(e, tmp.path()))?;

        match tmp.persist_noclobber(final_path) {
            Ok(_) => {
                info!(path = %final_path.display(), sha256 = %sha256_hex, "published");
                Ok(PublishOutcome {
                    path: final_path.to_path_buf(),
                    sha256_hex,
                    bytes: bytes.len() as u64,
                    resumed: false,
                })
            }
            // Another publisher won the race; same rule as a pre-existing file.
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                drop(err.file);
                self.compare_existing_file(final_path, bytes, sha256_hex)
            }
            Err(err) => Err(CoreError::io(err.error, final_path)),
        }
    }

    fn compare_existing_file(
        &self,
        final_path: &Path,
        bytes: &[u8],
        sha256_hex: String,
    ) -> CoreResult<PublishOutcome> {
        let existing = std::fs::read(final_path).map_err(|e| CoreError::io(e, final_path))?;
        if existing != bytes {
            return Err(nonidentical(final_path, &sha256_bytes(&existing), &sha256_hex));
        }
        debug!(path = %final_path.display(), "identical content already published; resumed");
        Ok(PublishOutcome {
            path: final_path.to_path_buf(),
            sha256_hex,
            bytes: bytes.len() as u64,
            resumed: true,
        })
    }

    /// Fail with `partition_exists_nonidentical` if `final_path` already holds
    /// different bytes. Writes nothing.
    pub fn check_bytes(&self, final_path: &Path, bytes: &[u8]) -> CoreResult<()> {
        if !final_path.exists() {
            return Ok(());
        }
        let existing = std::fs::read(final_path).map_err(|e| CoreError::io(e, final_path))?;
        if existing != bytes {
            return Err(nonidentical(
                final_path,
                &sha256_bytes(&existing),
                &sha256_bytes(bytes),
            ));
        }
        Ok(())
    }

    /// Directory counterpart of [`check_bytes`](Self::check_bytes).
    pub fn check_dir(&self, staged: &StagedDir) -> CoreResult<()> {
        if !staged.final_dir.exists() {
            return Ok(());
        }
        if dir_listing(staged.path())? != dir_listing(&staged.final_dir)? {
            let (existing_sha, _) = sha256_dir(&staged.final_dir)?;
            let (staged_sha, _) = sha256_dir(staged.path())?;
            return Err(nonidentical(&staged.final_dir, &existing_sha, &staged_sha));
        }
        Ok(())
    }

    /// Create a staging directory next to `final_dir`.
    pub fn stage_dir(&self, final_dir: &Path) -> CoreResult<StagedDir> {
        let parent = parent_of(final_dir)?;
        std::fs::create_dir_all(parent).map_err(|e| CoreError::io(e, parent))?;
        let temp = Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)
            .map_err(|e| CoreError::io(e, parent))?;
        Ok(StagedDir {
            temp,
            final_dir: final_dir.to_path_buf(),
        })
    }

    /// Publish a staged directory as a whole.
    pub fn commit_dir(&self, staged: StagedDir) -> CoreResult<PublishOutcome> {
        let final_dir = staged.final_dir.clone();
        let (sha256_hex, bytes) = sha256_dir(staged.path())?;

        if final_dir.exists() {
            let staged_listing = dir_listing(staged.path())?;
            let existing_listing = dir_listing(&final_dir)?;
            if staged_listing != existing_listing {
                let (existing_sha, _) = sha256_dir(&final_dir)?;
                return Err(nonidentical(&final_dir, &existing_sha, &sha256_hex));
            }
            debug!(path = %final_dir.display(), "identical partition already published; resumed");
            return Ok(PublishOutcome {
                path: final_dir,
                sha256_hex,
                bytes,
                resumed: true,
            });
        }

        let staged_path = staged.temp.keep();
        if let Err(e) = std::fs::rename(&staged_path, &final_dir) {
            let _ = std::fs::remove_dir_all(&staged_path);
            return Err(CoreError::io(e, &final_dir));
        }
        info!(path = %final_dir.display(), sha256 = %sha256_hex, "published partition");
        Ok(PublishOutcome {
            path: final_dir,
            sha256_hex,
            bytes,
            resumed: false,
        })
    }

    /// Remove staging leftovers in `dir`. Returns how many entries were removed.
    ///
    /// Only call while holding the single-writer role for `dir`.
    pub fn sweep_orphans(&self, dir: &Path) -> CoreResult<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in std::fs::read_dir(dir).map_err(|e| CoreError::io(e, dir))? {
            let entry = entry.map_err(|e| CoreError::io(e, dir))?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staging leftover"),
            }
        }
        if removed > 0 {
            info!(dir = %dir.display(), removed, "discarded orphaned staging entries");
        }
        Ok(removed)
    }
}

/// Relative path and digest of every file, in path order.
fn dir_listing(root: &Path) -> CoreResult<Vec<(String, String)>> {
    list_files_sorted(root)?
        .into_iter()
        .map(|(rel, path)| Ok((rel, sha256_file(&path)?)))
        .collect()
}

fn parent_of(path: &Path) -> CoreResult<&Path> {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Ok(Path::new(".")),
    }
}

fn nonidentical(path: &Path, existing_sha: &str, new_sha: &str) -> CoreError {
    CoreError::new(
        ErrorCode::PartitionExistsNonidentical,
        format!(
            "existing content differs (existing sha256 {}, new sha256 {})",
            existing_sha, new_sha
        ),
    )
    .with_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_publish_then_resume() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("out/part-00000.jsonl");
        let publisher = AtomicPublisher::new();

        let first = publisher.publish_bytes(&path, b"row\n").unwrap();
        assert!(!first.resumed);
        assert_eq!(std::fs::read(&path).unwrap(), b"row\n");

        let second = publisher.publish_bytes(&path, b"row\n").unwrap();
        assert!(second.resumed);
        assert_eq!(first.sha256_hex, second.sha256_hex);
    }

    #[test]
    fn test_publish_nonidentical_fails_and_keeps_existing() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("receipt.json");
        let publisher = AtomicPublisher::new();
        publisher.publish_bytes(&path, b"{\"a\":1}").unwrap();

        let err = publisher.publish_bytes(&path, b"{\"a\":2}").unwrap_err();
        assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_no_staging_leftovers_after_publish() {
        let root = TempDir::new().unwrap();
        let publisher = AtomicPublisher::new();
        publisher
            .publish_bytes(&root.path().join("x.json"), b"x")
            .unwrap();
        let names: Vec<String> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["x.json".to_string()]);
    }

    #[test]
    fn test_commit_dir_idempotence() {
        let root = TempDir::new().unwrap();
        let final_dir = root.path().join("logs/run_id=r1");
        let publisher = AtomicPublisher::new();

        let fill = |staged: &StagedDir, content: &[u8]| {
            std::fs::create_dir_all(staged.path().join("events")).unwrap();
            std::fs::write(staged.path().join("events/part-00000.jsonl"), content).unwrap();
        };

        let staged = publisher.stage_dir(&final_dir).unwrap();
        fill(&staged, b"e1\n");
        assert!(!publisher.commit_dir(staged).unwrap().resumed);

        let staged = publisher.stage_dir(&final_dir).unwrap();
        fill(&staged, b"e1\n");
        assert!(publisher.commit_dir(staged).unwrap().resumed);

        let staged = publisher.stage_dir(&final_dir).unwrap();
        fill(&staged, b"e2\n");
        let err = publisher.commit_dir(staged).unwrap_err();
        assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);
        assert_eq!(
            std::fs::read(final_dir.join("events/part-00000.jsonl")).unwrap(),
            b"e1\n"
        );
    }

    #[test]
    fn test_commit_dir_detects_renamed_file() {
        let root = TempDir::new().unwrap();
        let final_dir = root.path().join("p");
        let publisher = AtomicPublisher::new();

        let staged = publisher.stage_dir(&final_dir).unwrap();
        std::fs::write(staged.path().join("a"), b"same").unwrap();
        publisher.commit_dir(staged).unwrap();

        // Same bytes under a different name hash identically but must not resume.
        let staged = publisher.stage_dir(&final_dir).unwrap();
        std::fs::write(staged.path().join("b"), b"same").unwrap();
        let err = publisher.commit_dir(staged).unwrap_err();
        assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);
    }

    #[test]
    fn test_check_bytes_writes_nothing() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("out/a.json");
        let publisher = AtomicPublisher::new();

        publisher.check_bytes(&path, b"x").unwrap();
        assert!(!root.path().join("out").exists());

        publisher.publish_bytes(&path, b"x").unwrap();
        publisher.check_bytes(&path, b"x").unwrap();
        let err = publisher.check_bytes(&path, b"y").unwrap_err();
        assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn test_check_dir_matches_commit_rule() {
        let root = TempDir::new().unwrap();
        let final_dir = root.path().join("p");
        let publisher = AtomicPublisher::new();

        let staged = publisher.stage_dir(&final_dir).unwrap();
        std::fs::write(staged.path().join("a"), b"1").unwrap();
        publisher.check_dir(&staged).unwrap();
        publisher.commit_dir(staged).unwrap();

        let staged = publisher.stage_dir(&final_dir).unwrap();
        std::fs::write(staged.path().join("a"), b"1").unwrap();
        publisher.check_dir(&staged).unwrap();

        let staged = publisher.stage_dir(&final_dir).unwrap();
        std::fs::write(staged.path().join("a"), b"2").unwrap();
        let err = publisher.check_dir(&staged).unwrap_err();
        assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);
        assert!(staged.path().exists());
    }

    #[test]
    fn test_sweep_orphans() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join(format!("{}abc", STAGING_PREFIX))).unwrap();
        std::fs::write(root.path().join(format!("{}def", STAGING_PREFIX)), b"x").unwrap();
        std::fs::write(root.path().join("keep.json"), b"x").unwrap();

        let removed = AtomicPublisher::new().sweep_orphans(root.path()).unwrap();
        assert_eq!(removed, 2);
        assert!(root.path().join("keep.json").exists());
    }
}
