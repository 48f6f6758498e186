//! Streaming SHA-256 over bytes, files and directories.
//!
//! All digests are lowercase hex without prefix (64 chars). Directory digests
//! hash file contents in ascending relative-path order, so the result does not
//! depend on the order the filesystem lists entries in.

use crate::error::{CoreError, CoreResult, ErrorCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Chunk size used when streaming files.
pub const FILE_CHUNK_BYTES: usize = 1 << 20;

pub fn sha256_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a regular file in fixed-size chunks.
pub fn sha256_file(path: &Path) -> CoreResult<String> {
    let mut hasher = Sha256::new();
    update_from_file(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

fn update_from_file(hasher: &mut Sha256, path: &Path) -> CoreResult<u64> {
    let mut file = File::open(path).map_err(|e| CoreError::io(e, path))?;
    let mut buf = vec![0_u8; FILE_CHUNK_BYTES];
    let mut total = 0_u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| CoreError::io(e, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

/// List regular files below `root` as `/`-separated relative paths, sorted bytewise.
///
/// Symlinks are rejected: a sealed directory must be self-contained.
pub fn list_files_sorted(root: &Path) -> CoreResult<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| CoreError::io(e, &dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io(e, &dir))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| CoreError::io(e, &path))?;
            if file_type.is_symlink() {
                return Err(CoreError::precondition("symlinks are not allowed in sealed directories")
                    .with_path(&path));
            }
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let rel = relative_slash_path(root, &path)?;
                out.push((rel, path));
            }
        }
    }
    out.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    Ok(out)
}

fn relative_slash_path(root: &Path, path: &Path) -> CoreResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        CoreError::precondition("file escapes directory root").with_path(path)
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Hash a directory: SHA-256 over the concatenated contents of every file,
/// ordered by relative path. Returns the digest and total byte count.
pub fn sha256_dir(root: &Path) -> CoreResult<(String, u64)> {
    let files = list_files_sorted(root)?;
    let mut hasher = Sha256::new();
    let mut total = 0_u64;
    for (_, path) in &files {
        total += update_from_file(&mut hasher, path)?;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Digest of one sealed artifact. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub logical_id: String,
    pub path: PathBuf,
    pub sha256_hex: String,
    pub size_bytes: u64,
}

impl ArtifactDigest {
    /// Hash the file or directory at `path`.
    ///
    /// Missing paths, empty files and empty directories fail with
    /// `E_S0_PRECONDITION`.
    pub fn compute(logical_id: impl Into<String>, path: impl Into<PathBuf>) -> CoreResult<Self> {
        let logical_id = logical_id.into();
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|e| {
            CoreError::precondition(format!("required input is missing: {}", e))
                .with_path(&path)
                .with_subject(logical_id.clone())
        })?;

        let (sha256_hex, size_bytes) = if meta.is_dir() {
            sha256_dir(&path)?
        } else {
            (sha256_file(&path)?, meta.len())
        };

        if size_bytes == 0 {
            return Err(CoreError::precondition("required input is empty")
                .with_path(&path)
                .with_subject(logical_id));
        }

        Ok(Self {
            logical_id,
            path,
            sha256_hex,
            size_bytes,
        })
    }

    /// Recompute the digest on disk and fail if it no longer matches.
    pub fn reverify(&self) -> CoreResult<()> {
        let current = Self::compute(self.logical_id.clone(), self.path.clone())?;
        if current.sha256_hex != self.sha256_hex {
            return Err(CoreError::new(
                ErrorCode::SealedDigestMismatch,
                format!(
                    "expected {}, found {}",
                    self.sha256_hex, current.sha256_hex
                ),
            )
            .with_path(&self.path)
            .with_subject(self.logical_id.clone()));
        }
        Ok(())
    }
}

/// True when `s` is exactly 64 lowercase hex characters.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
