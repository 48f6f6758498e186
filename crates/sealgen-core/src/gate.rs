//! Upstream validation gates and gate receipts.
//!
//! # Validation bundle
//!
//! ```text
//! <bundle>/
//!   index.json      [{"artifact_id": .., "path": .., "sha256_hex": ..}, ...]
//!   _passed.flag    sha256_hex = <64 hex>
//!   <artifacts listed in index.json>
//! ```
//!
//! The bundle digest is SHA-256 over the raw bytes of every indexed file in
//! ascending path order. A bundle passes when each file matches its index
//! row and the recomputed bundle digest equals the flag. Every file in the
//! bundle other than `index.json` and `_passed.flag` must be indexed.
//!
//! # Receipt
//!
//! A [`GateReceiptRecord`] states which upstream segments passed for one
//! manifest fingerprint and which policies were sealed. Downstream stages call
//! [`assert_gate_receipt`] before doing anything else.

use crate::canonical::to_pretty_ascii;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::fingerprint::{ManifestFingerprint, ParameterHash};
use crate::hashing::{is_sha256_hex, list_files_sorted, sha256_bytes};
use crate::resolve::validate_relative_path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const INDEX_FILE: &str = "index.json";
pub const PASSED_FLAG: &str = "_passed.flag";
const FLAG_PREFIX: &str = "sha256_hex = ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleIndexEntry {
    pub artifact_id: String,
    pub path: String,
    pub sha256_hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamGate {
    /// Bundle directory relative to the data root.
    pub bundle_path: String,
    pub flag_sha256_hex: String,
    pub status: GateStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SealedPolicy {
    pub logical_id: String,
    pub sha256_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateReceiptRecord {
    pub segment: String,
    pub manifest_fingerprint: ManifestFingerprint,
    pub parameter_hash: ParameterHash,
    pub seed: u64,
    pub build_id: String,
    pub upstream_gates: BTreeMap<String, UpstreamGate>,
    pub sealed_policy_set: Vec<SealedPolicy>,
    /// Artifact name → SHA-256 of its published bytes.
    pub digests: BTreeMap<String, String>,
}

impl GateReceiptRecord {
    pub fn to_pretty_ascii(&self) -> CoreResult<Vec<u8>> {
        to_pretty_ascii(self)
    }
}

/// Recompute and check one upstream bundle.
pub fn verify_bundle(segment: &str, bundle_dir: &Path) -> CoreResult<String> {
    let missing = |what: &str, path: &Path| {
        CoreError::new(
            ErrorCode::UpstreamMissing,
            format!("upstream {} not found", what),
        )
        .with_subject(segment)
        .with_path(path)
    };
    if !bundle_dir.is_dir() {
        return Err(missing("validation bundle", bundle_dir));
    }
    let index_path = bundle_dir.join(INDEX_FILE);
    if !index_path.is_file() {
        return Err(missing("bundle index", &index_path));
    }

    let index_bytes = std::fs::read(&index_path).map_err(|e| CoreError::io(e, &index_path))?;
    let mut index: Vec<BundleIndexEntry> = serde_json::from_slice(&index_bytes).map_err(|e| {
        CoreError::schema(format!("malformed bundle index: {}", e))
            .with_subject(segment)
            .with_path(&index_path)
    })?;
    check_index(&index).map_err(|e| e.with_subject(segment).with_path(&index_path))?;
    index.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

    let indexed: BTreeSet<&str> = index.iter().map(|e| e.path.as_str()).collect();
    for (rel, path) in list_files_sorted(bundle_dir)? {
        if rel != INDEX_FILE && rel != PASSED_FLAG && !indexed.contains(rel.as_str()) {
            return Err(CoreError::schema(format!("bundle file '{}' is not indexed", rel))
                .with_subject(segment)
                .with_path(path));
        }
    }

    let mut hasher = Sha256::new();
    for entry in &index {
        let path = bundle_dir.join(&entry.path);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                missing("bundle artifact", &path)
            } else {
                CoreError::io(e, &path)
            }
        })?;
        let actual = sha256_bytes(&bytes);
        if actual != entry.sha256_hex {
            return Err(CoreError::new(
                ErrorCode::FlagHashMismatch,
                format!(
                    "artifact '{}' hashes to {}, index declares {}",
                    entry.artifact_id, actual, entry.sha256_hex
                ),
            )
            .with_subject(segment)
            .with_path(path));
        }
        hasher.update(&bytes);
    }
    let computed = hex::encode(hasher.finalize());

    let flag_path = bundle_dir.join(PASSED_FLAG);
    if !flag_path.is_file() {
        return Err(CoreError::new(
            ErrorCode::UpstreamGate,
            "upstream bundle has no pass marker",
        )
        .with_subject(segment)
        .with_path(&flag_path));
    }
    let declared = read_flag(&flag_path).map_err(|e| e.with_subject(segment))?;
    if declared != computed {
        warn!(segment, declared = %declared, computed = %computed, "upstream gate digest mismatch");
        return Err(CoreError::new(
            ErrorCode::FlagHashMismatch,
            format!("bundle digest {} does not match pass marker {}", computed, declared),
        )
        .with_subject(segment)
        .with_path(&flag_path));
    }
    info!(segment, bundle = %bundle_dir.display(), "upstream gate PASS");
    Ok(computed)
}

fn check_index(index: &[BundleIndexEntry]) -> CoreResult<()> {
    if index.is_empty() {
        return Err(CoreError::schema("bundle index is empty"));
    }
    let mut paths = BTreeSet::new();
    for entry in index {
        validate_relative_path(&entry.path).map_err(|e| {
            CoreError::schema(format!("unsafe bundle path: {}", e.message))
        })?;
        if entry.path == INDEX_FILE || entry.path == PASSED_FLAG {
            return Err(CoreError::schema(format!(
                "bundle index may not list '{}'",
                entry.path
            )));
        }
        if !is_sha256_hex(&entry.sha256_hex) {
            return Err(CoreError::schema(format!(
                "index digest for '{}' is not sha256 hex",
                entry.path
            )));
        }
        if !paths.insert(entry.path.as_str()) {
            return Err(CoreError::schema(format!(
                "bundle path '{}' indexed twice",
                entry.path
            )));
        }
    }
    Ok(())
}

fn read_flag(path: &Path) -> CoreResult<String> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(e, path))?;
    let digest = text
        .trim()
        .strip_prefix(FLAG_PREFIX)
        .map(str::trim)
        .filter(|d| is_sha256_hex(d))
        .ok_or_else(|| {
            CoreError::schema("pass marker must read 'sha256_hex = <64 hex>'").with_path(path)
        })?;
    Ok(digest.to_string())
}

/// Writes validation bundles in the layout [`verify_bundle`] accepts.
#[derive(Debug, Default)]
pub struct ValidationBundleWriter {
    artifacts: BTreeMap<String, (String, Vec<u8>)>,
}

impl ValidationBundleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        mut self,
        artifact_id: impl Into<String>,
        path: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        self.artifacts
            .insert(path.into(), (artifact_id.into(), bytes.into()));
        self
    }

    /// Write artifacts, index and pass marker into `dir`. Returns the bundle digest.
    pub fn write(self, dir: &Path) -> CoreResult<String> {
        let mut index = Vec::with_capacity(self.artifacts.len());
        let mut hasher = Sha256::new();
        for (path, (artifact_id, bytes)) in &self.artifacts {
            validate_relative_path(path)?;
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::io(e, parent))?;
            }
            std::fs::write(&target, bytes).map_err(|e| CoreError::io(e, &target))?;
            hasher.update(bytes);
            index.push(BundleIndexEntry {
                artifact_id: artifact_id.clone(),
                path: path.clone(),
                sha256_hex: sha256_bytes(bytes),
            });
        }
        check_index(&index)?;
        let digest = hex::encode(hasher.finalize());
        let index_path = dir.join(INDEX_FILE);
        std::fs::write(&index_path, to_pretty_ascii(&index)?)
            .map_err(|e| CoreError::io(e, &index_path))?;
        let flag_path = dir.join(PASSED_FLAG);
        std::fs::write(&flag_path, format!("{}{}\n", FLAG_PREFIX, digest))
            .map_err(|e| CoreError::io(e, &flag_path))?;
        Ok(digest)
    }
}

/// Verify that a receipt exists for `expected` and that every required segment passed.
pub fn assert_gate_receipt(
    path: &Path,
    expected: &ManifestFingerprint,
    required_segments: &[String],
) -> CoreResult<GateReceiptRecord> {
    if !path.is_file() {
        return Err(CoreError::precondition("gate receipt not found").with_path(path));
    }
    let bytes = std::fs::read(path).map_err(|e| CoreError::io(e, path))?;
    let receipt: GateReceiptRecord =
        serde_json::from_slice(&bytes).map_err(|e| CoreError::from(e).with_path(path))?;
    if &receipt.manifest_fingerprint != expected {
        return Err(CoreError::new(
            ErrorCode::Immutability,
            format!(
                "receipt is for fingerprint {}, run expects {}",
                receipt.manifest_fingerprint, expected
            ),
        )
        .with_path(path));
    }
    for segment in required_segments {
        match receipt.upstream_gates.get(segment) {
            Some(gate) if gate.status == GateStatus::Pass => {}
            Some(_) => {
                return Err(CoreError::new(ErrorCode::UpstreamGate, "upstream gate is not PASS")
                    .with_subject(segment.clone())
                    .with_path(path))
            }
            None => {
                return Err(CoreError::new(
                    ErrorCode::UpstreamGate,
                    "receipt has no gate for required segment",
                )
                .with_subject(segment.clone())
                .with_path(path))
            }
        }
    }
    Ok(receipt)
}

/// Relative `/`-separated form of `path` under `root`, or the path as given.
pub(crate) fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

/// Verify each upstream bundle; the first failure aborts.
pub fn verify_upstream(
    data_root: &Path,
    bundles: &BTreeMap<String, PathBuf>,
) -> CoreResult<BTreeMap<String, UpstreamGate>> {
    let mut gates = BTreeMap::new();
    for (segment, dir) in bundles {
        let flag = verify_bundle(segment, dir)?;
        gates.insert(
            segment.clone(),
            UpstreamGate {
                bundle_path: display_relative(data_root, dir),
                flag_sha256_hex: flag,
                status: GateStatus::Pass,
            },
        );
    }
    Ok(gates)
}
