//! Sealed input snapshots.
//!
//! A [`SealedInputSet`] records the digest of every asset a run depends on.
//! It is created once per manifest fingerprint and read-only afterwards;
//! readers call [`SealedInputSet::verify_all`] or [`SealedInputSet::reverify`]
//! before trusting any sealed content.
//!
//! Entries are kept sorted by `(owner, kind, logical_id, path)` so the
//! serialized snapshot is byte-stable regardless of request order.

use crate::canonical::to_pretty_ascii;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::fingerprint::{
    manifest_fingerprint, normalize_build_id, parameter_hash, ManifestFingerprint, ParameterHash,
};
use crate::hashing::{is_sha256_hex, ArtifactDigest};
use crate::resolve::{PathResolver, PathTokens};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Tunable parameters; the only kind that feeds the parameter hash.
    Parameter,
    Policy,
    Dataset,
    /// A receipt published by an earlier stage.
    Receipt,
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parameter => "parameter",
            Self::Policy => "policy",
            Self::Dataset => "dataset",
            Self::Receipt => "receipt",
        };
        f.write_str(s)
    }
}

/// One asset a stage requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetRequest {
    pub owner: String,
    pub kind: AssetKind,
    pub logical_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SealedInputEntry {
    pub owner: String,
    pub kind: AssetKind,
    pub logical_id: String,
    /// Relative to the data root, `/`-separated.
    pub path: String,
    pub sha256_hex: String,
    pub size_bytes: u64,
}

impl SealedInputEntry {
    fn sort_key(&self) -> (&str, AssetKind, &str, &str) {
        (&self.owner, self.kind, &self.logical_id, &self.path)
    }

    /// Digest view with an absolute path under `data_root`.
    pub fn digest(&self, data_root: &Path) -> ArtifactDigest {
        ArtifactDigest {
            logical_id: self.logical_id.clone(),
            path: data_root.join(&self.path),
            sha256_hex: self.sha256_hex.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SealedInputSet {
    pub manifest_fingerprint: ManifestFingerprint,
    pub parameter_hash: ParameterHash,
    pub build_id: String,
    pub entries: Vec<SealedInputEntry>,
}

impl SealedInputSet {
    /// Resolve, hash and fingerprint every requested asset.
    ///
    /// Nothing is written; the caller publishes the snapshot once every other
    /// precondition of the stage holds.
    pub fn seal(
        requests: &[AssetRequest],
        resolver: &dyn PathResolver,
        tokens: &PathTokens,
        build_id: &str,
    ) -> CoreResult<Self> {
        if requests.is_empty() {
            return Err(CoreError::precondition("no assets to seal"));
        }
        let build_id = normalize_build_id(build_id)?;

        let mut seen = BTreeSet::new();
        for req in requests {
            if !seen.insert((req.owner.as_str(), req.logical_id.as_str())) {
                return Err(CoreError::new(
                    ErrorCode::SealedDuplicate,
                    format!(
                        "asset requested twice for owner '{}': {}",
                        req.owner, req.logical_id
                    ),
                )
                .with_subject(req.logical_id.clone()));
            }
        }

        let data_root = resolver.data_root();
        let mut entries = Vec::with_capacity(requests.len());
        for req in requests {
            let path = resolver.resolve(&req.logical_id, tokens)?;
            let digest = ArtifactDigest::compute(req.logical_id.clone(), path.clone())?;
            debug!(
                owner = %req.owner,
                logical_id = %req.logical_id,
                sha256 = %digest.sha256_hex,
                size_bytes = digest.size_bytes,
                "sealed asset"
            );
            entries.push(SealedInputEntry {
                owner: req.owner.clone(),
                kind: req.kind,
                logical_id: req.logical_id.clone(),
                path: relative_to_root(data_root, &path)?,
                sha256_hex: digest.sha256_hex,
                size_bytes: digest.size_bytes,
            });
        }
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let all: Vec<ArtifactDigest> = entries.iter().map(|e| e.digest(data_root)).collect();
        let params: Vec<ArtifactDigest> = entries
            .iter()
            .filter(|e| e.kind == AssetKind::Parameter)
            .map(|e| e.digest(data_root))
            .collect();
        let parameter_hash = parameter_hash(&params)?;
        let manifest_fingerprint = manifest_fingerprint(&all, &build_id, &parameter_hash)?;

        info!(
            assets = entries.len(),
            parameter_hash = %parameter_hash,
            manifest_fingerprint = %manifest_fingerprint,
            "sealed input set"
        );

        Ok(Self {
            manifest_fingerprint,
            parameter_hash,
            build_id,
            entries,
        })
    }

    pub fn to_pretty_ascii(&self) -> CoreResult<Vec<u8>> {
        to_pretty_ascii(self)
    }

    pub fn from_slice(bytes: &[u8]) -> CoreResult<Self> {
        let set: Self = serde_json::from_slice(bytes)?;
        set.check_well_formed()?;
        Ok(set)
    }

    /// Read a published snapshot.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::precondition("sealed input snapshot not found").with_path(path));
        }
        let bytes = std::fs::read(path).map_err(|e| CoreError::io(e, path))?;
        Self::from_slice(&bytes).map_err(|e| e.with_path(path))
    }

    fn check_well_formed(&self) -> CoreResult<()> {
        let mut seen = BTreeSet::new();
        for pair in self.entries.windows(2) {
            if pair[0].sort_key() > pair[1].sort_key() {
                return Err(CoreError::schema(format!(
                    "sealed entries are not sorted at '{}'",
                    pair[1].logical_id
                )));
            }
        }
        for e in &self.entries {
            if !is_sha256_hex(&e.sha256_hex) {
                return Err(CoreError::schema("sealed entry digest is not sha256 hex")
                    .with_subject(e.logical_id.clone()));
            }
            if !seen.insert((e.owner.as_str(), e.logical_id.as_str())) {
                return Err(CoreError::new(
                    ErrorCode::SealedDuplicate,
                    format!("duplicate sealed entry for owner '{}'", e.owner),
                )
                .with_subject(e.logical_id.clone()));
            }
        }
        Ok(())
    }

    pub fn lookup(&self, owner: &str, logical_id: &str) -> Option<&SealedInputEntry> {
        self.entries
            .iter()
            .find(|e| e.owner == owner && e.logical_id == logical_id)
    }

    /// Re-hash one sealed asset and return its absolute path when it still matches.
    pub fn reverify(&self, data_root: &Path, owner: &str, logical_id: &str) -> CoreResult<PathBuf> {
        let entry = self.lookup(owner, logical_id).ok_or_else(|| {
            CoreError::precondition(format!(
                "asset '{}' of owner '{}' is not sealed",
                logical_id, owner
            ))
            .with_subject(logical_id)
        })?;
        let digest = entry.digest(data_root);
        digest.reverify()?;
        Ok(digest.path)
    }

    /// Re-hash every sealed asset; the first divergence fails.
    pub fn verify_all(&self, data_root: &Path) -> CoreResult<()> {
        for entry in &self.entries {
            entry.digest(data_root).reverify()?;
        }
        debug!(assets = self.entries.len(), "sealed inputs re-verified");
        Ok(())
    }

    /// Policy-kind entries, in snapshot order.
    pub fn policies(&self) -> impl Iterator<Item = &SealedInputEntry> {
        self.entries.iter().filter(|e| e.kind == AssetKind::Policy)
    }
}

fn relative_to_root(data_root: &Path, path: &Path) -> CoreResult<String> {
    let rel = path.strip_prefix(data_root).map_err(|_| {
        CoreError::precondition("resolved asset lies outside the data root").with_path(path)
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::TemplateResolver;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, TemplateResolver) {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("params")).unwrap();
        std::fs::write(root.path().join("params/hurdle.yaml"), b"beta: 0.5\n").unwrap();
        std::fs::write(root.path().join("params/priors.json"), b"[]").unwrap();
        std::fs::write(root.path().join("policy.yaml"), b"cap: 3\n").unwrap();
        let resolver = TemplateResolver::new(root.path())
            .with_templates([
                ("hurdle".to_string(), "params/hurdle.yaml".to_string()),
                ("priors".to_string(), "params/priors.json".to_string()),
                ("policy".to_string(), "policy.yaml".to_string()),
            ])
            .unwrap();
        (root, resolver)
    }

    fn req(owner: &str, kind: AssetKind, id: &str) -> AssetRequest {
        AssetRequest {
            owner: owner.into(),
            kind,
            logical_id: id.into(),
        }
    }

    #[test]
    fn test_seal_is_order_independent() {
        let (_root, resolver) = fixture();
        let a = vec![
            req("1A", AssetKind::Parameter, "hurdle"),
            req("1A", AssetKind::Policy, "policy"),
            req("1A", AssetKind::Parameter, "priors"),
        ];
        let mut b = a.clone();
        b.reverse();
        let tokens = PathTokens::default();
        let sa = SealedInputSet::seal(&a, &resolver, &tokens, "build-1").unwrap();
        let sb = SealedInputSet::seal(&b, &resolver, &tokens, "build-1").unwrap();
        assert_eq!(sa, sb);
        assert_eq!(sa.to_pretty_ascii().unwrap(), sb.to_pretty_ascii().unwrap());
        assert_eq!(sa.entries[0].logical_id, "hurdle");
        assert_eq!(sa.entries[0].path, "params/hurdle.yaml");
    }

    #[test]
    fn test_duplicate_rejected() {
        let (_root, resolver) = fixture();
        let reqs = vec![
            req("1A", AssetKind::Parameter, "hurdle"),
            req("1A", AssetKind::Dataset, "hurdle"),
        ];
        let err = SealedInputSet::seal(&reqs, &resolver, &PathTokens::default(), "b").unwrap_err();
        assert_eq!(err.code, ErrorCode::SealedDuplicate);
    }

    #[test]
    fn test_no_parameter_assets_is_precondition() {
        let (_root, resolver) = fixture();
        let reqs = vec![req("1A", AssetKind::Policy, "policy")];
        let err = SealedInputSet::seal(&reqs, &resolver, &PathTokens::default(), "b").unwrap_err();
        assert_eq!(err.code, ErrorCode::S0Precondition);
    }

    #[test]
    fn test_roundtrip_and_tamper_detection() {
        let (root, resolver) = fixture();
        let reqs = vec![req("1A", AssetKind::Parameter, "hurdle")];
        let set = SealedInputSet::seal(&reqs, &resolver, &PathTokens::default(), "b").unwrap();
        let back = SealedInputSet::from_slice(&set.to_pretty_ascii().unwrap()).unwrap();
        assert_eq!(back, set);
        back.verify_all(root.path()).unwrap();

        std::fs::write(root.path().join("params/hurdle.yaml"), b"beta: 0.6\n").unwrap();
        let err = back.reverify(root.path(), "1A", "hurdle").unwrap_err();
        assert_eq!(err.code, ErrorCode::SealedDigestMismatch);
    }

    #[test]
    fn test_build_id_changes_fingerprint_not_parameter_hash() {
        let (_root, resolver) = fixture();
        let reqs = vec![req("1A", AssetKind::Parameter, "hurdle")];
        let t = PathTokens::default();
        let a = SealedInputSet::seal(&reqs, &resolver, &t, "build-1").unwrap();
        let b = SealedInputSet::seal(&reqs, &resolver, &t, "build-2").unwrap();
        let c = SealedInputSet::seal(&reqs, &resolver, &t, "  BUILD-1 ").unwrap();
        assert_eq!(a.parameter_hash, b.parameter_hash);
        assert_ne!(a.manifest_fingerprint, b.manifest_fingerprint);
        assert_eq!(a.manifest_fingerprint, c.manifest_fingerprint);
    }
}
