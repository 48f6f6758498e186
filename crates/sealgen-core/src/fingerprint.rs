//! Run identity: parameter hash, manifest fingerprint and universe hash.
//!
//! # Algorithms
//!
//! ```text
//! parameter_hash       = sha256( concat( sorted(param_hex_digests) ) )
//! manifest_fingerprint = sha256( concat( sorted(all_hex_digests) ) || build_id || parameter_hash[32 bytes] )
//! universe_hash        = sha256( concat( sorted(constituent_hex_digests) ) )
//! ```
//!
//! # Invariants
//!
//! 1. Inputs are always sorted before hashing, so the caller's order never matters.
//! 2. Any byte change in any constituent artifact changes the result.
//! 3. Parameter hash and manifest fingerprint are different identifiers even for
//!    the same digest list (the fingerprint also binds build id and parameter hash).

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::hashing::{is_sha256_hex, ArtifactDigest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse a 64-char lowercase hex identifier.
            pub fn parse(s: &str) -> CoreResult<Self> {
                if !is_sha256_hex(s) {
                    return Err(CoreError::new(
                        ErrorCode::Schema,
                        format!("{} must be 64 lowercase hex chars, got '{}'", $label, s),
                    ));
                }
                Ok(Self(s.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The raw 32 bytes behind the hex form.
            pub fn to_bytes(&self) -> [u8; 32] {
                let mut out = [0_u8; 32];
                // Validated at construction.
                if let Ok(raw) = hex::decode(&self.0) {
                    out.copy_from_slice(&raw);
                }
                out
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(s: String) -> CoreResult<Self> {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

hex_id!(
    /// Identifies the tunable configuration, independent of code version.
    ParameterHash,
    "parameter_hash"
);
hex_id!(
    /// Identifies one exact run configuration.
    ManifestFingerprint,
    "manifest_fingerprint"
);
hex_id!(
    /// Binds several independently versioned digests into one audit token.
    UniverseHash,
    "universe_hash"
);

fn sorted_concat_hasher<'a>(digests: impl IntoIterator<Item = &'a str>) -> Sha256 {
    let mut sorted: Vec<&str> = digests.into_iter().collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for d in sorted {
        hasher.update(d.as_bytes());
    }
    hasher
}

/// Hash over parameter-class digests only.
///
/// Fails with `E_S0_PRECONDITION` when no parameter-class asset exists.
pub fn parameter_hash(param_digests: &[ArtifactDigest]) -> CoreResult<ParameterHash> {
    if param_digests.is_empty() {
        return Err(CoreError::precondition(
            "parameter_hash requires at least one parameter-class asset",
        ));
    }
    for d in param_digests {
        check_digest(d)?;
    }
    let hasher = sorted_concat_hasher(param_digests.iter().map(|d| d.sha256_hex.as_str()));
    Ok(ParameterHash(hex::encode(hasher.finalize())))
}

/// Normalize a build identity: trimmed and lowercased. Empty ids are rejected.
pub fn normalize_build_id(build_id: &str) -> CoreResult<String> {
    let normalized = build_id.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(CoreError::config("build_id must not be empty"));
    }
    Ok(normalized)
}

/// Hash over every sealed digest, the build identity and the parameter hash.
pub fn manifest_fingerprint(
    all_digests: &[ArtifactDigest],
    build_id: &str,
    parameter_hash: &ParameterHash,
) -> CoreResult<ManifestFingerprint> {
    if all_digests.is_empty() {
        return Err(CoreError::precondition(
            "manifest_fingerprint requires at least one sealed asset",
        ));
    }
    for d in all_digests {
        check_digest(d)?;
    }
    let build_id = normalize_build_id(build_id)?;
    let mut hasher = sorted_concat_hasher(all_digests.iter().map(|d| d.sha256_hex.as_str()));
    hasher.update(build_id.as_bytes());
    hasher.update(parameter_hash.to_bytes());
    Ok(ManifestFingerprint(hex::encode(hasher.finalize())))
}

/// Hash binding independently versioned digests (policy, data, blob).
pub fn universe_hash<'a>(
    constituents: impl IntoIterator<Item = &'a str>,
) -> CoreResult<UniverseHash> {
    let constituents: Vec<&str> = constituents.into_iter().collect();
    if constituents.is_empty() {
        return Err(CoreError::precondition(
            "universe_hash requires at least one constituent digest",
        ));
    }
    if let Some(bad) = constituents.iter().find(|d| !is_sha256_hex(d)) {
        return Err(CoreError::schema(format!(
            "universe constituent is not a sha256 hex digest: '{}'",
            bad
        )));
    }
    let hasher = sorted_concat_hasher(constituents);
    Ok(UniverseHash(hex::encode(hasher.finalize())))
}

fn check_digest(d: &ArtifactDigest) -> CoreResult<()> {
    if !is_sha256_hex(&d.sha256_hex) {
        return Err(CoreError::schema(format!(
            "digest for '{}' is not 64 lowercase hex chars",
            d.logical_id
        ))
        .with_path(&d.path));
    }
    Ok(())
}
