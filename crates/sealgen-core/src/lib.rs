//! Deterministic RNG and content-addressed provenance for reproducible
//! synthetic-data pipelines.
//!
//! This crate provides:
//!
//! - Streaming SHA-256 over files and directories, and the run identifiers
//!   derived from it (parameter hash, manifest fingerprint, universe hash)
//! - Sealed input snapshots, re-verified before any sealed content is trusted
//! - Upstream validation gates and gate receipts
//! - A Philox 2x64-10 counter RNG with independent derived substreams and
//!   exact `(blocks, draws)` accounting
//! - An append-only RNG audit log with replay verification
//! - A self-describing alias-table blob for O(1) weighted routing
//! - Temp-then-atomic-rename publishing with byte-identical-or-fail idempotence
//!
//! # Quick Start
//!
//! ```no_run
//! use sealgen_core::rng::{CounterRngEngine, SubstreamKey};
//! use sealgen_core::ManifestFingerprint;
//!
//! # fn example(fp: ManifestFingerprint) -> sealgen_core::CoreResult<()> {
//! let engine = CounterRngEngine::new(42, &fp);
//! let key = SubstreamKey::new("1A", "dirichlet_gamma_vector").with(1_u64);
//! let mut substream = engine.derive_substream(&key);
//! let (shares, record) = substream.draw_group(|c| c.dirichlet(&[2.0, 3.0]))?;
//! assert_eq!(shares.len(), 2);
//! assert!(record.blocks > 0);
//! # Ok(())
//! # }
//! ```
//!
//! # Persisted formats
//!
//! | Artifact | Encoding |
//! |----------|----------|
//! | sealed inputs, gate receipt, alias index | sorted-key ASCII JSON, 2-space indent |
//! | RNG events and trace, country shares | JSON lines |
//! | alias blob | `u64 header_len \| JCS header \| payload` |

pub mod alias;
pub mod canonical;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gate;
pub mod hashing;
pub mod publish;
pub mod resolve;
pub mod rng;
pub mod schema;
pub mod sealed;
pub mod stage;
pub mod stages;

// Re-export main types
pub use alias::{AliasBlob, AliasBlobEncoder, AliasIndex, AliasIndexEntry, AliasRow, AliasTable};
pub use config::{EngineConfig, EngineConfigOverrides};
pub use error::{CoreError, CoreResult, ErrorClass, ErrorCode};
pub use events::{verify_partition, AuditReport, RngEventWriter, RngLogContext};
pub use fingerprint::{
    manifest_fingerprint, parameter_hash, universe_hash, ManifestFingerprint, ParameterHash,
    UniverseHash,
};
pub use gate::{assert_gate_receipt, verify_bundle, GateReceiptRecord, ValidationBundleWriter};
pub use hashing::{sha256_bytes, sha256_dir, sha256_file, ArtifactDigest};
pub use publish::{AtomicPublisher, PublishOutcome};
pub use resolve::{PathResolver, PathTokens, TemplateResolver};
pub use schema::{ArtifactKind, SchemaRegistry};
pub use sealed::{AssetKind, AssetRequest, SealedInputSet};
pub use stage::{Stage, StageInputs};
