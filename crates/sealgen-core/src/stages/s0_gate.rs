//! S0: seal inputs, fingerprint the run, verify upstream gates, publish the receipt.
//!
//! Every check happens before the first byte is published. The sealed
//! snapshot is published first and the receipt, which records the snapshot's
//! digest, second.

use crate::error::CoreResult;
use crate::gate::{verify_upstream, GateReceiptRecord, SealedPolicy};
use crate::hashing::sha256_bytes;
use crate::publish::{AtomicPublisher, PublishOutcome};
use crate::resolve::{
    render_template, validate_relative_path, PathResolver, PathTokens, GATE_RECEIPT_ID,
    SEALED_INPUTS_ID,
};
use crate::schema::{ArtifactKind, SchemaRegistry};
use crate::sealed::{AssetRequest, SealedInputSet};
use crate::stage::Stage;
use std::collections::BTreeMap;
use tracing::info;

pub const SEALED_INPUTS_DIGEST_KEY: &str = "sealed_inputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S0Inputs {
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct S0Output {
    pub sealed: SealedInputSet,
    pub receipt: GateReceiptRecord,
    pub sealed_inputs: PublishOutcome,
    pub receipt_file: PublishOutcome,
}

pub struct S0GateStage<'a> {
    segment: String,
    build_id: String,
    assets: Vec<AssetRequest>,
    /// Segment id → bundle directory template.
    upstream: BTreeMap<String, String>,
    resolver: &'a dyn PathResolver,
    schemas: &'a SchemaRegistry,
    publisher: AtomicPublisher,
}

impl<'a> S0GateStage<'a> {
    pub fn new(
        segment: impl Into<String>,
        build_id: impl Into<String>,
        resolver: &'a dyn PathResolver,
        schemas: &'a SchemaRegistry,
    ) -> Self {
        Self {
            segment: segment.into(),
            build_id: build_id.into(),
            assets: Vec::new(),
            upstream: BTreeMap::new(),
            resolver,
            schemas,
            publisher: AtomicPublisher::new(),
        }
    }

    pub fn with_assets(mut self, assets: Vec<AssetRequest>) -> Self {
        self.assets = assets;
        self
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<String, String>) -> Self {
        self.upstream = upstream;
        self
    }
}

impl Stage for S0GateStage<'_> {
    type Input = S0Inputs;
    type Output = S0Output;

    fn name(&self) -> &'static str {
        "s0_gate"
    }

    fn run(&self, inputs: &S0Inputs) -> CoreResult<S0Output> {
        let data_root = self.resolver.data_root();
        let seed_tokens = PathTokens {
            seed: Some(inputs.seed),
            ..PathTokens::default()
        };
        let sealed = SealedInputSet::seal(&self.assets, self.resolver, &seed_tokens, &self.build_id)?;

        let tokens = PathTokens {
            seed: Some(inputs.seed),
            parameter_hash: Some(sealed.parameter_hash.clone()),
            manifest_fingerprint: Some(sealed.manifest_fingerprint.clone()),
            run_id: None,
        };
        let mut bundles = BTreeMap::new();
        for (segment, template) in &self.upstream {
            let rel = render_template(template, &tokens).map_err(|e| e.with_subject(segment.clone()))?;
            validate_relative_path(&rel).map_err(|e| e.with_subject(segment.clone()))?;
            bundles.insert(segment.clone(), data_root.join(rel));
        }
        let upstream_gates = verify_upstream(data_root, &bundles)?;

        self.schemas.validate(ArtifactKind::SealedInputs, &sealed)?;
        let sealed_bytes = sealed.to_pretty_ascii()?;

        let receipt = GateReceiptRecord {
            segment: self.segment.clone(),
            manifest_fingerprint: sealed.manifest_fingerprint.clone(),
            parameter_hash: sealed.parameter_hash.clone(),
            seed: inputs.seed,
            build_id: sealed.build_id.clone(),
            upstream_gates,
            sealed_policy_set: sealed
                .policies()
                .map(|e| SealedPolicy {
                    logical_id: e.logical_id.clone(),
                    sha256_hex: e.sha256_hex.clone(),
                })
                .collect(),
            digests: [(
                SEALED_INPUTS_DIGEST_KEY.to_string(),
                sha256_bytes(&sealed_bytes),
            )]
            .into_iter()
            .collect(),
        };
        self.schemas.validate(ArtifactKind::GateReceipt, &receipt)?;
        let receipt_bytes = receipt.to_pretty_ascii()?;

        let sealed_path = self.resolver.resolve(SEALED_INPUTS_ID, &tokens)?;
        let receipt_path = self.resolver.resolve(GATE_RECEIPT_ID, &tokens)?;
        for path in [&sealed_path, &receipt_path] {
            if let Some(parent) = path.parent() {
                self.publisher.sweep_orphans(parent)?;
            }
        }
        let sealed_outcome = self.publisher.publish_bytes(&sealed_path, &sealed_bytes)?;
        let receipt_outcome = self.publisher.publish_bytes(&receipt_path, &receipt_bytes)?;

        info!(
            stage = self.name(),
            segment = %self.segment,
            manifest_fingerprint = %sealed.manifest_fingerprint,
            upstream = receipt.upstream_gates.len(),
            resumed = receipt_outcome.resumed,
            "gate receipt published"
        );
        Ok(S0Output {
            sealed,
            receipt,
            sealed_inputs: sealed_outcome,
            receipt_file: receipt_outcome,
        })
    }
}
