//! Country share draws: one Dirichlet vector per merchant.
//!
//! Reads the merchant country priors from the sealed snapshot, draws
//! `share_drawn ~ Dirichlet(alpha)` on the merchant's own substream
//! `(segment, "dirichlet_gamma_vector", merchant_id)`, and publishes the rows
//! plus the RNG audit partition. Output bytes depend only on
//! `(seed, manifest_fingerprint)` and the sealed priors.

use crate::canonical::jsonl_line;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::events::{verify_partition, AuditReport, RngEventWriter, RngLogContext};
use crate::gate::assert_gate_receipt;
use crate::hashing::sha256_file;
use crate::publish::{AtomicPublisher, PublishOutcome};
use crate::resolve::{PathResolver, COUNTRY_SHARES_ID, GATE_RECEIPT_ID, RNG_LOGS_ID, SEALED_INPUTS_ID};
use crate::rng::{CounterRngEngine, SubstreamKey};
use crate::schema::SchemaRegistry;
use crate::sealed::SealedInputSet;
use crate::stage::{Stage, StageInputs};
use crate::stages::s0_gate::SEALED_INPUTS_DIGEST_KEY;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

pub const SUBSTREAM_LABEL: &str = "dirichlet_gamma_vector";
pub const DEFAULT_PRIORS_ID: &str = "country_priors";

/// Tolerance on `sum(share_drawn) == 1`.
pub const SHARE_SUM_TOLERANCE: f64 = 1e-9;

/// Priors of one merchant: `alpha[i]` belongs to `countries[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MerchantPriors {
    pub merchant_id: u64,
    pub countries: Vec<String>,
    pub alpha: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CountryShareRow {
    pub merchant_id: u64,
    pub country_iso: String,
    pub alpha: f64,
    pub share_drawn: f64,
}

#[derive(Debug, Clone)]
pub struct CountryShareOutput {
    pub rows: Vec<CountryShareRow>,
    pub dataset: PublishOutcome,
    pub logs: PublishOutcome,
    pub audit: AuditReport,
}

pub struct CountryShareStage<'a> {
    segment: String,
    priors_id: String,
    required_segments: Vec<String>,
    max_blocks_per_substream: Option<u64>,
    resolver: &'a dyn PathResolver,
    schemas: &'a SchemaRegistry,
    publisher: AtomicPublisher,
}

impl<'a> CountryShareStage<'a> {
    pub fn new(
        segment: impl Into<String>,
        resolver: &'a dyn PathResolver,
        schemas: &'a SchemaRegistry,
    ) -> Self {
        Self {
            segment: segment.into(),
            priors_id: DEFAULT_PRIORS_ID.to_string(),
            required_segments: Vec::new(),
            max_blocks_per_substream: None,
            resolver,
            schemas,
            publisher: AtomicPublisher::new(),
        }
    }

    pub fn with_priors_id(mut self, priors_id: impl Into<String>) -> Self {
        self.priors_id = priors_id.into();
        self
    }

    /// Upstream segments the receipt must show as PASS.
    pub fn with_required_segments(mut self, segments: Vec<String>) -> Self {
        self.required_segments = segments;
        self
    }

    pub fn with_block_budget(mut self, max_blocks: Option<u64>) -> Self {
        self.max_blocks_per_substream = max_blocks;
        self
    }

    fn load_sealed(&self, inputs: &StageInputs) -> CoreResult<SealedInputSet> {
        let tokens = inputs.tokens();
        let receipt_path = self.resolver.resolve(GATE_RECEIPT_ID, &tokens)?;
        let receipt = assert_gate_receipt(
            &receipt_path,
            &inputs.manifest_fingerprint,
            &self.required_segments,
        )?;
        if receipt.parameter_hash != inputs.parameter_hash || receipt.seed != inputs.seed {
            return Err(CoreError::precondition(format!(
                "receipt was issued for seed {} and parameter hash {}",
                receipt.seed, receipt.parameter_hash
            ))
            .with_path(&receipt_path));
        }

        let sealed_path = self.resolver.resolve(SEALED_INPUTS_ID, &tokens)?;
        let sealed = SealedInputSet::load(&sealed_path)?;
        let expected = receipt.digests.get(SEALED_INPUTS_DIGEST_KEY).ok_or_else(|| {
            CoreError::schema("receipt does not record the sealed snapshot digest")
                .with_path(&receipt_path)
        })?;
        let actual = sha256_file(&sealed_path)?;
        if &actual != expected || sealed.manifest_fingerprint != inputs.manifest_fingerprint {
            return Err(CoreError::new(
                ErrorCode::SealedDigestMismatch,
                format!("sealed snapshot {} does not match receipt {}", actual, expected),
            )
            .with_path(&sealed_path));
        }
        Ok(sealed)
    }
}

impl Stage for CountryShareStage<'_> {
    type Input = StageInputs;
    type Output = CountryShareOutput;

    fn name(&self) -> &'static str {
        "country_shares"
    }

    fn run(&self, inputs: &StageInputs) -> CoreResult<CountryShareOutput> {
        inputs.validate()?;
        let tokens = inputs.tokens();
        let sealed = self.load_sealed(inputs)?;
        let priors_path = sealed.reverify(&inputs.data_root, &self.segment, &self.priors_id)?;
        let priors = load_priors(&priors_path)?;

        let engine = CounterRngEngine::new(inputs.seed, &inputs.manifest_fingerprint)
            .with_block_budget(self.max_blocks_per_substream);
        let context = RngLogContext {
            seed: inputs.seed,
            parameter_hash: inputs.parameter_hash.clone(),
            manifest_fingerprint: inputs.manifest_fingerprint.clone(),
            run_id: inputs.run_id.clone(),
        };
        let logs_root = self.resolver.resolve(RNG_LOGS_ID, &tokens)?;
        let partition = context.partition_dir(&logs_root)?;
        if let Some(parent) = partition.parent() {
            self.publisher.sweep_orphans(parent)?;
        }
        let staged = self.publisher.stage_dir(&partition)?;
        let mut writer = RngEventWriter::open(staged.path(), context, self.schemas)?;

        let mut rows = Vec::new();
        for merchant in &priors {
            let key = SubstreamKey::new(self.segment.as_str(), SUBSTREAM_LABEL).with(merchant.merchant_id);
            let mut substream = engine.derive_substream(&key);
            let (shares, record) = substream
                .draw_group(|c| c.dirichlet(&merchant.alpha))
                .map_err(|e| e.with_context(format!("merchant {}", merchant.merchant_id)))?;
            let sum: f64 = shares.iter().sum();
            if (sum - 1.0).abs() > SHARE_SUM_TOLERANCE {
                return Err(CoreError::new(
                    ErrorCode::DirichletDegenerate,
                    format!("shares sum to {}", sum),
                )
                .with_subject(merchant.merchant_id.to_string()));
            }
            writer.record(
                &key,
                &record,
                json!({
                    "countries": merchant.countries,
                    "alpha": merchant.alpha,
                    "share_drawn": shares,
                }),
            )?;
            debug!(
                merchant_id = merchant.merchant_id,
                blocks = record.blocks,
                draws = record.draws,
                "drew country shares"
            );
            for ((country, alpha), share) in merchant.countries.iter().zip(&merchant.alpha).zip(shares) {
                rows.push(CountryShareRow {
                    merchant_id: merchant.merchant_id,
                    country_iso: country.clone(),
                    alpha: *alpha,
                    share_drawn: share,
                });
            }
        }
        writer.finish()?;
        let audit = verify_partition(staged.path())?;

        let mut dataset = Vec::new();
        for row in &rows {
            dataset.extend(jsonl_line(row)?);
        }
        let dataset_path = self.resolver.resolve(COUNTRY_SHARES_ID, &tokens)?;
        if let Some(parent) = dataset_path.parent() {
            self.publisher.sweep_orphans(parent)?;
        }
        // Both outputs are keyed differently (the dataset by fingerprint, the
        // logs by run_id), so refuse before either one is published.
        self.publisher.check_bytes(&dataset_path, &dataset)?;
        self.publisher.check_dir(&staged)?;
        let logs_outcome = self.publisher.commit_dir(staged)?;
        let dataset_outcome = self.publisher.publish_bytes(&dataset_path, &dataset)?;

        info!(
            stage = self.name(),
            merchants = priors.len(),
            rows = rows.len(),
            events = audit.events,
            resumed = dataset_outcome.resumed && logs_outcome.resumed,
            "country shares published"
        );
        Ok(CountryShareOutput {
            rows,
            dataset: dataset_outcome,
            logs: logs_outcome,
            audit,
        })
    }
}

/// Parse and check the priors file. Merchants are returned in ascending id order.
pub fn load_priors(path: &Path) -> CoreResult<Vec<MerchantPriors>> {
    let bytes = std::fs::read(path).map_err(|e| CoreError::io(e, path))?;
    let mut priors: Vec<MerchantPriors> =
        serde_json::from_slice(&bytes).map_err(|e| CoreError::from(e).with_path(path))?;
    priors.sort_by_key(|p| p.merchant_id);

    let mut seen = BTreeSet::new();
    for p in &priors {
        let subject = p.merchant_id.to_string();
        if !seen.insert(p.merchant_id) {
            return Err(CoreError::schema("merchant listed twice in priors")
                .with_subject(subject)
                .with_path(path));
        }
        if p.countries.is_empty() || p.countries.len() != p.alpha.len() {
            return Err(CoreError::schema(format!(
                "{} countries but {} alpha values",
                p.countries.len(),
                p.alpha.len()
            ))
            .with_subject(subject)
            .with_path(path));
        }
        let unique: BTreeSet<&str> = p.countries.iter().map(String::as_str).collect();
        if unique.len() != p.countries.len() {
            return Err(CoreError::schema("duplicate country in priors")
                .with_subject(subject)
                .with_path(path));
        }
    }
    Ok(priors)
}
