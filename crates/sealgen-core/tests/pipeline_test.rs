//! End-to-end: gate, then country shares, then replay.
//!
//! Runs both stages against a temporary data root, checks that reruns are
//! byte-identical and resume, and that a broken upstream gate stops the run
//! before anything is published.

use sealgen_core::events::{read_jsonl, RngEvent};
use sealgen_core::resolve::{COUNTRY_SHARES_ID, GATE_RECEIPT_ID, SEALED_INPUTS_ID};
use sealgen_core::stages::{CountryShareRow, CountryShareStage, S0GateStage, S0Inputs, S0Output};
use sealgen_core::{
    verify_partition, AssetKind, AssetRequest, ErrorCode, PathResolver, PathTokens,
    SchemaRegistry, Stage, StageInputs, TemplateResolver, ValidationBundleWriter,
};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

const SEED: u64 = 42;
const RUN_ID: &str = "run-0001";

const PRIORS: &str = r#"[
  {"merchant_id": 1, "countries": ["GB", "US"], "alpha": [2.0, 3.0]},
  {"merchant_id": 7, "countries": ["DE", "FR", "NL"], "alpha": [0.5, 1.0, 1.5]}
]"#;

fn write(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// Data root with two parameter files and a passing 1B bundle.
fn setup() -> (TempDir, TemplateResolver) {
    let root = TempDir::new().unwrap();
    write(root.path(), "params/country_priors.json", PRIORS.as_bytes());
    write(
        root.path(),
        "params/hurdle_coefficients.yaml",
        b"beta: [0.1, -0.4, 2.0]\n",
    );
    ValidationBundleWriter::new()
        .add("report", "report.json", b"{\"status\":\"ok\"}".to_vec())
        .write(&root.path().join("validation/1B"))
        .unwrap();

    let resolver = TemplateResolver::new(root.path())
        .with_templates([
            (
                "country_priors".to_string(),
                "params/country_priors.json".to_string(),
            ),
            (
                "hurdle_coefficients".to_string(),
                "params/hurdle_coefficients.yaml".to_string(),
            ),
        ])
        .unwrap();
    (root, resolver)
}

fn assets() -> Vec<AssetRequest> {
    ["country_priors", "hurdle_coefficients"]
        .into_iter()
        .map(|id| AssetRequest {
            owner: "1A".to_string(),
            kind: AssetKind::Parameter,
            logical_id: id.to_string(),
        })
        .collect()
}

fn upstream() -> BTreeMap<String, String> {
    [("1B".to_string(), "validation/1B".to_string())]
        .into_iter()
        .collect()
}

fn run_gate(resolver: &TemplateResolver, schemas: &SchemaRegistry) -> S0Output {
    S0GateStage::new("1A", " Git-4F2A9C1 ", resolver, schemas)
        .with_assets(assets())
        .with_upstream(upstream())
        .run(&S0Inputs { seed: SEED })
        .unwrap()
}

fn stage_inputs(root: &Path, gate: &S0Output) -> StageInputs {
    StageInputs {
        seed: SEED,
        manifest_fingerprint: gate.sealed.manifest_fingerprint.clone(),
        parameter_hash: gate.sealed.parameter_hash.clone(),
        run_id: RUN_ID.to_string(),
        data_root: root.to_path_buf(),
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_gate_then_shares() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();

    let gate = run_gate(&resolver, &schemas);
    assert!(!gate.sealed_inputs.resumed);
    assert_eq!(gate.sealed.build_id, "git-4f2a9c1");
    assert_eq!(gate.receipt.upstream_gates["1B"].bundle_path, "validation/1B");
    assert_eq!(gate.sealed.entries.len(), 2);

    let stage = CountryShareStage::new("1A", &resolver, &schemas)
        .with_required_segments(vec!["1B".to_string()]);
    let out = stage.run(&stage_inputs(root.path(), &gate)).unwrap();

    assert_eq!(out.rows.len(), 5);
    for merchant in [1_u64, 7] {
        let rows: Vec<&CountryShareRow> =
            out.rows.iter().filter(|r| r.merchant_id == merchant).collect();
        let sum: f64 = rows.iter().map(|r| r.share_drawn).sum();
        assert!((sum - 1.0).abs() < 1e-9, "merchant {} sums to {}", merchant, sum);
        assert!(rows.iter().all(|r| r.share_drawn > 0.0));
    }
    let m1: Vec<&str> = out
        .rows
        .iter()
        .filter(|r| r.merchant_id == 1)
        .map(|r| r.country_iso.as_str())
        .collect();
    assert_eq!(m1, ["GB", "US"]);

    // One event per merchant on a single label.
    assert_eq!(out.audit.events, 2);
    let totals = &out.audit.pairs["1A/dirichlet_gamma_vector"];
    assert_eq!(totals.events_total, 2);

    // Published dataset matches the returned rows.
    let published: Vec<CountryShareRow> = read_jsonl(&out.dataset.path).unwrap();
    assert_eq!(published.len(), out.rows.len());
    for (p, r) in published.iter().zip(&out.rows) {
        assert_eq!((p.merchant_id, &p.country_iso), (r.merchant_id, &r.country_iso));
        assert!((p.share_drawn - r.share_drawn).abs() < 1e-15);
    }

    // Published log partition replays clean and its blocks add up.
    let report = verify_partition(&out.logs.path).unwrap();
    assert_eq!(report, out.audit);
    let events: Vec<RngEvent> = read_jsonl(
        &out.logs
            .path
            .join("events/substream_label=dirichlet_gamma_vector/part-00000.jsonl"),
    )
    .unwrap();
    let blocks: u64 = events.iter().map(|e| e.blocks).sum();
    assert_eq!(blocks, totals.blocks_total);
    for e in &events {
        assert_eq!(
            e.before().blocks_until(e.after()),
            Some(u128::from(e.blocks))
        );
    }
}

#[test]
fn test_rerun_is_byte_identical_and_resumes() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();

    let first_gate = run_gate(&resolver, &schemas);
    let stage = CountryShareStage::new("1A", &resolver, &schemas);
    let first = stage.run(&stage_inputs(root.path(), &first_gate)).unwrap();
    let dataset_bytes = std::fs::read(&first.dataset.path).unwrap();

    let second_gate = run_gate(&resolver, &schemas);
    assert!(second_gate.sealed_inputs.resumed);
    assert!(second_gate.receipt_file.resumed);
    assert_eq!(
        second_gate.receipt_file.sha256_hex,
        first_gate.receipt_file.sha256_hex
    );

    let second = stage.run(&stage_inputs(root.path(), &second_gate)).unwrap();
    assert!(second.dataset.resumed);
    assert!(second.logs.resumed);
    assert_eq!(second.dataset.sha256_hex, first.dataset.sha256_hex);
    assert_eq!(second.logs.sha256_hex, first.logs.sha256_hex);
    assert_eq!(std::fs::read(&second.dataset.path).unwrap(), dataset_bytes);
}

#[test]
fn test_different_seed_same_fingerprint_conflicts_on_receipt() {
    let (_root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    run_gate(&resolver, &schemas);

    let err = S0GateStage::new("1A", "git-4f2a9c1", &resolver, &schemas)
        .with_assets(assets())
        .with_upstream(upstream())
        .run(&S0Inputs { seed: SEED + 1 })
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);
}

#[test]
fn test_new_build_reusing_run_id_publishes_nothing() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    let stage = CountryShareStage::new("1A", &resolver, &schemas);
    let first_gate = run_gate(&resolver, &schemas);
    let first = stage.run(&stage_inputs(root.path(), &first_gate)).unwrap();

    // Same seed and parameters, new build id: new fingerprint, same log partition.
    let other = S0GateStage::new("1A", "git-other", &resolver, &schemas)
        .with_assets(assets())
        .with_upstream(upstream())
        .run(&S0Inputs { seed: SEED })
        .unwrap();
    assert_eq!(other.sealed.parameter_hash, first_gate.sealed.parameter_hash);
    assert_ne!(
        other.sealed.manifest_fingerprint,
        first_gate.sealed.manifest_fingerprint
    );
    let inputs = stage_inputs(root.path(), &other);

    let err = stage.run(&inputs).unwrap_err();
    assert_eq!(err.code, ErrorCode::PartitionExistsNonidentical);

    let tokens = PathTokens {
        seed: Some(SEED),
        parameter_hash: Some(inputs.parameter_hash.clone()),
        manifest_fingerprint: Some(inputs.manifest_fingerprint.clone()),
        run_id: None,
    };
    let other_dataset = resolver.resolve(COUNTRY_SHARES_ID, &tokens).unwrap();
    assert_ne!(other_dataset, first.dataset.path);
    assert!(!other_dataset.exists());
    assert!(!other_dataset.parent().unwrap().exists());
    assert_eq!(verify_partition(&first.logs.path).unwrap(), first.audit);
}

// ============================================================================
// Failure paths
// ============================================================================

#[test]
fn test_tampered_upstream_flag_blocks_publication() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    std::fs::write(
        root.path().join("validation/1B/_passed.flag"),
        format!("sha256_hex = {}\n", "0".repeat(64)),
    )
    .unwrap();

    let err = S0GateStage::new("1A", "git-4f2a9c1", &resolver, &schemas)
        .with_assets(assets())
        .with_upstream(upstream())
        .run(&S0Inputs { seed: SEED })
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::FlagHashMismatch);
    assert_eq!(err.subject.as_deref(), Some("1B"));

    assert!(!root.path().join("sealed_inputs").exists());
    assert!(!root.path().join("receipts").exists());
}

#[test]
fn test_shares_without_receipt_is_precondition() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    let gate = run_gate(&resolver, &schemas);
    let tokens = PathTokens {
        seed: Some(SEED),
        parameter_hash: Some(gate.sealed.parameter_hash.clone()),
        manifest_fingerprint: Some(gate.sealed.manifest_fingerprint.clone()),
        run_id: None,
    };
    std::fs::remove_file(resolver.resolve(GATE_RECEIPT_ID, &tokens).unwrap()).unwrap();

    let err = CountryShareStage::new("1A", &resolver, &schemas)
        .run(&stage_inputs(root.path(), &gate))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::S0Precondition);
    assert!(!root.path().join("data").exists());
    assert!(resolver.resolve(SEALED_INPUTS_ID, &tokens).unwrap().exists());
}

#[test]
fn test_priors_changed_after_sealing_is_detected() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    let gate = run_gate(&resolver, &schemas);
    write(
        root.path(),
        "params/country_priors.json",
        br#"[{"merchant_id": 1, "countries": ["GB"], "alpha": [1.0]}]"#,
    );

    let err = CountryShareStage::new("1A", &resolver, &schemas)
        .run(&stage_inputs(root.path(), &gate))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SealedDigestMismatch);
    assert!(!root.path().join("data").exists());
    assert!(!root.path().join("logs").exists());
}

#[test]
fn test_required_segment_missing_from_receipt() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    let gate = run_gate(&resolver, &schemas);

    let err = CountryShareStage::new("1A", &resolver, &schemas)
        .with_required_segments(vec!["2A".to_string()])
        .run(&stage_inputs(root.path(), &gate))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UpstreamGate);
    assert_eq!(err.subject.as_deref(), Some("2A"));
}

#[test]
fn test_block_budget_aborts_without_publishing() {
    let (root, resolver) = setup();
    let schemas = SchemaRegistry::builtin().unwrap();
    let gate = run_gate(&resolver, &schemas);

    let err = CountryShareStage::new("1A", &resolver, &schemas)
        .with_block_budget(Some(1))
        .run(&stage_inputs(root.path(), &gate))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RngBudget);
    assert!(!root.path().join("data").exists());
}
