use super::{load_config, print_json};
use crate::cli::args::{GateArgs, SealArgs};
use crate::exit_codes::SUCCESS;
use sealgen_core::stage::Stage;
use sealgen_core::stages::{S0GateStage, S0Inputs};
use sealgen_core::{PathTokens, SchemaRegistry, SealedInputSet};
use serde_json::json;

pub fn run_seal(args: SealArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.config)?;
    let resolver = config.resolver()?;
    let tokens = PathTokens {
        seed: Some(args.seed),
        ..PathTokens::default()
    };
    let sealed = SealedInputSet::seal(&config.assets, &resolver, &tokens, &config.build_id)?;
    print_json(&sealed)?;
    Ok(SUCCESS)
}

pub fn run_gate(args: GateArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.config)?;
    let resolver = config.resolver()?;
    let schemas = SchemaRegistry::builtin()?;
    let stage = S0GateStage::new(args.segment, config.build_id.clone(), &resolver, &schemas)
        .with_assets(config.assets.clone())
        .with_upstream(config.upstream_segments.clone());
    let out = stage.run(&S0Inputs { seed: args.seed })?;

    print_json(&json!({
        "manifest_fingerprint": out.sealed.manifest_fingerprint,
        "parameter_hash": out.sealed.parameter_hash,
        "sealed_inputs": {
            "path": out.sealed_inputs.path,
            "sha256_hex": out.sealed_inputs.sha256_hex,
            "resumed": out.sealed_inputs.resumed,
        },
        "receipt": {
            "path": out.receipt_file.path,
            "sha256_hex": out.receipt_file.sha256_hex,
            "resumed": out.receipt_file.resumed,
        },
        "upstream_gates": out.receipt.upstream_gates,
    }))?;
    Ok(SUCCESS)
}
