use super::{load_config, print_json};
use crate::cli::args::SharesArgs;
use crate::exit_codes::SUCCESS;
use sealgen_core::stage::{Stage, StageInputs};
use sealgen_core::stages::CountryShareStage;
use sealgen_core::{ManifestFingerprint, ParameterHash, SchemaRegistry};
use serde_json::json;

pub fn run(args: SharesArgs) -> anyhow::Result<i32> {
    let config = load_config(&args.config)?;
    let resolver = config.resolver()?;
    let schemas = SchemaRegistry::builtin()?;
    let inputs = StageInputs {
        seed: args.seed,
        manifest_fingerprint: ManifestFingerprint::parse(&args.fingerprint)?,
        parameter_hash: ParameterHash::parse(&args.parameter_hash)?,
        run_id: args.run_id,
        data_root: config.data_root.clone(),
    };
    let stage = CountryShareStage::new(args.segment, &resolver, &schemas)
        .with_priors_id(args.priors)
        .with_required_segments(args.required_segments)
        .with_block_budget(config.rng.max_blocks_per_substream);
    let out = stage.run(&inputs)?;

    print_json(&json!({
        "rows": out.rows.len(),
        "dataset": {
            "path": out.dataset.path,
            "sha256_hex": out.dataset.sha256_hex,
            "resumed": out.dataset.resumed,
        },
        "rng_logs": {
            "path": out.logs.path,
            "sha256_hex": out.logs.sha256_hex,
            "resumed": out.logs.resumed,
        },
        "audit": out.audit,
    }))?;
    Ok(SUCCESS)
}
