use super::print_json;
use crate::cli::args::{AliasArgs, AliasEncodeArgs, AliasInspectArgs, AliasSub};
use crate::exit_codes::SUCCESS;
use anyhow::Context;
use sealgen_core::alias::AliasIndex;
use sealgen_core::canonical::to_pretty_ascii;
use sealgen_core::config::AliasConfig;
use sealgen_core::events::read_jsonl;
use sealgen_core::{
    AliasBlob, AliasBlobEncoder, AliasRow, ArtifactKind, AtomicPublisher, EngineConfig,
    SchemaRegistry,
};
use serde_json::json;
use std::path::PathBuf;

pub fn run(args: AliasArgs) -> anyhow::Result<i32> {
    match args.cmd {
        AliasSub::Encode(a) => encode(a),
        AliasSub::Inspect(a) => inspect(a),
    }
}

fn encode(args: AliasEncodeArgs) -> anyhow::Result<i32> {
    let alias_config = match &args.config {
        Some(path) => EngineConfig::load(path)?.alias,
        None => AliasConfig::default(),
    };
    let schemas = SchemaRegistry::builtin()?;
    let rows: Vec<AliasRow> = read_jsonl(&args.input)?;
    let encoded = AliasBlobEncoder::new(&alias_config).encode(
        &rows,
        &args.policy_ids,
        &args.constituents,
        &schemas,
    )?;

    let index_path = args.index.unwrap_or_else(|| {
        let mut name = args.out.clone().into_os_string();
        name.push(".index.json");
        PathBuf::from(name)
    });
    let index_bytes = to_pretty_ascii(&encoded.index)?;
    let publisher = AtomicPublisher::new();
    // A conflict on either path leaves both untouched.
    publisher.check_bytes(&args.out, &encoded.blob)?;
    publisher.check_bytes(&index_path, &index_bytes)?;
    let blob = publisher.publish_bytes(&args.out, &encoded.blob)?;
    let index = publisher.publish_bytes(&index_path, &index_bytes)?;

    print_json(&json!({
        "blob": {"path": blob.path, "bytes": blob.bytes, "sha256_hex": blob.sha256_hex, "resumed": blob.resumed},
        "index": {"path": index.path, "sha256_hex": index.sha256_hex, "resumed": index.resumed},
        "entity_count": encoded.header.entity_count,
        "universe_hash": encoded.header.universe_hash,
    }))?;
    Ok(SUCCESS)
}

fn inspect(args: AliasInspectArgs) -> anyhow::Result<i32> {
    let bytes = std::fs::read(&args.blob)
        .with_context(|| format!("failed to read {}", args.blob.display()))?;
    let blob = AliasBlob::parse(&bytes)?;
    if let Some(index_path) = &args.index {
        let raw = std::fs::read(index_path)
            .with_context(|| format!("failed to read {}", index_path.display()))?;
        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        SchemaRegistry::builtin()?.validate_value(ArtifactKind::AliasIndex, &value)?;
        let index: AliasIndex = serde_json::from_value(value)?;
        blob.verify_index(&index)?;
    }
    print_json(&json!({
        "header_length": blob.header_length(),
        "header": blob.header(),
        "index_verified": args.index.is_some(),
    }))?;
    Ok(SUCCESS)
}
