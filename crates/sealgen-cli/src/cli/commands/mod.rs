mod alias;
mod audit;
mod gate;
mod hash;
mod shares;

use super::args::{Cli, Command, ConfigArgs};
use anyhow::Context;
use sealgen_core::canonical::to_pretty_ascii;
use sealgen_core::{EngineConfig, EngineConfigOverrides};
use serde::Serialize;
use std::io::Write;

pub fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Hash(args) => hash::run(args),
        Command::Seal(args) => gate::run_seal(args),
        Command::Gate(args) => gate::run_gate(args),
        Command::Shares(args) => shares::run(args),
        Command::Alias(args) => alias::run(args),
        Command::Audit(args) => audit::run(args),
    }
}

pub(crate) fn load_config(args: &ConfigArgs) -> anyhow::Result<EngineConfig> {
    let config = EngineConfig::load(&args.config)?.apply(EngineConfigOverrides {
        data_root: args.data_root.clone(),
        build_id: args.build_id.clone(),
        ..Default::default()
    });
    config.validate()?;
    Ok(config)
}

/// Write a value to stdout as sorted-key ASCII JSON.
pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let bytes = to_pretty_ascii(value)?;
    std::io::stdout()
        .lock()
        .write_all(&bytes)
        .context("failed to write to stdout")
}
