use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sealgen",
    version,
    about = "Deterministic RNG, sealed inputs, gate receipts and alias blobs for reproducible synthetic data"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Log filter when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// SHA-256 of a file or directory
    Hash(HashArgs),
    /// Seal the configured assets and print the snapshot without publishing
    Seal(SealArgs),
    /// Verify upstream gates, publish sealed inputs and the gate receipt
    Gate(GateArgs),
    /// Draw per-merchant country shares and publish them with their RNG logs
    Shares(SharesArgs),
    /// Alias blob encoding and inspection
    Alias(AliasArgs),
    /// Replay-verify a published RNG log partition
    Audit(AuditArgs),
}

#[derive(Args, Debug)]
pub struct HashArgs {
    pub path: PathBuf,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Engine config (YAML)
    #[arg(long, short = 'c', env = "SEALGEN_CONFIG")]
    pub config: PathBuf,

    /// Override `data_root`
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    /// Override `build_id`
    #[arg(long, env = "SEALGEN_BUILD_ID")]
    pub build_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct SealArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

#[derive(Args, Debug)]
pub struct GateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long)]
    pub seed: u64,

    /// Segment the receipt is issued for
    #[arg(long, default_value = "1A")]
    pub segment: String,
}

#[derive(Args, Debug)]
pub struct SharesArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(long)]
    pub seed: u64,

    #[arg(long)]
    pub fingerprint: String,

    #[arg(long)]
    pub parameter_hash: String,

    #[arg(long)]
    pub run_id: String,

    #[arg(long, default_value = "1A")]
    pub segment: String,

    /// Logical id of the sealed priors
    #[arg(long, default_value = "country_priors")]
    pub priors: String,

    /// Upstream segments that must be PASS in the receipt (repeatable)
    #[arg(long = "require")]
    pub required_segments: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AliasArgs {
    #[command(subcommand)]
    pub cmd: AliasSub,
}

#[derive(Subcommand, Debug)]
pub enum AliasSub {
    /// Encode JSON-lines rows {merchant_id, sub_order, outcome, weight} into a blob
    Encode(AliasEncodeArgs),
    /// Parse a blob, print its header and optionally check an index against it
    Inspect(AliasInspectArgs),
}

#[derive(Args, Debug)]
pub struct AliasEncodeArgs {
    #[arg(long)]
    pub input: PathBuf,

    /// Blob output path
    #[arg(long)]
    pub out: PathBuf,

    /// Index output path (defaults to `<out>.index.json`)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Policy id recorded in the header (repeatable)
    #[arg(long = "policy-id")]
    pub policy_ids: Vec<String>,

    /// Digest bound into the universe hash (repeatable)
    #[arg(long = "constituent")]
    pub constituents: Vec<String>,

    /// Engine config supplying alias layout settings
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AliasInspectArgs {
    pub blob: PathBuf,

    #[arg(long)]
    pub index: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Partition directory (`.../run_id=<id>`)
    pub partition: PathBuf,
}
