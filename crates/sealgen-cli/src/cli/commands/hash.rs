use super::print_json;
use crate::cli::args::HashArgs;
use crate::exit_codes::SUCCESS;
use sealgen_core::ArtifactDigest;

pub fn run(args: HashArgs) -> anyhow::Result<i32> {
    let logical_id = args
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let digest = ArtifactDigest::compute(logical_id, args.path)?;
    if args.json {
        print_json(&digest)?;
    } else {
        println!(
            "{}  {:>12}  {}",
            digest.sha256_hex,
            digest.size_bytes,
            digest.path.display()
        );
    }
    Ok(SUCCESS)
}
