use super::print_json;
use crate::cli::args::AuditArgs;
use crate::exit_codes::{CHECK_FAILED, SUCCESS};
use sealgen_core::{verify_partition, ErrorClass};

pub fn run(args: AuditArgs) -> anyhow::Result<i32> {
    match verify_partition(&args.partition) {
        Ok(report) => {
            print_json(&report)?;
            Ok(SUCCESS)
        }
        // Accounting disagreements are a verdict, not a crash.
        Err(e) if e.class() == ErrorClass::RngInvariant => {
            eprintln!("audit failed: {}", e);
            Ok(CHECK_FAILED)
        }
        Err(e) => Err(e.into()),
    }
}
