use clap::Parser;

mod cli;
pub mod exit_codes;

use cli::args::Cli;
use cli::commands::dispatch;
use sealgen_core::CoreError;

fn main() {
    let cli = Cli::parse();
    cli::logging::init(&cli.global);
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<CoreError>() {
                Some(core) => core.exit_code(),
                None => exit_codes::CONFIG_ERROR,
            }
        }
    };
    std::process::exit(code);
}
