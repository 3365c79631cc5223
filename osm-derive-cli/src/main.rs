//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use osm_derive_cli::CliError;

fn main() {
    match osm_derive_cli::run() {
        Ok(()) => {}
        Err(CliError::ArgumentParsing(err)) => err.exit(),
        Err(err) => {
            eprintln!("osm-derive: {err}");
            std::process::exit(1);
        }
    }
}
