use clap::Parser;

use shuttle::cli::{Cli, Output};
use shuttle::error::{ShuttleError, exit_code};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.run() {
        Output::new().error(&format!("{e:#}"));
        let code = e
            .downcast_ref::<ShuttleError>()
            .map(ShuttleError::exit_code)
            .unwrap_or(exit_code::FATAL);
        std::process::exit(code);
    }
}
