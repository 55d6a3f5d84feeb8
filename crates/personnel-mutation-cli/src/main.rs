use std::process::ExitCode;

use clap::Parser;
use personnel_mutation_cli::{error_envelope, exit_code, init_tracing, run_cli, Cli};

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = error_envelope(&err);
            match serde_json::to_string_pretty(&envelope) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("{}: {}", envelope.code, envelope.message),
            }
            ExitCode::from(exit_code(envelope.class))
        }
    }
}
