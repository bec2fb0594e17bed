// Entrypoint for the CLI.
// - Parses `<command> [job] [json-parameters]` from argv.
// - Converts Ctrl-C into a clean exit status 1 instead of a crash.
// - Keeps `main` small: load config, build the client, dispatch.

use std::process::ExitCode;

use jenq::api::ApiClient;
use jenq::commands::{self, Command, Request, Runner};
use jenq::config::Config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // An interrupt during a wait or a retry is a user decision, not a
    // fault; report it and leave with status 1.
    if let Err(e) = ctrlc::set_handler(|| {
        eprintln!();
        eprintln!("Interrupted.");
        std::process::exit(1);
    }) {
        eprintln!("warning: could not install interrupt handler: {e}");
    }

    let request = match Request::from_args(std::env::args().skip(1)) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(1);
        }
    };

    // Help needs neither credentials nor a server.
    if request.command == Command::Help {
        commands::print_help();
        return ExitCode::SUCCESS;
    }

    let outcome = Config::from_env()
        .and_then(|config| ApiClient::new(&config))
        .and_then(|api| Runner::new(api).dispatch(&request));
    match outcome {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
