mod commands;

use clap::Parser;
use tracing::error;

use h2tun::cli::{Cli, TopCommand};
use h2tun::{config, logging};

fn main() {
    let cli = Cli::parse();
    let config = config::load_config();

    // `up` may run detached from a terminal; honour general.log_file there.
    match (&cli.command, config.general.log_file.as_deref()) {
        (TopCommand::Up { .. }, Some(path)) => {
            if let Err(e) = logging::init_file(path, cli.verbose) {
                eprintln!("failed to open log file {}: {}", path.display(), e);
                logging::init_terminal(cli.verbose);
            }
        }
        _ => logging::init_terminal(cli.verbose),
    }

    if let Err(e) = commands::dispatch(cli.command, &config) {
        error!(error = ?e.to_string(), "command_failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
