mod builtins;
mod cli;
mod error;
mod exec;
mod jobs;
mod parser;
mod shell;
mod signals;
mod token;
mod utils;

use clap::Parser;
use cli::Cli;
use std::process;

fn main() {
    // Parse command-line arguments.
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.default_log_filter()))
        .format_timestamp(None)
        .init();

    // Run the main shell loop with the options.
    let status = shell::run_shell(&cli);
    process::exit(status);
}
