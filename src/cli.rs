use clap::Parser;
use std::path::PathBuf;

/// Name of the history file kept in the home directory.
const HISTORY_FILE: &str = ".jcsh_history";

#[derive(Parser, Debug)]
#[command(name = "jcsh", version, about = "A job-control shell")]
pub struct Cli {
    /// Do not print a command prompt
    #[arg(short = 'q', short_alias = 'p', long)]
    pub quiet: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Hand the terminal to foreground jobs even when not interactive
    #[arg(short, long)]
    pub monitor: bool,

    /// Run a single command line and exit with its status
    #[arg(short = 'c', value_name = "LINE", conflicts_with = "script")]
    pub command: Option<String>,

    /// History file for interactive sessions [default: ~/.jcsh_history]
    #[arg(long, value_name = "PATH")]
    pub history: Option<PathBuf>,

    /// Read command lines from this file instead of standard input
    pub script: Option<PathBuf>,
}

impl Cli {
    pub fn history_path(&self) -> Option<PathBuf> {
        self.history
            .clone()
            .or_else(|| dirs_next::home_dir().map(|home| home.join(HISTORY_FILE)))
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "warn"
        }
    }
}
