use crate::cli::Cli;
use crate::error::ShellError;
use crate::jobs::{self, Flow, JobList};
use crate::parser;
use crate::signals::{self, Terminal};
use crate::token;
use nix::libc;
use nix::unistd::isatty;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;

/// Status reported after Ctrl-C discards the line being edited.
const STATUS_INTERRUPTED: i32 = 130;

/// Process-wide shell state, passed explicitly to everything that runs
/// commands.
#[derive(Debug)]
pub struct ShellContext {
    pub terminal: Terminal,
    pub jobs: JobList,
    /// Cached working directory, refreshed by `cd`.
    pub cwd: PathBuf,
    /// Status of the last foreground pipeline; `&&` and `||` read it.
    pub last_status: i32,
    /// Prints job notices when set.
    pub interactive: bool,
}

impl ShellContext {
    pub fn new(terminal: Terminal, interactive: bool) -> Self {
        ShellContext {
            terminal,
            jobs: JobList::new(),
            cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            last_status: 0,
            interactive,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        ShellContext::new(Terminal::detached(), false)
    }

    /// Parses and runs one line. Everything the line allocated, other than
    /// the processes it left in the background, is released on return.
    pub fn evaluate(&mut self, line: &str) -> Flow {
        signals::clear_interrupt();
        jobs::reap(self);
        log::debug!("received command: {}", line.trim_end());

        let flow = match parser::build(token::tokens(line)) {
            Ok(list) if list.is_empty() => Flow::Continue,
            Ok(list) => jobs::run(list, self),
            Err(e) => {
                let e = ShellError::from(e);
                eprintln!("jcsh: {}", e);
                self.last_status = e.status();
                Flow::Continue
            }
        };

        jobs::reap(self);
        flow
    }

    pub fn prompt(&self) -> String {
        format!("jcsh[{}]:{}:$ ", process::id(), self.cwd.display())
    }
}

/// Runs the shell as configured by `cli` and returns its exit status.
///
/// Lines come from `-c`, a script file, an interactive editor when stdin is
/// a terminal, or plain standard input otherwise.
pub fn run_shell(cli: &Cli) -> i32 {
    let mut ctx = start(cli);
    let status = read_input(cli, &mut ctx);
    if !ctx.jobs.is_empty() {
        log::info!("exiting with {} background job(s) still running", ctx.jobs.len());
    }
    status
}

fn start(cli: &Cli) -> ShellContext {
    let stdin_tty = isatty(libc::STDIN_FILENO).unwrap_or(false);
    let interactive = cli.command.is_none() && cli.script.is_none() && stdin_tty;
    let terminal = if interactive || cli.monitor {
        Terminal::open()
    } else {
        Terminal::detached()
    };
    let mut ctx = ShellContext::new(terminal, interactive);
    signals::init(&mut ctx.terminal, interactive);
    log::debug!(
        "shell pid {} in process group {}",
        process::id(),
        ctx.terminal.shell_pgid()
    );
    ctx
}

fn read_input(cli: &Cli, ctx: &mut ShellContext) -> i32 {
    if let Some(line) = &cli.command {
        return match ctx.evaluate(line) {
            Flow::Exit(code) => code,
            Flow::Continue => ctx.last_status,
        };
    }
    if let Some(path) = &cli.script {
        return match File::open(path) {
            Ok(file) => read_lines(BufReader::new(file), ctx, true),
            Err(e) => {
                eprintln!("jcsh: {}: {}", path.display(), e);
                1
            }
        };
    }
    if ctx.interactive {
        let history = cli.history_path();
        match edit_lines(ctx, cli.quiet, history.as_deref()) {
            Ok(code) => return code,
            Err(e) => log::warn!("line editor unavailable, reading plain input: {}", e),
        }
    }
    read_lines(io::stdin().lock(), ctx, cli.quiet)
}

/// Reads and evaluates lines until end of input. A last line without a
/// trailing newline is still evaluated.
fn read_lines<R: BufRead>(mut reader: R, ctx: &mut ShellContext, quiet: bool) -> i32 {
    let mut line = String::new();
    loop {
        if !quiet {
            print!("{}", ctx.prompt());
            let _ = io::stdout().flush();
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return ctx.last_status,
            Ok(_) => {
                if let Flow::Exit(code) = ctx.evaluate(&line) {
                    return code;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("jcsh: error reading input: {}", e);
                return 1;
            }
        }
    }
}

/// Interactive loop on top of rustyline, with history.
fn edit_lines(ctx: &mut ShellContext, quiet: bool, history: Option<&Path>) -> rustyline::Result<i32> {
    let mut rl = DefaultEditor::new()?;
    if let Some(path) = history {
        if let Err(e) = rl.load_history(path) {
            log::debug!("no history loaded from {}: {}", path.display(), e);
        }
    }

    let status = loop {
        let prompt = if quiet { String::new() } else { ctx.prompt() };
        match rl.readline(&prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = rl.add_history_entry(line.as_str());
                }
                if let Flow::Exit(code) = ctx.evaluate(&line) {
                    break code;
                }
            }
            Err(ReadlineError::Interrupted) => ctx.last_status = STATUS_INTERRUPTED,
            Err(ReadlineError::Eof) => break ctx.last_status,
            Err(e) => {
                eprintln!("jcsh: error reading input: {}", e);
                break 1;
            }
        }
    };

    if let Some(path) = history {
        if let Err(e) = rl.save_history(path) {
            log::warn!("cannot save history to {}: {}", path.display(), e);
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_shows_pid_and_cwd() {
        let ctx = ShellContext::for_tests();
        let prompt = ctx.prompt();
        assert!(prompt.starts_with(&format!("jcsh[{}]:", process::id())));
        assert!(prompt.ends_with(":$ "));
    }

    #[test]
    fn test_syntax_error_sets_status() {
        let mut ctx = ShellContext::for_tests();
        assert_eq!(ctx.evaluate("echo a &&\n"), Flow::Continue);
        assert_eq!(ctx.last_status, 2);
    }

    #[test]
    fn test_blank_line_keeps_status() {
        let mut ctx = ShellContext::for_tests();
        ctx.last_status = 7;
        assert_eq!(ctx.evaluate("   \n"), Flow::Continue);
        assert_eq!(ctx.last_status, 7);
    }

    #[test]
    fn test_exit_stops_the_line() {
        let mut ctx = ShellContext::for_tests();
        assert_eq!(ctx.evaluate("exit 4 ; exit 5\n"), Flow::Exit(4));
    }

    #[test]
    fn test_read_lines_returns_last_status() {
        let mut ctx = ShellContext::for_tests();
        let input = io::Cursor::new("exit 3\n");
        assert_eq!(read_lines(input, &mut ctx, true), 3);
        let mut ctx = ShellContext::for_tests();
        let input = io::Cursor::new("");
        assert_eq!(read_lines(input, &mut ctx, true), 0);
    }
}
