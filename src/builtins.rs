use crate::error::{ShellError, STATUS_FAILURE};
use crate::shell::ShellContext;
use std::env;
use std::path::PathBuf;

/// Result of running a built-in command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command finished with this status; the shell keeps going.
    Status(i32),
    /// The shell must terminate with this status.
    Exit(i32),
}

/// Returns true if `name` is a command that runs inside the shell process.
/// Supported built-ins are "cd" and "exit".
pub fn is_builtin(name: &str) -> bool {
    matches!(name, "cd" | "exit")
}

/// Runs the built-in named by `argv[0]`. Errors are reported here and turned
/// into a failure status.
pub fn run_builtin(argv: &[String], ctx: &mut ShellContext) -> Outcome {
    let result = match argv.first().map(String::as_str) {
        Some("cd") => change_dir(argv.get(1).map(String::as_str), ctx).map(Outcome::Status),
        Some("exit") => exit_status(argv.get(1).map(String::as_str)).map(Outcome::Exit),
        _ => Err(ShellError::Builtin(format!(
            "{}: not a built-in",
            argv.first().map(String::as_str).unwrap_or("")
        ))),
    };
    result.unwrap_or_else(|e| {
        eprintln!("jcsh: {}", e);
        Outcome::Status(STATUS_FAILURE)
    })
}

/// Changes the working directory, to the home directory when no path is
/// given, and refreshes the cached cwd.
fn change_dir(path: Option<&str>, ctx: &mut ShellContext) -> Result<i32, ShellError> {
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/")),
    };
    env::set_current_dir(&path).map_err(|source| ShellError::ChangeDir {
        path: path.clone(),
        source,
    })?;
    ctx.cwd = env::current_dir().unwrap_or(path);
    log::debug!("cwd is now {}", ctx.cwd.display());
    Ok(0)
}

fn exit_status(arg: Option<&str>) -> Result<i32, ShellError> {
    match arg {
        None => Ok(0),
        Some(s) => s
            .parse::<i32>()
            .map_err(|_| ShellError::Builtin(format!("exit: {}: numeric argument required", s))),
    }
}
