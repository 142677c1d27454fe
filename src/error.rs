use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status of a child whose program could not be found.
pub const STATUS_NOT_FOUND: i32 = 127;
/// Exit status of a child whose program was found but could not be run.
pub const STATUS_NOT_EXECUTABLE: i32 = 126;
/// Generic failure: redirection, built-in or process start failures.
pub const STATUS_FAILURE: i32 = 1;
/// Status recorded for a line that failed to parse.
pub const STATUS_SYNTAX: i32 = 2;

/// Errors found while building a command list. The line is not executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing file name after `{0}`")]
    MissingRedirectTarget(String),
    #[error("unexpected `{0}`")]
    DanglingOperator(String),
    #[error("`{0}` is not supported")]
    Unsupported(String),
}

/// Errors surfaced to the shell process itself. None of them is fatal.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("syntax error: {0}")]
    Parse(#[from] ParseError),
    #[error("{command}: cannot start process: {source}")]
    ProcessStart {
        command: String,
        #[source]
        source: nix::Error,
    },
    #[error("{0}: argument contains a NUL byte")]
    NulArgument(String),
    #[error("cd: {}: {}", path.display(), source)]
    ChangeDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Builtin(String),
    #[error("terminal control: {0}")]
    Terminal(#[source] nix::Error),
}

impl ShellError {
    /// The exit status a command ends with when it fails with this error.
    pub fn status(&self) -> i32 {
        match self {
            ShellError::Parse(_) => STATUS_SYNTAX,
            _ => STATUS_FAILURE,
        }
    }
}

/// Errors raised while giving a stage its descriptors and program. In a
/// forked child they are reported on its stderr and become its exit status;
/// for a built-in run by the shell they become the command's status.
#[derive(Debug, Error)]
pub enum ChildError {
    #[error("{0}: command not found")]
    NotFound(String),
    #[error("{program}: {source}")]
    NotExecutable {
        program: String,
        #[source]
        source: nix::Error,
    },
    #[error("{path}: {source}")]
    Redirect {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("{step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: nix::Error,
    },
}

impl ChildError {
    /// Status the child exits with.
    pub fn status(&self) -> i32 {
        match self {
            ChildError::NotFound(_) => STATUS_NOT_FOUND,
            ChildError::NotExecutable { .. } => STATUS_NOT_EXECUTABLE,
            ChildError::Redirect { .. } | ChildError::Setup { .. } => STATUS_FAILURE,
        }
    }
}
