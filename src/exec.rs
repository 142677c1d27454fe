use crate::builtins::{is_builtin, run_builtin, Outcome};
use crate::error::{ChildError, ShellError};
use crate::parser::{Mode as OpenMode, PipeRole, Pipeline, Stage, Stream};
use crate::shell::ShellContext;
use crate::signals;
use crate::utils::{cstrings, syscall, write_stderr};
use nix::errno::Errno;
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, execvp, fork, pipe, setpgid, ForkResult, Pid};
use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::io::RawFd;

/// What starting a pipeline produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    /// Every stage was forked into this process group; nothing was waited on.
    Group(Pid),
    /// A built-in ran inside the shell and already finished.
    Finished(Outcome),
}

/// A redirection resolved to the descriptor it replaces and the open flags,
/// with its path already converted for the child.
#[derive(Debug)]
struct OpenSpec {
    fd: RawFd,
    flags: OFlag,
    path: CString,
    display: String,
}

/// Everything a stage needs after the fork, computed before it.
#[derive(Debug)]
struct Prepared {
    argv: Vec<CString>,
    redirections: Vec<OpenSpec>,
    builtin: bool,
}

impl Prepared {
    fn new(stage: &Stage) -> Result<Self, ShellError> {
        let redirections = stage
            .redirections
            .iter()
            .map(|r| {
                let fd = match r.stream {
                    Stream::Stdin => libc::STDIN_FILENO,
                    Stream::Stdout => libc::STDOUT_FILENO,
                    Stream::Stderr => libc::STDERR_FILENO,
                };
                let flags = match r.mode {
                    OpenMode::Read => OFlag::O_RDONLY,
                    OpenMode::Truncate => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                    OpenMode::Append => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
                };
                let path = CString::new(r.target.as_bytes())
                    .map_err(|_| ShellError::NulArgument(r.target.clone()))?;
                Ok(OpenSpec {
                    fd,
                    flags,
                    path,
                    display: r.target.clone(),
                })
            })
            .collect::<Result<Vec<_>, ShellError>>()?;
        Ok(Prepared {
            argv: cstrings(&stage.argv)?,
            redirections,
            builtin: stage.program().map_or(false, is_builtin),
        })
    }
}

/// The N-1 pipes of an N-stage pipeline. Pipe `i` connects stage `i` to
/// stage `i + 1`. Whatever is still open is closed on drop.
struct Pipes {
    fds: Vec<(RawFd, RawFd)>,
}

impl Pipes {
    fn new(count: usize) -> nix::Result<Self> {
        let mut pipes = Pipes {
            fds: Vec::with_capacity(count),
        };
        for _ in 0..count {
            pipes.fds.push(syscall(pipe)?);
        }
        Ok(pipes)
    }

    fn read_end(&self, i: usize) -> Option<RawFd> {
        self.fds.get(i).map(|p| p.0)
    }

    fn write_end(&self, i: usize) -> Option<RawFd> {
        self.fds.get(i).map(|p| p.1)
    }

    fn close_all(&mut self) {
        for (r, w) in self.fds.drain(..) {
            let _ = close(r);
            let _ = close(w);
        }
    }
}

impl Drop for Pipes {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Lowest descriptor used for the shell's saved copies, above anything a
/// redirection can target.
const FIRST_SAVED_FD: RawFd = 10;

/// The shell's own descriptors replaced while an in-shell built-in runs with
/// redirections. Restored in reverse order on drop.
#[derive(Default)]
struct SavedFds {
    saved: Vec<(RawFd, Option<RawFd>)>,
}

impl SavedFds {
    fn redirect(&mut self, spec: &OpenSpec) -> Result<(), ChildError> {
        // EBADF: the target was closed, and is closed again on restore.
        let copy = fcntl(spec.fd, FcntlArg::F_DUPFD_CLOEXEC(FIRST_SAVED_FD)).ok();
        self.saved.push((spec.fd, copy));

        let fd = syscall(|| open(spec.path.as_c_str(), spec.flags, Mode::from_bits_truncate(0o666)))
            .map_err(|source| ChildError::Redirect {
                path: spec.display.clone(),
                source,
            })?;
        if fd != spec.fd {
            let moved = syscall(|| dup2(fd, spec.fd));
            let _ = close(fd);
            moved.map_err(|source| ChildError::Setup { step: "dup2", source })?;
        }
        Ok(())
    }
}

impl Drop for SavedFds {
    fn drop(&mut self) {
        let _ = io::stdout().flush();
        for (fd, copy) in self.saved.drain(..).rev() {
            match copy {
                Some(copy) => {
                    if let Err(e) = syscall(|| dup2(copy, fd)) {
                        log::warn!("cannot restore descriptor {}: {}", fd, e);
                    }
                    let _ = close(copy);
                }
                None => {
                    let _ = close(fd);
                }
            }
        }
    }
}

/// Runs a lone built-in in the shell process with its redirections applied
/// to the shell's own descriptors for the duration of the call. A
/// redirection that cannot be opened fails the command before it runs.
fn run_builtin_in_shell(stage: &Stage, ctx: &mut ShellContext) -> Result<Outcome, ShellError> {
    let prep = Prepared::new(stage)?;
    let _ = io::stdout().flush();

    let mut saved = SavedFds::default();
    let applied = prep
        .redirections
        .iter()
        .try_for_each(|spec| saved.redirect(spec));
    let outcome = match applied {
        Ok(()) => run_builtin(&stage.argv, ctx),
        Err(e) => {
            drop(saved);
            eprintln!("jcsh: {}", e);
            return Ok(Outcome::Status(e.status()));
        }
    };
    drop(saved);
    Ok(outcome)
}

/// Starts every stage of `pipeline` in one new process group and returns
/// that group without waiting for anything.
///
/// A lone `cd` or `exit` runs in the shell itself, since changing directory
/// or exiting in a child would have no effect on the shell.
pub fn run_pipeline(pipeline: &mut Pipeline, ctx: &mut ShellContext) -> Result<Started, ShellError> {
    if let [stage] = pipeline.stages.as_slice() {
        if stage.program().map_or(false, is_builtin) {
            return run_builtin_in_shell(stage, ctx).map(Started::Finished);
        }
    }

    let prepared = pipeline
        .stages
        .iter()
        .map(Prepared::new)
        .collect::<Result<Vec<_>, ShellError>>()?;
    let command = pipeline.to_string();
    let mut pipes = Pipes::new(pipeline.stages.len() - 1).map_err(|source| {
        ShellError::ProcessStart {
            command: command.clone(),
            source,
        }
    })?;

    // Buffered output must not be duplicated into the children.
    let _ = io::stdout().flush();

    let mut pgid: Option<Pid> = None;
    for (i, (stage, prep)) in pipeline.stages.iter_mut().zip(&prepared).enumerate() {
        match syscall(|| unsafe { fork() }) {
            Ok(ForkResult::Child) => prepare_and_exec(i, stage, prep, &mut pipes, pgid, ctx),
            Ok(ForkResult::Parent { child }) => {
                pgid = Some(register_started(stage, child, pgid));
            }
            Err(source) => {
                pipeline.pgid = pgid;
                return Err(ShellError::ProcessStart { command, source });
            }
        }
    }
    pipes.close_all();

    pipeline.pgid = pgid;
    match pgid {
        Some(pgid) => {
            log::debug!("started `{}` in process group {}", command, pgid);
            Ok(Started::Group(pgid))
        }
        None => Err(ShellError::ProcessStart {
            command,
            source: Errno::EINVAL,
        }),
    }
}

/// Parent side of a fork: put the child in the pipeline's group (the first
/// child founds it) and remember its pid. Returns the group.
fn register_started(stage: &mut Stage, child: Pid, pgid: Option<Pid>) -> Pid {
    let group = pgid.unwrap_or(child);
    // EACCES here means the child already exec'd, after joining the group itself.
    if let Err(e) = setpgid(child, group) {
        log::debug!("setpgid({}, {}) from parent: {}", child, group, e);
    }
    stage.pid = Some(child);
    group
}

/// Child side of a fork. Never returns: the process either becomes the
/// stage's program or exits with the status matching what went wrong.
fn prepare_and_exec(
    index: usize,
    stage: &Stage,
    prep: &Prepared,
    pipes: &mut Pipes,
    pgid: Option<Pid>,
    ctx: &mut ShellContext,
) -> ! {
    let err = match setup_child(index, stage.pipe_role, prep, pipes, pgid) {
        Err(e) => e,
        Ok(()) if prep.builtin => match run_builtin(&stage.argv, ctx) {
            Outcome::Status(code) | Outcome::Exit(code) => exit_child(code),
        },
        Ok(()) => exec_program(stage, prep),
    };
    write_stderr(&err.to_string());
    exit_child(err.status())
}

fn setup_child(
    index: usize,
    role: PipeRole,
    prep: &Prepared,
    pipes: &mut Pipes,
    pgid: Option<Pid>,
) -> Result<(), ChildError> {
    let setup = |step: &'static str| move |source: nix::Error| ChildError::Setup { step, source };

    // Second half of the double assignment; the parent may lose the race.
    let _ = setpgid(Pid::from_raw(0), pgid.unwrap_or_else(|| Pid::from_raw(0)));
    signals::reset_for_child().map_err(setup("sigaction"))?;

    if role.reads() {
        if let Some(fd) = index.checked_sub(1).and_then(|i| pipes.read_end(i)) {
            syscall(|| dup2(fd, libc::STDIN_FILENO)).map_err(setup("dup2"))?;
        }
    }
    if role.writes() {
        if let Some(fd) = pipes.write_end(index) {
            syscall(|| dup2(fd, libc::STDOUT_FILENO)).map_err(setup("dup2"))?;
        }
    }
    // Every pipe end, including other stages', or readers never see EOF.
    pipes.close_all();

    for r in &prep.redirections {
        let fd = syscall(|| open(r.path.as_c_str(), r.flags, Mode::from_bits_truncate(0o666)))
            .map_err(|source| ChildError::Redirect {
                path: r.display.clone(),
                source,
            })?;
        if fd != r.fd {
            syscall(|| dup2(fd, r.fd)).map_err(setup("dup2"))?;
            let _ = close(fd);
        }
    }
    Ok(())
}

fn exec_program(stage: &Stage, prep: &Prepared) -> ChildError {
    let name = stage.program().unwrap_or_default().to_string();
    let Some(program) = prep.argv.first() else {
        return ChildError::NotFound(name);
    };
    let source = match execvp(program, &prep.argv) {
        Err(e) => e,
        Ok(never) => match never {},
    };
    match source {
        Errno::ENOENT | Errno::ENOTDIR => ChildError::NotFound(name),
        source => ChildError::NotExecutable {
            program: name,
            source,
        },
    }
}

fn exit_child(code: i32) -> ! {
    // _exit: no atexit handlers or stdio flushing inherited from the shell.
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::build;
    use crate::token::tokens;

    fn stage(line: &str) -> Stage {
        let mut list = build(tokens(line)).unwrap();
        list.pipelines.remove(0).stages.remove(0)
    }

    #[test]
    fn test_prepare_redirections() {
        let prep = Prepared::new(&stage("cat < in > out 2>> err")).unwrap();
        assert_eq!(prep.argv.len(), 1);
        assert!(!prep.builtin);
        let fds: Vec<RawFd> = prep.redirections.iter().map(|r| r.fd).collect();
        assert_eq!(fds, vec![0, 1, 2]);
        assert_eq!(prep.redirections[0].flags, OFlag::O_RDONLY);
        assert!(prep.redirections[1].flags.contains(OFlag::O_TRUNC));
        assert!(prep.redirections[2].flags.contains(OFlag::O_APPEND));
        assert_eq!(prep.redirections[2].display, "err");
    }

    #[test]
    fn test_prepare_marks_builtins() {
        assert!(Prepared::new(&stage("cd /tmp")).unwrap().builtin);
        assert!(!Prepared::new(&stage("ls /tmp")).unwrap().builtin);
    }

    fn spec_for(fd: RawFd, path: &std::path::Path) -> OpenSpec {
        let display = path.display().to_string();
        OpenSpec {
            fd,
            flags: OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            path: CString::new(display.clone()).unwrap(),
            display,
        }
    }

    #[test]
    fn test_saved_fds_redirect_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let target: RawFd = 57;
        {
            let mut saved = SavedFds::default();
            saved.redirect(&spec_for(target, &out)).unwrap();
            nix::unistd::write(target, b"in shell\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "in shell\n");
        // The descriptor was closed before, so it is closed again.
        assert!(fcntl(target, FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn test_saved_fds_open_failure() {
        let target: RawFd = 58;
        let mut saved = SavedFds::default();
        let err = saved
            .redirect(&spec_for(target, std::path::Path::new("/nonexistent/dir/out")))
            .unwrap_err();
        assert_eq!(err.status(), 1);
        assert!(err.to_string().starts_with("/nonexistent/dir/out"));
        drop(saved);
        assert!(fcntl(target, FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn test_pipes_close_all_is_idempotent() {
        let mut pipes = Pipes::new(2).unwrap();
        assert!(pipes.read_end(1).is_some());
        assert!(pipes.write_end(2).is_none());
        pipes.close_all();
        assert!(pipes.read_end(0).is_none());
        pipes.close_all();
    }
}
