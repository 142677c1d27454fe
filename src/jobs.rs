use crate::builtins::Outcome;
use crate::error::STATUS_FAILURE;
use crate::exec::{run_pipeline, Started};
use crate::parser::{CommandList, Join, Pipeline};
use crate::shell::ShellContext;
use crate::signals;
use crate::utils::syscall;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::time::Instant;

/// Represents the state of a job that is not in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
}

/// A pipeline the shell no longer waits on.
#[derive(Debug)]
pub struct Job {
    pub jid: usize,
    pub pgid: Pid,
    /// Stages not reaped yet.
    pub pids: Vec<Pid>,
    pub state: JobState,
    pub cmdline: String,
    pub started: Instant,
}

/// Background jobs keyed by job ID.
#[derive(Debug, Default)]
pub struct JobList {
    jobs: BTreeMap<usize, Job>,
}

impl JobList {
    pub fn new() -> Self {
        JobList::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns the smallest positive job ID not in use.
    fn free_jid(&self) -> usize {
        let mut jid = 1;
        while self.jobs.contains_key(&jid) {
            jid += 1;
        }
        jid
    }

    /// Adds a job and returns its job ID.
    pub fn add_job(&mut self, pgid: Pid, pids: Vec<Pid>, state: JobState, cmdline: String) -> usize {
        let jid = self.free_jid();
        let job = Job {
            jid,
            pgid,
            pids,
            state,
            cmdline,
            started: Instant::now(),
        };
        self.jobs.insert(jid, job);
        jid
    }

    /// Removes and returns the job with the given job ID.
    pub fn delete_job(&mut self, jid: usize) -> Option<Job> {
        self.jobs.remove(&jid)
    }

    /// Collects every stage that has terminated, without blocking, and
    /// removes the jobs whose stages are all gone. Returns those jobs.
    pub fn reap(&mut self) -> Vec<Job> {
        for job in self.jobs.values_mut() {
            job.pids.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => false,
                Ok(_) => true,
                Err(nix::Error::EINTR) => true,
                // ECHILD: somebody already collected it.
                Err(_) => false,
            });
        }
        let done: Vec<usize> = self
            .jobs
            .values()
            .filter(|job| job.pids.is_empty())
            .map(|job| job.jid)
            .collect();
        done.into_iter().filter_map(|jid| self.delete_job(jid)).collect()
    }
}

/// What the read loop should do after a line was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// `exit` ran; terminate with this status.
    Exit(i32),
}

/// How waiting on a pipeline's stages ended.
#[derive(Debug, Default, PartialEq, Eq)]
struct Waited {
    status: Option<i32>,
    interrupted: bool,
    /// Stages that stopped instead of terminating.
    stopped: Vec<Pid>,
}

/// Maps a wait status to a shell exit status: the exit code, or 128 plus
/// the signal number for a process killed or stopped by a signal.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) | WaitStatus::Stopped(_, sig) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Whether the pipeline after one ended by `prev` is run. The first
/// pipeline of a line is always reached.
fn reachable(prev: Option<Join>, last_status: i32) -> bool {
    prev.map_or(true, |join| join.admits(last_status))
}

/// Runs a command list left to right.
///
/// `&&` and `||` are evaluated against `ctx.last_status`; skipped pipelines
/// leave it untouched and so do background ones. Foreground pipelines get
/// the terminal for as long as they run. An interrupt (SIGINT killing a
/// foreground stage, or reaching the shell) abandons the rest of the list.
pub fn run(list: CommandList, ctx: &mut ShellContext) -> Flow {
    let mut prev: Option<Join> = None;
    for mut pipeline in list.pipelines {
        if signals::interrupted() {
            log::debug!("interrupted, dropping `{}` and the rest of the line", pipeline);
            break;
        }
        let reached = reachable(prev, ctx.last_status);
        prev = Some(pipeline.join);
        if !reached {
            log::debug!("skipping `{}` (last status {})", pipeline, ctx.last_status);
            continue;
        }

        match run_pipeline(&mut pipeline, ctx) {
            Ok(Started::Finished(Outcome::Exit(code))) => return Flow::Exit(code),
            Ok(Started::Finished(Outcome::Status(status))) => {
                pipeline.status = Some(status);
                if !pipeline.is_background() {
                    ctx.last_status = status;
                }
            }
            Ok(Started::Group(pgid)) if pipeline.is_background() => {
                detach(&pipeline, pgid, JobState::Running, ctx);
            }
            Ok(Started::Group(pgid)) => {
                if run_foreground(&mut pipeline, pgid, ctx) {
                    log::debug!("`{}` was interrupted, abandoning the line", pipeline);
                    break;
                }
            }
            Err(e) => {
                eprintln!("jcsh: {}", e);
                // Stages forked before the failure still have to be collected.
                wait_stages(&pipeline);
                pipeline.status = Some(STATUS_FAILURE);
                if !pipeline.is_background() {
                    ctx.last_status = e.status();
                }
            }
        }
    }
    Flow::Continue
}

/// Hands the terminal to `pgid`, waits for every stage, takes the terminal
/// back. Returns true if the pipeline was interrupted.
fn run_foreground(pipeline: &mut Pipeline, pgid: Pid, ctx: &mut ShellContext) -> bool {
    let handed = match ctx.terminal.set_foreground(Some(pgid)) {
        Ok(()) => true,
        Err(e) => {
            if ctx.terminal.is_available() {
                log::debug!("cannot give terminal to {}: {}", pgid, e);
            }
            signals::relay_interrupts_to(Some(pgid));
            false
        }
    };
    let waited = wait_stages(pipeline);
    if handed {
        if let Err(e) = ctx.terminal.set_foreground(None) {
            log::warn!("cannot take the terminal back: {}", e);
        }
    } else {
        signals::relay_interrupts_to(None);
    }

    let status = waited.status.unwrap_or(STATUS_FAILURE);
    pipeline.status = Some(status);
    ctx.last_status = status;
    log::debug!("`{}` exited with status {}", pipeline, status);

    if !waited.stopped.is_empty() {
        let jid = ctx
            .jobs
            .add_job(pgid, waited.stopped, JobState::Stopped, pipeline.to_string());
        if ctx.interactive {
            eprintln!("\n[{}] Stopped\t{}", jid, pipeline);
        }
        log::info!("job {} (group {}) stopped", jid, pgid);
    }
    waited.interrupted
}

/// Blocks until every started stage has terminated or stopped. The status
/// is the last stage's, and `None` if the last stage never started or could
/// not be waited on.
fn wait_stages(pipeline: &Pipeline) -> Waited {
    let mut waited = Waited::default();
    let last = pipeline.stages.last().and_then(|stage| stage.pid);
    for pid in pipeline.stages.iter().filter_map(|stage| stage.pid) {
        match syscall(|| waitpid(pid, Some(WaitPidFlag::WUNTRACED))) {
            Ok(status) => {
                match status {
                    WaitStatus::Signaled(_, Signal::SIGINT, _) => waited.interrupted = true,
                    WaitStatus::Stopped(..) => waited.stopped.push(pid),
                    _ => (),
                }
                if Some(pid) == last {
                    waited.status = exit_code(status);
                }
            }
            Err(e) => log::warn!("waitpid({}): {}", pid, e),
        }
    }
    waited
}

/// Records a started background pipeline and returns to the caller at once.
fn detach(pipeline: &Pipeline, pgid: Pid, state: JobState, ctx: &mut ShellContext) {
    let pids = pipeline.stages.iter().filter_map(|stage| stage.pid).collect();
    let jid = ctx.jobs.add_job(pgid, pids, state, pipeline.to_string());
    if ctx.interactive {
        eprintln!("[{}] {}", jid, pgid);
    }
    log::info!("job {} (group {}) running in background: {}", jid, pgid, pipeline);
}

/// Reaps finished background jobs without blocking.
pub fn reap(ctx: &mut ShellContext) {
    for job in ctx.jobs.reap() {
        if ctx.interactive {
            eprintln!("[{}] Done\t{}", job.jid, job.cmdline);
        }
        log::info!(
            "job {} (group {}, {:?}) finished after {:?}",
            job.jid,
            job.pgid,
            job.state,
            job.started.elapsed()
        );
    }
}
