use crate::error::ShellError;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{killpg, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{getpgrp, tcgetpgrp, tcsetpgrp, Pid};
use once_cell::sync::Lazy;
use signal_hook::consts::signal::SIGINT;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Signals a forked child must see with their default behavior, whatever the
/// shell does with them. SIGPIPE is ignored by the Rust runtime in the shell.
pub const CHILD_DEFAULT_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGPIPE,
];

/// Set when the shell process itself receives SIGINT.
static INTERRUPTED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Foreground group that SIGINT is relayed to while it cannot own the
/// terminal; 0 when there is none.
static RELAY_PGID: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
}

/// Installs `disposition` for `signal`.
pub fn install_disposition(signal: Signal, disposition: Disposition) -> nix::Result<()> {
    let handler = match disposition {
        Disposition::Default => SigHandler::SigDfl,
        Disposition::Ignore => SigHandler::SigIgn,
    };
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // Only SIG_DFL and SIG_IGN are installed here, no handler code runs.
    unsafe { sigaction(signal, &action) }.map(|_| ())
}

/// Returns true if SIGINT reached the shell since the last `clear_interrupt`.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Relays every SIGINT the shell receives to `pgid` until called again with
/// `None`. Used for foreground pipelines that did not get the terminal, so
/// Ctrl-C still reaches them. An interrupt that already arrived is relayed at
/// once.
pub fn relay_interrupts_to(pgid: Option<Pid>) {
    RELAY_PGID.store(pgid.map_or(0, Pid::as_raw), Ordering::SeqCst);
    if let Some(pgid) = pgid {
        if interrupted() {
            let _ = killpg(pgid, Signal::SIGINT);
        }
    }
}

/// Runs inside the SIGINT handler: only atomics and `killpg`.
fn relay_interrupt() {
    let pgid = RELAY_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGINT);
    }
}

/// The controlling terminal, used to move the foreground process group
/// between the shell and the pipelines it runs.
#[derive(Debug)]
pub struct Terminal {
    fd: Option<RawFd>,
    shell_pgid: Pid,
    owns_foreground: bool,
}

impl Terminal {
    /// Opens `/dev/tty`. Without a controlling terminal the handle still
    /// works, but every foreground change fails.
    pub fn open() -> Self {
        let shell_pgid = getpgrp();
        let fd = match open("/dev/tty", OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty()) {
            Ok(fd) => Some(fd),
            Err(e) => {
                log::debug!("no controlling terminal: {}", e);
                None
            }
        };
        Terminal {
            fd,
            shell_pgid,
            owns_foreground: false,
        }
    }

    /// A terminal handle that never controls anything, for shells running
    /// without job control.
    pub fn detached() -> Self {
        Terminal {
            fd: None,
            shell_pgid: getpgrp(),
            owns_foreground: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.fd.is_some()
    }

    pub fn shell_pgid(&self) -> Pid {
        self.shell_pgid
    }

    /// Makes `pgid` the terminal's foreground process group; `None` means the
    /// shell's own group.
    ///
    /// Refuses when the shell never owned the foreground and does not own it
    /// now, i.e. when it was itself started in the background.
    pub fn set_foreground(&mut self, pgid: Option<Pid>) -> Result<(), ShellError> {
        let fd = self.fd.ok_or(ShellError::Terminal(nix::Error::ENOTTY))?;
        let current = tcgetpgrp(fd).map_err(ShellError::Terminal)?;
        if current != self.shell_pgid && !self.owns_foreground {
            return Err(ShellError::Terminal(nix::Error::EPERM));
        }
        tcsetpgrp(fd, pgid.unwrap_or(self.shell_pgid)).map_err(ShellError::Terminal)?;
        if pgid.is_none() {
            self.owns_foreground = true;
        }
        Ok(())
    }
}

/// Startup discipline: the shell takes the foreground, ignores SIGTTOU (so
/// reclaiming the terminal does not stop it) and records SIGINT instead of
/// dying from it.
pub fn init(terminal: &mut Terminal, interactive: bool) {
    if let Err(e) = install_disposition(Signal::SIGTTOU, Disposition::Ignore) {
        log::warn!("cannot ignore SIGTTOU: {}", e);
    }
    if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&INTERRUPTED)) {
        log::warn!("cannot install SIGINT handler: {}", e);
    }
    // killpg and atomic loads are async-signal-safe.
    if let Err(e) = unsafe { signal_hook::low_level::register(SIGINT, relay_interrupt) } {
        log::warn!("cannot install SIGINT relay: {}", e);
    }
    if let Err(e) = terminal.set_foreground(None) {
        if interactive {
            log::warn!("job control disabled: {}", e);
        } else {
            log::debug!("job control disabled: {}", e);
        }
    }
}

/// Restores default dispositions for job-control signals and SIGPIPE. Runs in
/// a freshly forked child before exec.
pub fn reset_for_child() -> nix::Result<()> {
    for signal in CHILD_DEFAULT_SIGNALS {
        install_disposition(signal, Disposition::Default)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_terminal_refuses_foreground() {
        let mut term = Terminal::detached();
        assert!(!term.is_available());
        assert!(term.set_foreground(None).is_err());
        assert!(term.set_foreground(Some(Pid::from_raw(1))).is_err());
        assert_eq!(term.shell_pgid(), getpgrp());
    }

    #[test]
    fn test_relay_is_cleared() {
        relay_interrupts_to(None);
        assert_eq!(RELAY_PGID.load(Ordering::SeqCst), 0);
        // Nothing to relay to: the handler body must be a no-op.
        relay_interrupt();
    }

    #[test]
    fn test_install_disposition() {
        install_disposition(Signal::SIGTTOU, Disposition::Ignore).unwrap();
        install_disposition(Signal::SIGTTOU, Disposition::Default).unwrap();
    }
}
