use crate::error::ShellError;
use std::ffi::CString;

/// Calls `f` until it fails with something other than `EINTR`.
pub fn syscall<F, T>(mut f: F) -> nix::Result<T>
where
    F: FnMut() -> nix::Result<T>,
{
    loop {
        match f() {
            Err(nix::Error::EINTR) => (),
            result => return result,
        }
    }
}

/// Converts words to C strings ahead of a fork, so the child only has to
/// hand them to exec.
pub fn cstrings(words: &[String]) -> Result<Vec<CString>, ShellError> {
    words
        .iter()
        .map(|w| CString::new(w.as_bytes()).map_err(|_| ShellError::NulArgument(w.clone())))
        .collect()
}

/// Writes a diagnostic straight to fd 2. Used in forked children, where the
/// process-wide stderr lock may have been held by another thread at fork time.
pub fn write_stderr(msg: &str) {
    let line = format!("jcsh: {}\n", msg);
    let _ = nix::unistd::write(nix::libc::STDERR_FILENO, line.as_bytes());
}
