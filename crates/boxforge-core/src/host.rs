use std::io::{self, Read, Write};
use tracing::warn;

const STDIN_POLL_MS: libc::c_int = 100;

/// The local side of an interactive run: where container output goes, where
/// forwarded input comes from, and how the terminal is put into raw mode.
pub trait HostIo: Send + Sync {
    /// Input forwarded to the container. Reads may fail with `WouldBlock`
    /// when no input is ready, so copy loops can check for a stop request.
    fn stdin(&self) -> Box<dyn Read + Send>;
    fn stdout(&self) -> Box<dyn Write + Send>;
    fn stderr(&self) -> Box<dyn Write + Send>;
    fn raw_mode(&self) -> io::Result<RawModeGuard>;
}

/// Restores the terminal when dropped. Restoration runs at most once.
#[must_use = "the terminal is restored as soon as the guard is dropped"]
pub struct RawModeGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl RawModeGuard {
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    /// Guard for a terminal that was never switched.
    pub fn noop() -> Self {
        Self { restore: None }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

/// The real process stdio and controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessIo;

impl HostIo for ProcessIo {
    fn stdin(&self) -> Box<dyn Read + Send> {
        Box::new(PollingStdin)
    }

    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }

    fn stderr(&self) -> Box<dyn Write + Send> {
        Box::new(io::stderr())
    }

    fn raw_mode(&self) -> io::Result<RawModeGuard> {
        if !stdin_is_terminal() {
            return Ok(RawModeGuard::noop());
        }
        crossterm::terminal::enable_raw_mode()?;
        Ok(RawModeGuard::new(|| {
            if let Err(e) = crossterm::terminal::disable_raw_mode() {
                warn!("failed to restore terminal: {e}");
            }
        }))
    }
}

#[allow(unsafe_code)]
fn stdin_is_terminal() -> bool {
    // SAFETY: isatty() only inspects the descriptor, no side effects.
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

/// Process stdin that gives up after a short poll instead of blocking.
struct PollingStdin;

impl Read for PollingStdin {
    #[allow(unsafe_code)]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut fds = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: fds is one valid pollfd that outlives the call.
        let ready = unsafe { libc::poll(&mut fds, 1, STDIN_POLL_MS) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}
