//! The operator's own terminal.

use std::io;
use std::os::fd::AsRawFd;

use nix::sys::termios::{self, SetArg, Termios};

use crate::error::{ProxyError, Result};
use crate::pty::{get_winsize, WindowSize};

/// Puts stdin into raw mode until restored or dropped.
pub struct RawTerminal {
    saved: Option<Termios>,
}

impl RawTerminal {
    pub fn acquire() -> Result<Self> {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(&stdin)
            .map_err(|e| ProxyError::Terminal(format!("could not read terminal attributes: {e}")))?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)
            .map_err(|e| ProxyError::Terminal(format!("could not enter raw mode: {e}")))?;
        tracing::debug!("console in raw mode");
        Ok(Self { saved: Some(saved) })
    }

    /// Put the saved attributes back. Safe to call more than once.
    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = termios::tcsetattr(&io::stdin(), SetArg::TCSANOW, &saved) {
                tracing::warn!(error = %e, "could not restore terminal attributes");
            } else {
                tracing::debug!("console restored");
            }
        }
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Size of the terminal attached to stdin.
pub fn window_size() -> Result<WindowSize> {
    let size = get_winsize(io::stdin().as_raw_fd())
        .map_err(|e| ProxyError::Terminal(format!("could not get terminal size: {e}")))?;
    if size.cols == 0 || size.rows == 0 {
        tracing::debug!(%size, "console reports no size, using default");
        return Ok(WindowSize::DEFAULT);
    }
    Ok(size)
}
