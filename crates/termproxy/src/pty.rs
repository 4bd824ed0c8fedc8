//! The child process and the pseudo-terminal it runs on.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub const DEFAULT: WindowSize = WindowSize { cols: 80, rows: 24 };

    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert signed dimensions (as carried by a Winch message), rejecting
    /// anything that is not a positive size.
    pub fn from_signed(cols: i16, rows: i16) -> Result<Self> {
        if cols <= 0 || rows <= 0 {
            return Err(ProxyError::InvalidSize {
                cols: cols.into(),
                rows: rows.into(),
            });
        }
        Ok(Self::new(cols as u16, rows as u16))
    }

    pub fn validate(self) -> Result<Self> {
        if self.cols == 0 || self.rows == 0 {
            return Err(ProxyError::InvalidSize {
                cols: self.cols.into(),
                rows: self.rows.into(),
            });
        }
        Ok(self)
    }

    pub(crate) fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }

    pub(crate) fn from_winsize(ws: &libc::winsize) -> Self {
        Self::new(ws.ws_col, ws.ws_row)
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Program and arguments to run inside the PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ── fd helpers (libc) ───────────────────────────────────────────────

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn get_winsize(fd: RawFd) -> io::Result<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(WindowSize::from_winsize(&ws))
}

fn set_winsize(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let ws = size.to_winsize();
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pty closed")
}

// ── PtySession ──────────────────────────────────────────────────────

/// Owns the PTY master and the child running on its slave side.
///
/// The master is non-blocking and driven by the tokio reactor, so one task
/// can sit in [`read`](Self::read) while another writes.
pub struct PtySession {
    master: RwLock<Option<Arc<AsyncFd<OwnedFd>>>>,
    child: Mutex<Child>,
    pid: Option<u32>,
    reaped: AtomicBool,
    command: CommandSpec,
    size: parking_lot::Mutex<WindowSize>,
}

impl PtySession {
    /// Allocate a PTY of `size` and spawn `command` on it as a new session
    /// leader with the slave as its controlling terminal.
    pub fn start(command: &CommandSpec, size: WindowSize) -> Result<Self> {
        let size = size.validate()?;
        let ws = size.to_winsize();
        let pty = nix::pty::openpty(Some(&ws), None)
            .map_err(|e| ProxyError::Terminal(format!("could not allocate a PTY: {e}")))?;

        let terminal = |e: io::Error| ProxyError::Terminal(format!("could not configure the PTY: {e}"));
        set_cloexec(pty.master.as_raw_fd()).map_err(terminal)?;
        set_cloexec(pty.slave.as_raw_fd()).map_err(terminal)?;

        let spawn_err = |source: io::Error| ProxyError::Command {
            command: command.to_string(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::from(pty.slave.try_clone().map_err(spawn_err)?))
            .stdout(Stdio::from(pty.slave.try_clone().map_err(spawn_err)?))
            .stderr(Stdio::from(pty.slave.try_clone().map_err(spawn_err)?));

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_err)?;
        // The child holds its own copies; the master sees EIO once they close.
        drop(pty.slave);

        set_nonblocking(pty.master.as_raw_fd()).map_err(terminal)?;
        let master = AsyncFd::new(pty.master).map_err(terminal)?;

        let pid = child.id();
        tracing::debug!(command = %command, ?pid, %size, "spawned child on pty");

        Ok(Self {
            master: RwLock::new(Some(Arc::new(master))),
            child: Mutex::new(child),
            pid,
            reaped: AtomicBool::new(false),
            command: command.clone(),
            size: parking_lot::Mutex::new(size),
        })
    }

    fn master(&self) -> io::Result<Arc<AsyncFd<OwnedFd>>> {
        self.master.read().clone().ok_or_else(closed_error)
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Apply new dimensions to the PTY.
    ///
    /// Zero sizes are rejected with [`ProxyError::InvalidSize`]; a failing
    /// ioctl is a [`ProxyError::Terminal`].
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        let size = size.validate()?;
        let master = self
            .master()
            .map_err(|e| ProxyError::Terminal(format!("could not set the terminal size of the PTY: {e}")))?;
        set_winsize(master.as_raw_fd(), size)
            .map_err(|e| ProxyError::Terminal(format!("could not set the terminal size of the PTY: {e}")))?;
        *self.size.lock() = size;
        tracing::debug!(%size, "pty resized");
        Ok(())
    }

    /// Current dimensions as reported by the kernel.
    pub fn size(&self) -> io::Result<WindowSize> {
        let master = self.master()?;
        get_winsize(master.as_raw_fd())
    }

    /// Dimensions from the last successful resize (or start).
    pub fn last_size(&self) -> WindowSize {
        *self.size.lock()
    }

    /// Read PTY output. `Ok(0)` means end of output.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let master = self.master()?;
        loop {
            let mut guard = master.readable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` to the PTY.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        let master = self.master()?;
        while !data.is_empty() {
            let mut guard = master.writable().await?;
            let result = guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Wait for the child to exit. Returns its exit code, or `None` if it
    /// was killed by a signal.
    pub async fn wait(&self) -> io::Result<Option<i32>> {
        let status = self.child.lock().await.wait().await?;
        self.reaped.store(true, Ordering::Release);
        Ok(status.code())
    }

    /// Whether [`wait`](Self::wait) has collected the child's exit status.
    pub fn has_exited(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    /// Deliver `sig` to the child. A no-op once the child has been reaped,
    /// since its pid may already belong to another process.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.has_exited() {
            tracing::debug!(?sig, pid, "child already reaped, not signalling");
            return Ok(());
        }
        signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| ProxyError::Terminal(format!("could not signal {}: {e}", self.command)))
    }

    /// Close the master descriptor. The fd is released once in-flight reads
    /// and writes let go of it; new ones fail immediately.
    pub fn close(&self) {
        if self.master.write().take().is_some() {
            tracing::debug!("pty closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.master.read().is_none()
    }
}
