//! One shared terminal session: the PTY, its viewers and the workers that
//! move bytes between them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::buffer::SharedBuffer;
use crate::console::RawTerminal;
use crate::error::{ProxyError, Result};
use crate::framing::{run_dispatch_loop, Data, Handshake, MessageHandler, StreamEnd, Winch};
use crate::mux;
use crate::pty::{CommandSpec, PtySession, WindowSize};
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;

const READ_CHUNK: usize = 32 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// How long output produced right before the child exited gets to reach
/// viewers before teardown.
const EXIT_GRACE: Duration = Duration::from_millis(100);

/// Why a session ended.
#[derive(Debug, Clone)]
pub enum SessionEnd {
    /// The child exited; `None` when it was killed by a signal.
    ChildExited(Option<i32>),
    PtyClosed,
    ConsoleClosed,
    Fatal(Arc<ProxyError>),
}

impl SessionEnd {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionEnd::Fatal(_))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ChildExited(Some(code)) => write!(f, "child exited with status {code}"),
            SessionEnd::ChildExited(None) => f.write_str("child killed by a signal"),
            SessionEnd::PtyClosed => f.write_str("pty closed"),
            SessionEnd::ConsoleClosed => f.write_str("console closed"),
            SessionEnd::Fatal(err) => write!(f, "{err}"),
        }
    }
}

pub struct Session {
    pty: PtySession,
    registry: ConnectionRegistry,
    input: SharedBuffer,
    output: SharedBuffer,
    console: Mutex<Option<RawTerminal>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    end: Mutex<Option<SessionEnd>>,
    closed: watch::Sender<bool>,
    torn_down: AtomicBool,
}

impl Session {
    /// Spawn `command` on a new PTY of `size` and start watching for it to
    /// exit. Nothing is read or written until [`spawn_engine`](Self::spawn_engine).
    pub fn start(command: &CommandSpec, size: WindowSize) -> Result<Arc<Self>> {
        let pty = PtySession::start(command, size)?;
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            pty,
            registry: ConnectionRegistry::new(),
            input: SharedBuffer::new(),
            output: SharedBuffer::new(),
            console: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            end: Mutex::new(None),
            closed,
            torn_down: AtomicBool::new(false),
        });

        let waiter = Arc::clone(&session);
        session.track(tokio::spawn(async move {
            let code = match waiter.pty.wait().await {
                Ok(code) => code,
                Err(err) => {
                    tracing::warn!(error = %err, "could not wait for child");
                    None
                }
            };
            tracing::info!(?code, "child exited");
            tokio::time::sleep(EXIT_GRACE).await;
            waiter.shutdown(SessionEnd::ChildExited(code));
        }));

        Ok(session)
    }

    pub fn pty(&self) -> &PtySession {
        &self.pty
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn input(&self) -> &SharedBuffer {
        &self.input
    }

    pub fn output(&self) -> &SharedBuffer {
        &self.output
    }

    /// Keep the operator's raw-mode guard until teardown restores it.
    pub fn hold_console(&self, console: RawTerminal) {
        *self.console.lock() = Some(console);
    }

    /// Start the console reader, the PTY reader and the multiplex loop.
    pub fn spawn_engine<R, W>(self: &Arc<Self>, mut console_in: R, console_out: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match console_in.read(&mut buf).await {
                    Ok(0) => {
                        tracing::debug!("console input ended");
                        break;
                    }
                    Ok(n) => session.input.append(&buf[..n]),
                    Err(err) => {
                        tracing::debug!(error = %err, "console read failed");
                        break;
                    }
                }
            }
        }));

        let session = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match session.pty.read(&mut buf).await {
                    Ok(0) => {
                        tracing::debug!("pty output ended");
                        break;
                    }
                    Ok(n) => session.output.append(&buf[..n]),
                    Err(err) => {
                        tracing::debug!(error = %err, "pty read failed");
                        break;
                    }
                }
            }
        }));

        let session = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let end = mux::multiplex(&session, console_out).await;
            session.shutdown(end);
        }));
    }

    /// Start accepting viewers on `listener` in the background.
    pub fn spawn_accept_loop<T: Transport>(self: &Arc<Self>, listener: TcpListener, transport: T) {
        let session = Arc::clone(self);
        self.track(tokio::spawn(session.accept_loop(listener, transport)));
    }

    /// Accept viewers forever. Every peer gets its own worker, so a slow
    /// handshake never holds up the next accept.
    pub async fn accept_loop<T: Transport>(self: Arc<Self>, listener: TcpListener, transport: T) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "accepting viewers");
        }
        loop {
            match listener.accept().await {
                Ok((tcp, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    let session = Arc::clone(&self);
                    let transport = transport.clone();
                    self.track(tokio::spawn(async move {
                        match transport.establish(tcp).await {
                            Ok(stream) => session.attach(stream, Some(peer)).await,
                            Err(err) => {
                                tracing::warn!(%peer, error = %err, "transport handshake failed")
                            }
                        }
                    }));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Serve one viewer: size handshake, registration, then its input until
    /// the stream ends or the viewer's output side is closed.
    pub async fn attach<S>(self: Arc<Self>, stream: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        let handshake = match Handshake::read_from(&mut reader).await {
            Ok(handshake) => handshake,
            Err(err) => {
                tracing::warn!(?peer, error = %err, "discarding connection");
                return;
            }
        };
        let size = WindowSize::new(handshake.cols, handshake.rows);
        if let Err(err) = self.pty.resize(size) {
            if err.is_session_fatal() {
                self.shutdown(SessionEnd::Fatal(Arc::new(err)));
            } else {
                tracing::warn!(?peer, error = %err, "discarding connection");
            }
            return;
        }

        let Some(conn) = self.registry.register(writer, peer) else {
            tracing::debug!(?peer, "session closing, not registering");
            return;
        };
        tracing::info!(?peer, id = conn.id(), %size, "viewer attached");

        let mut handler = ViewerInput {
            session: &*self,
            peer,
        };
        // A viewer whose output side failed or fell behind is done too, even
        // while its peer keeps typing.
        let end = tokio::select! {
            end = run_dispatch_loop(&mut reader, &mut handler) => Some(end),
            _ = conn.closed() => None,
        };
        self.registry.remove(conn.id());

        match end {
            Some(StreamEnd::Failed(err)) if err.is_session_fatal() => {
                self.shutdown(SessionEnd::Fatal(Arc::new(err)));
            }
            Some(_) => {}
            None => tracing::info!(?peer, id = conn.id(), "viewer dropped, output side closed"),
        }
    }

    /// Record why the session is ending and wake [`wait`](Self::wait).
    /// The first reason wins.
    pub fn shutdown(&self, end: SessionEnd) {
        {
            let mut slot = self.end.lock();
            if slot.is_none() {
                tracing::info!(%end, "session ending");
                *slot = Some(end);
            }
        }
        self.closed.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the session to end, then tear it down: stop the workers,
    /// close every viewer, close the PTY and restore the console. Teardown
    /// runs once no matter how many callers wait.
    pub async fn wait(&self) -> SessionEnd {
        let mut closed = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = closed.wait_for(|closed| *closed).await;
        let end = self.end.lock().clone().unwrap_or(SessionEnd::PtyClosed);
        self.teardown(&end).await;
        end
    }

    async fn teardown(&self, end: &SessionEnd) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.abort();
        }
        for worker in workers {
            let _ = worker.await;
        }

        self.registry.close_all().await;

        if !matches!(end, SessionEnd::ChildExited(_)) {
            if let Err(err) = self.pty.signal(Signal::SIGHUP) {
                tracing::debug!(error = %err, "could not hang up child");
            }
        }
        self.pty.close();

        if let Some(mut console) = self.console.lock().take() {
            console.restore();
        }
        tracing::debug!("session torn down");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock();
        if self.torn_down.load(Ordering::Acquire) {
            handle.abort();
            return;
        }
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
    }
}

/// Applies one viewer's messages to the session.
struct ViewerInput<'a> {
    session: &'a Session,
    peer: Option<SocketAddr>,
}

impl MessageHandler for ViewerInput<'_> {
    fn on_winch(&mut self, winch: Winch) -> Result<()> {
        let resized = WindowSize::from_signed(winch.width, winch.height)
            .and_then(|size| self.session.pty.resize(size));
        match resized {
            Err(err @ ProxyError::InvalidSize { .. }) => {
                tracing::debug!(peer = ?self.peer, error = %err, "ignoring resize");
                Ok(())
            }
            other => other,
        }
    }

    fn on_data(&mut self, data: Data) -> Result<()> {
        self.session.input.append(data.payload());
        Ok(())
    }

    fn on_end(&mut self, end: &StreamEnd) {
        match end {
            StreamEnd::Closed => tracing::info!(peer = ?self.peer, "viewer disconnected"),
            StreamEnd::Failed(err) => {
                tracing::info!(peer = ?self.peer, error = %err, "viewer dropped")
            }
        }
    }
}
