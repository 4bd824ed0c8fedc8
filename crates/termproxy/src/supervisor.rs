//! Process-level startup and shutdown for the sharing server.

use std::sync::{Arc, Weak};

use nix::sys::signal::Signal;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::ServerArgs;
use crate::console::{self, RawTerminal};
use crate::error::{ProxyError, Result};
use crate::session::{Session, SessionEnd};
use crate::tls;

/// Bring the session up and run it to completion.
///
/// Order matters for exit codes and for the operator's terminal: TLS
/// material and the listener are checked before raw mode is entered, and
/// the raw-mode guard is owned by the session from the moment it exists so
/// teardown always restores it.
pub async fn run_server(args: &ServerArgs) -> Result<SessionEnd> {
    let acceptor = tls::server_acceptor(&args.ca, &args.cert, &args.key)?;
    let listener = TcpListener::bind(&args.listen)
        .await
        .map_err(|e| ProxyError::Network(format!("could not listen on {}: {e}", args.listen)))?;

    let console = RawTerminal::acquire()?;
    let size = console::window_size()?;
    let command = args.command();
    let session = Session::start(&command, size)?;
    session.hold_console(console);
    tracing::info!(%command, %size, pid = ?session.pty().pid(), "session started");

    session.spawn_engine(tokio::io::stdin(), tokio::io::stdout());
    session.spawn_accept_loop(listener, acceptor);
    forward_sigterm(Arc::downgrade(&session))?;

    Ok(session.wait().await)
}

/// Pass SIGTERM on to the child; its exit then ends the session normally.
fn forward_sigterm(session: Weak<Session>) -> Result<()> {
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| ProxyError::Terminal(format!("could not install SIGTERM handler: {e}")))?;
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            let Some(session) = session.upgrade() else {
                break;
            };
            tracing::info!("forwarding SIGTERM to child");
            if let Err(err) = session.pty().signal(Signal::SIGTERM) {
                tracing::warn!(error = %err, "could not forward SIGTERM");
            }
        }
    });
    Ok(())
}
