//! The set of viewers currently attached to the session.
//!
//! Every viewer gets its own writer task fed by a bounded queue, so a viewer
//! that stops reading only ever stalls itself. A viewer whose queue fills up
//! is dropped.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames a viewer may have waiting before it counts as stuck.
pub const QUEUE_DEPTH: usize = 256;

pub type ConnectionId = u64;

/// One encoded frame, shared by every viewer it is queued for.
pub type Frame = Arc<[u8]>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The write side of one viewer's stream.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    queue: Mutex<Option<mpsc::Sender<Frame>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl Connection {
    fn spawn<W>(id: ConnectionId, peer: Option<SocketAddr>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (queue, frames) = mpsc::channel(QUEUE_DEPTH);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let task = tokio::spawn(write_frames(id, Box::new(writer), frames, Arc::clone(&closed)));
        Arc::new(Self {
            id,
            peer,
            queue: Mutex::new(Some(queue)),
            writer: Mutex::new(Some(task)),
            closed,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Queue one complete frame without waiting. Fails when the viewer is
    /// closed or has [`QUEUE_DEPTH`] frames still unwritten.
    pub fn send(&self, frame: Frame) -> io::Result<()> {
        if !self.is_alive() {
            return Err(not_connected());
        }
        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return Err(not_connected());
        };
        queue.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "viewer is not keeping up")
            }
            TrySendError::Closed(_) => not_connected(),
        })
    }

    /// Resolves once the connection is closed from either end: a failed
    /// write, [`abort`](Self::abort) or [`close`](Self::close).
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Drop the viewer now, discarding whatever is still queued.
    pub fn abort(&self) {
        self.closed.send_replace(true);
        self.queue.lock().take();
        if let Some(task) = self.writer.lock().take() {
            task.abort();
        }
    }

    /// Write out what is already queued, then shut down the write side.
    /// A viewer that cannot drain within a short deadline is aborted.
    pub async fn close(&self) {
        self.queue.lock().take();
        let task = self.writer.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                tracing::debug!(id = self.id, "viewer did not drain in time");
                task.abort();
            }
        }
        self.closed.send_replace(true);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.writer.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// Drains one viewer's queue onto its stream until the queue is dropped or a
/// write fails.
async fn write_frames(
    id: ConnectionId,
    mut writer: BoxedWriter,
    mut frames: mpsc::Receiver<Frame>,
    closed: Arc<watch::Sender<bool>>,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::debug!(id, error = %err, "viewer write failed");
            closed.send_replace(true);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[derive(Default)]
struct Inner {
    connections: Vec<Arc<Connection>>,
    closed: bool,
}

/// Registered viewers, in registration order.
///
/// The list lock is never held across I/O: broadcast takes a snapshot,
/// queues the frame for each member, then removes the failed ones by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a viewer and start its writer task. Returns `None` once the
    /// registry has been closed.
    pub fn register<W>(&self, writer: W, peer: Option<SocketAddr>) -> Option<Arc<Connection>>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let conn = Connection::spawn(self.next_id.fetch_add(1, Ordering::Relaxed), peer, writer);
        inner.connections.push(Arc::clone(&conn));
        tracing::debug!(id = conn.id, ?peer, total = inner.connections.len(), "viewer registered");
        Some(conn)
    }

    /// Drop a viewer from the set. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.connections.len();
        inner.connections.retain(|c| c.id != id);
        let removed = inner.connections.len() != before;
        if removed {
            tracing::debug!(id, total = inner.connections.len(), "viewer removed");
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().connections.clone()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().connections.iter().map(|c| c.id).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Queue `frame` for every registered viewer, in registration order.
    ///
    /// Never waits on a viewer. One that is closed or too far behind is
    /// aborted and removed; the rest still get the frame. Returns how many
    /// viewers accepted it.
    pub fn broadcast(&self, frame: impl Into<Frame>) -> usize {
        let frame = frame.into();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in self.snapshot() {
            match conn.send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(id = conn.id, error = %err, "dropping viewer");
                    conn.abort();
                    failed.push(conn.id);
                }
            }
        }
        for id in failed {
            self.remove(id);
        }
        delivered
    }

    /// Refuse new registrations and close every registered viewer, letting
    /// each flush its queue.
    pub async fn close_all(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.connections)
        };
        let mut closing = JoinSet::new();
        for conn in drained {
            closing.spawn(async move { conn.close().await });
        }
        while closing.join_next().await.is_some() {}
    }
}
