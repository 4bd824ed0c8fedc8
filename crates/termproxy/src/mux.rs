//! Moves bytes between the shared buffers and their sinks.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::framing::Message;
use crate::session::{Session, SessionEnd};

/// Run until the PTY or the console stops accepting writes.
///
/// Each pass drains the whole input buffer into the PTY, then the whole
/// output buffer into `Data` frames queued for every viewer and raw onto the
/// console. When both were empty it sleeps until a producer appends.
///
/// Viewers never make this loop wait; only the PTY and the console can.
pub async fn multiplex<W>(session: &Session, mut console_out: W) -> SessionEnd
where
    W: AsyncWrite + Unpin,
{
    loop {
        let input = session.input().drain();
        if !input.is_empty() {
            if let Err(err) = session.pty().write_all(&input).await {
                tracing::debug!(error = %err, "pty write failed");
                return SessionEnd::PtyClosed;
            }
        }

        let output = session.output().drain();
        if !output.is_empty() {
            for message in Message::data_frames(&output) {
                let frame = message.encode();
                let bytes = frame.len();
                let delivered = session.registry().broadcast(frame);
                tracing::trace!(bytes, delivered, "output broadcast");
            }

            let written = async {
                console_out.write_all(&output).await?;
                console_out.flush().await
            }
            .await;
            if let Err(err) = written {
                tracing::debug!(error = %err, "console write failed");
                return SessionEnd::ConsoleClosed;
            }
        }

        if input.is_empty() && output.is_empty() {
            tokio::select! {
                _ = session.input().ready() => {}
                _ = session.output().ready() => {}
            }
        }
    }
}
