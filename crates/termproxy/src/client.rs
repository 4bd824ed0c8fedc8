//! The viewer side: forward the local terminal to a session and render what
//! comes back.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::console;
use crate::error::{ProxyError, Result};
use crate::framing::{decode_one, DecodeError, Handshake, Message};
use crate::pty::WindowSize;

const READ_CHUNK: usize = 4096;

/// Which side ended the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEnd {
    ServerClosed,
    ConsoleClosed,
}

pub async fn send_handshake<W>(stream: &mut W, size: WindowSize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    Handshake {
        rows: size.rows,
        cols: size.cols,
    }
    .write_to(stream)
    .await
    .map_err(ProxyError::ConnectionIo)
}

fn winch_for(size: WindowSize) -> Message {
    let clamp = |v: u16| i16::try_from(v).unwrap_or(i16::MAX);
    Message::winch(clamp(size.cols), clamp(size.rows))
}

/// Relay between the console and an established session stream until
/// either side closes.
///
/// Console bytes go out as `Data` frames and every size on `resizes` as a
/// `Winch`. `Data` frames from the server are written raw to the console.
pub async fn run<S, R, W>(
    stream: S,
    mut console_in: R,
    mut console_out: W,
    mut resizes: mpsc::UnboundedReceiver<WindowSize>,
) -> Result<ClientEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::select! {
        end = pump_console(&mut console_in, &mut writer, &mut resizes) => end,
        end = pump_server(&mut reader, &mut console_out) => end,
    }
}

async fn pump_console<R, W>(
    console_in: &mut R,
    writer: &mut W,
    resizes: &mut mpsc::UnboundedReceiver<WindowSize>,
) -> Result<ClientEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut resizes_open = true;
    loop {
        tokio::select! {
            read = console_in.read(&mut buf) => {
                let n = read.map_err(|e| ProxyError::Terminal(format!("console read failed: {e}")))?;
                if n == 0 {
                    return Ok(ClientEnd::ConsoleClosed);
                }
                Message::data(&buf[..n])
                    .write_to(writer)
                    .await
                    .map_err(ProxyError::ConnectionIo)?;
            }
            size = resizes.recv(), if resizes_open => match size {
                Some(size) => {
                    tracing::debug!(%size, "sending resize");
                    winch_for(size)
                        .write_to(writer)
                        .await
                        .map_err(ProxyError::ConnectionIo)?;
                }
                None => resizes_open = false,
            },
        }
    }
}

async fn pump_server<R, W>(reader: &mut R, console_out: &mut W) -> Result<ClientEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let console_err = |e: std::io::Error| ProxyError::Terminal(format!("console write failed: {e}"));
    loop {
        match decode_one(reader).await {
            Ok(Message::Data(data)) => {
                console_out.write_all(data.payload()).await.map_err(console_err)?;
                console_out.flush().await.map_err(console_err)?;
            }
            Ok(Message::Winch(winch)) => {
                tracing::debug!(?winch, "ignoring resize from server");
            }
            Err(DecodeError::Closed) => return Ok(ClientEnd::ServerClosed),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Deliver the console size every time the terminal is resized.
pub fn watch_resizes() -> Result<mpsc::UnboundedReceiver<WindowSize>> {
    let mut winch = signal(SignalKind::window_change())
        .map_err(|e| ProxyError::Terminal(format!("could not watch for resizes: {e}")))?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            match console::window_size() {
                Ok(size) => {
                    if tx.send(size).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::debug!(error = %err, "could not read console size"),
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Winch, HANDSHAKE_LEN};
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_is_rows_then_cols() {
        let mut out = Vec::<u8>::new();
        send_handshake(&mut out, WindowSize::new(30, 20)).await.unwrap();
        assert_eq!(out.len(), HANDSHAKE_LEN);
        assert_eq!(out, [20, 0, 30, 0]);
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (client_side, mut server) = duplex(4096);
        let (console_in, mut keyboard) = duplex(4096);
        let (console_out, mut screen) = duplex(4096);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();

        let client = tokio::spawn(run(client_side, console_in, console_out, resize_rx));

        keyboard.write_all(b"ls\r").await.unwrap();
        let msg = decode_one(&mut server).await.unwrap();
        assert_eq!(msg, Message::data(&b"ls\r"[..]));

        resize_tx.send(WindowSize::new(120, 50)).unwrap();
        let msg = decode_one(&mut server).await.unwrap();
        assert_eq!(
            msg,
            Message::Winch(Winch {
                width: 120,
                height: 50
            })
        );

        Message::data(&b"total 0\r\n"[..])
            .write_to(&mut server)
            .await
            .unwrap();
        let mut shown = [0u8; 9];
        screen.read_exact(&mut shown).await.unwrap();
        assert_eq!(&shown, b"total 0\r\n");

        drop(server);
        let end = tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .expect("client did not notice the server closing")
            .unwrap()
            .unwrap();
        assert_eq!(end, ClientEnd::ServerClosed);
    }

    #[tokio::test]
    async fn console_eof_ends_the_client() {
        let (client_side, _server) = duplex(4096);
        let (console_in, keyboard) = duplex(4096);
        let (console_out, _screen) = duplex(4096);
        let (_resize_tx, resize_rx) = mpsc::unbounded_channel();

        drop(keyboard);
        let end = run(client_side, console_in, console_out, resize_rx)
            .await
            .unwrap();
        assert_eq!(end, ClientEnd::ConsoleClosed);
    }

    #[tokio::test]
    async fn garbage_from_server_is_a_protocol_error() {
        let (client_side, mut server) = duplex(4096);
        let (console_in, _keyboard) = duplex(4096);
        let (console_out, _screen) = duplex(4096);
        let (_resize_tx, resize_rx) = mpsc::unbounded_channel();

        server.write_all(&[9, 0]).await.unwrap();
        let err = run(client_side, console_in, console_out, resize_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Decode(DecodeError::UnknownType(9))), "{err:?}");
    }

    #[test]
    fn oversized_console_dimensions_are_clamped() {
        assert_eq!(winch_for(WindowSize::new(u16::MAX, 24)), Message::winch(i16::MAX, 24));
    }
}
