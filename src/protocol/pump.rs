//! Byte pumps between a transport stream and a [`TerminalIo`].
//!
//! Each terminal gets two tasks: a reader that decodes transport bytes into
//! [`TermEvent`]s and a writer that encodes [`TermOutput`]. The writer owns shutdown:
//! when it sees `Close` or all output senders are gone, it closes the stream and stops
//! the reader.
use std::net::SocketAddr;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::telnet::TelnetCodec;
use super::terminal::{TermEvent, TermOutput, TerminalIo, WindowSize};
use super::ProtocolKind;
use crate::logutil::hex_preview;

const READ_BUF: usize = 4096;
const INPUT_QUEUE: usize = 64;

/// How bytes are framed on the wire.
pub enum Codec {
    Telnet(TelnetCodec),
    Raw,
}

/// Terminal over a telnet TCP stream, continuing with an already-negotiated codec.
pub fn spawn_telnet<S>(stream: S, peer: SocketAddr, size: WindowSize, codec: TelnetCodec) -> TerminalIo
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    spawn(stream, ProtocolKind::Telnet, peer, size, Codec::Telnet(codec))
}

/// Terminal over an already-framed byte stream (an SSH channel).
pub fn spawn_raw<S>(stream: S, kind: ProtocolKind, peer: SocketAddr, size: WindowSize) -> TerminalIo
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    spawn(stream, kind, peer, size, Codec::Raw)
}

pub fn spawn<S>(
    stream: S,
    kind: ProtocolKind,
    peer: SocketAddr,
    size: WindowSize,
    codec: Codec,
) -> TerminalIo
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    spawn_with_events(stream, kind, peer, size, codec).0
}

/// Like [`spawn`], also returning a sender for out-of-band events such as SSH
/// `window-change` requests.
pub fn spawn_with_events<S>(
    stream: S,
    kind: ProtocolKind,
    peer: SocketAddr,
    size: WindowSize,
    codec: Codec,
) -> (TerminalIo, mpsc::Sender<TermEvent>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (in_tx, in_rx) = mpsc::channel(INPUT_QUEUE);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (reader, writer) = tokio::io::split(stream);
    let telnet = matches!(codec, Codec::Telnet(_));

    let control = out_tx.clone();
    let read_task = tokio::spawn(read_loop(reader, codec, in_tx.clone(), control, peer));
    let abort = read_task.abort_handle();
    tokio::spawn(async move {
        write_loop(writer, out_rx, telnet, peer).await;
        abort.abort();
    });

    (TerminalIo::new(kind, peer, size, in_rx, out_tx), in_tx)
}

async fn read_loop<R>(
    mut reader: R,
    mut codec: Codec,
    events: mpsc::Sender<TermEvent>,
    control: mpsc::UnboundedSender<TermOutput>,
    peer: SocketAddr,
) where
    R: AsyncRead + Unpin,
{
    // The control sender must not keep the writer alive on its own.
    let control = control.downgrade();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{}: read error: {}", peer, e);
                break;
            }
        };
        trace!("{} <- {}", peer, hex_preview(&buf[..n]));
        let decoded = match &mut codec {
            Codec::Raw => vec![TermEvent::Data(buf[..n].to_vec())],
            Codec::Telnet(tc) => {
                let d = tc.decode(&buf[..n]);
                if !d.replies.is_empty() {
                    if let Some(tx) = control.upgrade() {
                        let _ = tx.send(TermOutput::Control(d.replies));
                    }
                }
                d.events
            }
        };
        for ev in decoded {
            if events.send(ev).await.is_err() {
                return;
            }
        }
    }
    let _ = events.send(TermEvent::Eof).await;
}

async fn write_loop<W>(
    mut writer: W,
    mut output: mpsc::UnboundedReceiver<TermOutput>,
    telnet: bool,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = output.recv().await {
        let result = match out {
            TermOutput::Data(bytes) => {
                let bytes = if telnet {
                    TelnetCodec::encode(&bytes)
                } else {
                    bytes
                };
                writer.write_all(&bytes).await
            }
            TermOutput::Control(bytes) => writer.write_all(&bytes).await,
            TermOutput::Close(reason) => {
                let mut bytes = reason.into_bytes();
                if telnet {
                    bytes = TelnetCodec::encode(&bytes);
                }
                if !bytes.is_empty() {
                    bytes.extend_from_slice(b"\r\n");
                    let _ = writer.write_all(&bytes).await;
                }
                break;
            }
        };
        if let Err(e) = result {
            debug!("{}: write error: {}", peer, e);
            break;
        }
        let _ = writer.flush().await;
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    debug!("{}: transport closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::telnet::{IAC, OPT_NAWS, SB, SE};
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn telnet_pump_decodes_and_escapes() {
        let (server, mut client) = tokio::io::duplex(1024);
        let mut io = spawn_telnet(server, addr(), WindowSize::default(), TelnetCodec::new());

        client
            .write_all(&[IAC, SB, OPT_NAWS, 0, 120, 0, 30, IAC, SE])
            .await
            .unwrap();
        client.write_all(b"hi\r\n").await.unwrap();
        io.set_echo(false);
        assert_eq!(io.read_line().await.unwrap().as_deref(), Some("hi"));
        assert_eq!(io.window_size(), WindowSize { cols: 120, rows: 30 });

        io.write_bytes(&[b'x', IAC]);
        io.close("bye");
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, vec![b'x', IAC, IAC, b'b', b'y', b'e', b'\r', b'\n']);
    }

    #[tokio::test]
    async fn raw_pump_reports_eof() {
        let (server, client) = tokio::io::duplex(64);
        let mut io = spawn_raw(server, ProtocolKind::Sftp, addr(), WindowSize::default());
        drop(client);
        assert_eq!(io.read_bytes().await.unwrap(), None);
    }
}
