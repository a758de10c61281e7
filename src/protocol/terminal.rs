//! Canonical terminal I/O shared by every protocol.
//!
//! A [`TerminalIo`] is a pair of channels: decoded input events flow in, output flows
//! out to whatever pump owns the transport. Sessions never touch sockets. Tests build
//! terminals with [`TerminalIo::pair`] and drive them through the returned [`TermPeer`].
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use super::ProtocolKind;
use crate::error::{BbsError, Result};

const INPUT_QUEUE: usize = 64;
const MAX_LINE: usize = 1024;

/// Message carried by the [`BbsError::Timeout`] a read returns after the idle limit.
pub const IDLE_TIMEOUT: &str = "idle session";

/// Decoded input from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermEvent {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Eof,
}

/// Output toward the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermOutput {
    /// Application bytes; the pump applies protocol escaping.
    Data(Vec<u8>),
    /// Protocol control bytes, written as-is.
    Control(Vec<u8>),
    /// Write a final message and close the transport.
    Close(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Plain,
    Bold,
    /// Server notices (broadcasts, private messages).
    Notice,
    Error,
}

impl Style {
    fn sgr(&self) -> &'static str {
        match self {
            Style::Plain => "",
            Style::Bold => "\x1b[1m",
            Style::Notice => "\x1b[1;33m",
            Style::Error => "\x1b[1;31m",
        }
    }
}

/// Translate lone `\n` into `\r\n`.
pub fn crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev = '\0';
    for ch in text.chars() {
        if ch == '\n' && prev != '\r' {
            out.push('\r');
        }
        out.push(ch);
        prev = ch;
    }
    out
}

/// Clonable output side of a terminal.
///
/// The session manager keeps one to deliver final messages after the session task
/// is gone.
#[derive(Debug, Clone)]
pub struct TermWriter {
    tx: mpsc::UnboundedSender<TermOutput>,
    kind: ProtocolKind,
}

impl TermWriter {
    /// Returns false once the transport is gone.
    pub fn write_bytes(&self, bytes: &[u8]) -> bool {
        self.tx.send(TermOutput::Data(bytes.to_vec())).is_ok()
    }

    pub fn write_str(&self, text: &str) -> bool {
        if self.kind.is_terminal() {
            self.write_bytes(crlf(text).as_bytes())
        } else {
            self.write_bytes(text.as_bytes())
        }
    }

    pub fn write_line(&self, text: &str) -> bool {
        self.write_str(&format!("{}\n", text))
    }

    pub fn write_styled(&self, style: Style, text: &str) -> bool {
        if !self.kind.is_terminal() || style == Style::Plain {
            return self.write_str(text);
        }
        self.write_str(&format!("{}{}\x1b[0m", style.sgr(), text))
    }

    /// Send `reason` as the last line and close the transport.
    pub fn close(&self, reason: &str) -> bool {
        let reason = if self.kind.is_terminal() {
            crlf(reason)
        } else {
            reason.to_string()
        };
        self.tx.send(TermOutput::Close(reason)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The transport-facing end of an in-memory terminal.
#[derive(Debug)]
pub struct TermPeer {
    pub input: mpsc::Sender<TermEvent>,
    pub output: mpsc::UnboundedReceiver<TermOutput>,
}

impl TermPeer {
    pub async fn send(&self, bytes: &[u8]) -> bool {
        self.input.send(TermEvent::Data(bytes.to_vec())).await.is_ok()
    }

    pub async fn send_line(&self, line: &str) -> bool {
        self.send(format!("{}\r", line).as_bytes()).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        self.input.send(TermEvent::Resize { cols, rows }).await.is_ok()
    }

    pub async fn eof(&self) -> bool {
        self.input.send(TermEvent::Eof).await.is_ok()
    }

    /// Collect output until `needle` shows up, the terminal closes, or `wait` elapses.
    /// Returns everything collected as lossy UTF-8.
    pub async fn read_until(&mut self, needle: &str, wait: Duration) -> String {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if String::from_utf8_lossy(&seen).contains(needle) {
                break;
            }
            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(TermOutput::Data(b))) => seen.extend_from_slice(&b),
                Ok(Some(TermOutput::Control(_))) => {}
                Ok(Some(TermOutput::Close(reason))) => {
                    seen.extend_from_slice(reason.as_bytes());
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }
}

/// Line/char input, styled output and resize tracking over a pair of channels.
#[derive(Debug)]
pub struct TerminalIo {
    kind: ProtocolKind,
    peer: SocketAddr,
    input: mpsc::Receiver<TermEvent>,
    writer: TermWriter,
    size: WindowSize,
    pending: VecDeque<u8>,
    echo: bool,
    eof: bool,
    skip_lf: bool,
    idle_timeout: Option<Duration>,
    authenticated_user: Option<String>,
}

impl TerminalIo {
    pub fn new(
        kind: ProtocolKind,
        peer: SocketAddr,
        size: WindowSize,
        input: mpsc::Receiver<TermEvent>,
        output: mpsc::UnboundedSender<TermOutput>,
    ) -> Self {
        Self {
            kind,
            peer,
            input,
            writer: TermWriter { tx: output, kind },
            size,
            pending: VecDeque::new(),
            echo: kind.is_terminal(),
            eof: false,
            skip_lf: false,
            idle_timeout: None,
            authenticated_user: None,
        }
    }

    /// An in-memory terminal and its transport-facing end.
    pub fn pair(kind: ProtocolKind, peer: SocketAddr, size: WindowSize) -> (Self, TermPeer) {
        let (in_tx, in_rx) = mpsc::channel(INPUT_QUEUE);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let io = Self::new(kind, peer, size, in_rx, out_tx);
        (
            io,
            TermPeer {
                input: in_tx,
                output: out_rx,
            },
        )
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn window_size(&self) -> WindowSize {
        self.size
    }

    pub fn writer(&self) -> TermWriter {
        self.writer.clone()
    }

    /// Account the transport already authenticated (SSH password auth).
    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    pub fn set_authenticated_user(&mut self, username: Option<String>) {
        self.authenticated_user = username;
    }

    /// Whether typed characters are echoed back by the server.
    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    /// Reads waiting longer than this fail with [`BbsError::Timeout`].
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    /// Push input back to the front of the queue, e.g. bytes that arrived during
    /// negotiation.
    pub fn unread(&mut self, bytes: &[u8]) {
        for b in bytes.iter().rev() {
            self.pending.push_front(*b);
        }
    }

    async fn next_event(&mut self) -> Result<Option<TermEvent>> {
        if self.eof {
            return Ok(None);
        }
        let event = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.input.recv())
                .await
                .map_err(|_| BbsError::Timeout(IDLE_TIMEOUT.into()))?,
            None => self.input.recv().await,
        };
        match event {
            Some(TermEvent::Eof) | None => {
                self.eof = true;
                Ok(None)
            }
            Some(ev) => Ok(Some(ev)),
        }
    }

    /// Next raw input chunk, or `None` at end of input. Resize events are applied
    /// and skipped.
    pub async fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.drain(..).collect()));
        }
        loop {
            match self.next_event().await? {
                Some(TermEvent::Data(bytes)) if !bytes.is_empty() => return Ok(Some(bytes)),
                Some(TermEvent::Resize { cols, rows }) => self.size = WindowSize { cols, rows },
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }

    async fn read_byte(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(Some(b));
        }
        match self.read_bytes().await? {
            Some(bytes) => {
                self.pending.extend(bytes);
                Ok(self.pending.pop_front())
            }
            None => Ok(None),
        }
    }

    /// Wait for the next resize or data event. Returns the new size if a resize came
    /// first; data is kept for the next read.
    pub async fn wait_resize(&mut self) -> Result<Option<WindowSize>> {
        match self.next_event().await? {
            Some(TermEvent::Resize { cols, rows }) => {
                self.size = WindowSize { cols, rows };
                Ok(Some(self.size))
            }
            Some(TermEvent::Data(bytes)) => {
                self.pending.extend(bytes);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Read one character. `None` at end of input.
    pub async fn read_char(&mut self) -> Result<Option<char>> {
        let Some(first) = self.read_byte().await? else {
            return Ok(None);
        };
        let width = match first {
            0x00..=0x7f => 1,
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        let mut buf = vec![first];
        while buf.len() < width {
            match self.read_byte().await? {
                Some(b) => buf.push(b),
                None => break,
            }
        }
        Ok(Some(
            String::from_utf8_lossy(&buf)
                .chars()
                .next()
                .unwrap_or(char::REPLACEMENT_CHARACTER),
        ))
    }

    /// Read a line with local editing. `None` at end of input.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        self.read_line_inner(None).await
    }

    /// Read a line echoing `mask` instead of the typed characters.
    pub async fn read_masked(&mut self, mask: char) -> Result<Option<String>> {
        self.read_line_inner(Some(mask)).await
    }

    async fn read_line_inner(&mut self, mask: Option<char>) -> Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let Some(b) = self.read_byte().await? else {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            };
            let skip_lf = std::mem::replace(&mut self.skip_lf, false);
            match b {
                b'\r' => {
                    self.skip_lf = true;
                    break;
                }
                b'\n' if skip_lf => continue,
                b'\n' => break,
                0x08 | 0x7f => {
                    if pop_char(&mut line) {
                        self.echo_bytes(b"\x08 \x08");
                    }
                }
                0x03 => {
                    line.clear();
                    self.echo_bytes(b"^C\r\n");
                }
                b if b < 0x20 => {}
                b => {
                    if line.len() >= MAX_LINE {
                        continue;
                    }
                    line.push(b);
                    match mask {
                        // Echo the mask once per character, not per byte.
                        Some(m) if b & 0xc0 != 0x80 => {
                            let mut tmp = [0u8; 4];
                            let s = m.encode_utf8(&mut tmp);
                            self.echo_bytes(s.as_bytes());
                        }
                        Some(_) => {}
                        None => self.echo_bytes(&[b]),
                    }
                }
            }
        }
        self.echo_bytes(b"\r\n");
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn echo_bytes(&self, bytes: &[u8]) {
        if self.echo {
            self.writer.write_bytes(bytes);
        }
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> bool {
        self.writer.write_bytes(bytes)
    }

    pub fn write_str(&self, text: &str) -> bool {
        self.writer.write_str(text)
    }

    pub fn write_line(&self, text: &str) -> bool {
        self.writer.write_line(text)
    }

    pub fn write_styled(&self, style: Style, text: &str) -> bool {
        self.writer.write_styled(style, text)
    }

    pub fn close(&self, reason: &str) -> bool {
        self.writer.close(reason)
    }
}

/// Remove the last UTF-8 character from `line`.
fn pop_char(line: &mut Vec<u8>) -> bool {
    let mut popped = false;
    while let Some(b) = line.pop() {
        popped = true;
        if b & 0xc0 != 0x80 {
            break;
        }
    }
    popped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn line_editing_handles_backspace_and_crlf() {
        let (mut io, peer) = TerminalIo::pair(ProtocolKind::Telnet, peer_addr(), WindowSize::default());
        peer.send(b"helx\x7flo\r\nnext\n").await;
        assert_eq!(io.read_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(io.read_line().await.unwrap().as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn masked_read_hides_input() {
        let (mut io, mut peer) =
            TerminalIo::pair(ProtocolKind::Ssh, peer_addr(), WindowSize::default());
        peer.send(b"s3cret\r").await;
        assert_eq!(io.read_masked('*').await.unwrap().as_deref(), Some("s3cret"));
        let echoed = peer.read_until("\r\n", Duration::from_millis(200)).await;
        assert!(echoed.contains("******"));
        assert!(!echoed.contains("s3cret"));
    }

    #[tokio::test]
    async fn resize_updates_window_size() {
        let (mut io, peer) = TerminalIo::pair(ProtocolKind::Telnet, peer_addr(), WindowSize::default());
        peer.resize(132, 50).await;
        peer.send(b"x").await;
        assert_eq!(io.read_char().await.unwrap(), Some('x'));
        assert_eq!(io.window_size(), WindowSize { cols: 132, rows: 50 });
    }

    #[tokio::test]
    async fn eof_ends_reads() {
        let (mut io, peer) = TerminalIo::pair(ProtocolKind::Telnet, peer_addr(), WindowSize::default());
        peer.send(b"partial").await;
        peer.eof().await;
        assert_eq!(io.read_line().await.unwrap().as_deref(), Some("partial"));
        assert_eq!(io.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn idle_timeout_surfaces_as_timeout() {
        let (mut io, _peer) = TerminalIo::pair(ProtocolKind::Telnet, peer_addr(), WindowSize::default());
        io.set_idle_timeout(Some(Duration::from_millis(20)));
        assert!(matches!(io.read_line().await, Err(BbsError::Timeout(_))));
    }

    #[test]
    fn crlf_translation_is_idempotent() {
        assert_eq!(crlf("a\nb\r\nc"), "a\r\nb\r\nc");
    }

    #[tokio::test]
    async fn sftp_output_is_not_translated() {
        let (io, mut peer) = TerminalIo::pair(ProtocolKind::Sftp, peer_addr(), WindowSize::default());
        io.write_str("a\nb");
        match peer.output.recv().await {
            Some(TermOutput::Data(b)) => assert_eq!(b, b"a\nb"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
