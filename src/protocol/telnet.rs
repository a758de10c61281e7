//! Telnet adapter and incremental IAC codec.
//!
//! On connect the server offers `WILL ECHO`, `WILL SGA` and `DO NAWS`, then waits up to
//! the negotiate timeout for answers. Clients that stay silent or refuse still get a
//! session: the server simply keeps the client's local echo and assumes 80x24.
//!
//! The codec can be fed arbitrary chunks; partial commands are kept until the rest
//! arrives.
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::pump;
use super::terminal::{TermEvent, TerminalIo, WindowSize};
use super::{Connection, ProtocolAdapter, ProtocolKind};
use crate::error::{BbsError, Result};
use crate::logutil::hex_preview;

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_NAWS: u8 = 31;

/// Longest subnegotiation we buffer before discarding it.
const MAX_SUBNEG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    /// Saw CR; a following NUL or LF is swallowed.
    Cr,
    Iac,
    Verb(u8),
    Sub,
    SubIac,
}

/// What the peer answered to our offers. `None` means no answer yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Negotiation {
    pub echo: Option<bool>,
    pub sga: Option<bool>,
    pub naws: Option<bool>,
}

impl Negotiation {
    pub fn settled(&self) -> bool {
        self.echo.is_some() && self.sga.is_some() && self.naws.is_some()
    }
}

/// Output of one [`TelnetCodec::decode`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub events: Vec<TermEvent>,
    /// Bytes to send back to the peer (option refusals).
    pub replies: Vec<u8>,
}

#[derive(Debug)]
pub struct TelnetCodec {
    state: State,
    sub: Vec<u8>,
    sub_overflow: bool,
    negotiation: Negotiation,
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            sub: Vec::new(),
            sub_overflow: false,
            negotiation: Negotiation::default(),
        }
    }

    /// The options the server offers on connect.
    pub fn offer() -> Vec<u8> {
        vec![
            IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, DO, OPT_NAWS,
        ]
    }

    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Escape outgoing application data (`0xFF` is doubled).
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 4);
        for &b in data {
            out.push(b);
            if b == IAC {
                out.push(IAC);
            }
        }
        out
    }

    pub fn decode(&mut self, input: &[u8]) -> Decoded {
        let mut out = Decoded::default();
        let mut data = Vec::new();
        for &b in input {
            self.state = match self.state {
                State::Data | State::Cr => {
                    let after_cr = self.state == State::Cr;
                    match b {
                        IAC => State::Iac,
                        0 | b'\n' if after_cr => State::Data,
                        b'\r' => {
                            data.push(b'\r');
                            State::Cr
                        }
                        _ => {
                            data.push(b);
                            State::Data
                        }
                    }
                }
                State::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        State::Data
                    }
                    WILL | WONT | DO | DONT => State::Verb(b),
                    SB => {
                        self.sub.clear();
                        self.sub_overflow = false;
                        State::Sub
                    }
                    // NOP, GA, AYT and friends carry no data for us.
                    _ => State::Data,
                },
                State::Verb(verb) => {
                    self.answer(verb, b, &mut out.replies);
                    State::Data
                }
                State::Sub => match b {
                    IAC => State::SubIac,
                    _ => {
                        self.push_sub(b);
                        State::Sub
                    }
                },
                State::SubIac => match b {
                    SE => {
                        if let Some(ev) = self.finish_sub() {
                            flush_data(&mut data, &mut out.events);
                            out.events.push(ev);
                        }
                        State::Data
                    }
                    IAC => {
                        self.push_sub(IAC);
                        State::Sub
                    }
                    _ => State::Sub,
                },
            };
        }
        flush_data(&mut data, &mut out.events);
        out
    }

    fn push_sub(&mut self, b: u8) {
        if self.sub.len() < MAX_SUBNEG {
            self.sub.push(b);
        } else {
            self.sub_overflow = true;
        }
    }

    fn finish_sub(&mut self) -> Option<TermEvent> {
        if self.sub_overflow {
            return None;
        }
        match self.sub.as_slice() {
            [OPT_NAWS, c0, c1, r0, r1, ..] => {
                let cols = u16::from_be_bytes([*c0, *c1]);
                let rows = u16::from_be_bytes([*r0, *r1]);
                // Some clients report 0x0 before they know their size.
                if cols == 0 || rows == 0 {
                    return None;
                }
                Some(TermEvent::Resize { cols, rows })
            }
            _ => None,
        }
    }

    /// Record the peer's answer to one of our offers, refusing anything else.
    fn answer(&mut self, verb: u8, opt: u8, replies: &mut Vec<u8>) {
        let n = &mut self.negotiation;
        match (verb, opt) {
            (DO, OPT_ECHO) => n.echo = Some(true),
            (DONT, OPT_ECHO) => n.echo = Some(false),
            (DO, OPT_SGA) => n.sga = Some(true),
            (DONT, OPT_SGA) => n.sga = Some(false),
            (WILL, OPT_NAWS) => n.naws = Some(true),
            (WONT, OPT_NAWS) => n.naws = Some(false),
            // Peers offering SGA from their side is harmless; accept once.
            (WILL, OPT_SGA) => {}
            (DO, other) => replies.extend_from_slice(&[IAC, WONT, other]),
            (WILL, other) => replies.extend_from_slice(&[IAC, DONT, other]),
            _ => {}
        }
    }
}

fn flush_data(data: &mut Vec<u8>, events: &mut Vec<TermEvent>) {
    if !data.is_empty() {
        events.push(TermEvent::Data(std::mem::take(data)));
    }
}

/// Telnet listener.
pub struct TelnetAdapter {
    listener: TcpListener,
    negotiate_timeout: Duration,
}

impl TelnetAdapter {
    pub async fn bind(addr: &str, negotiate_timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("telnet listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            negotiate_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl ProtocolAdapter for TelnetAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Telnet
    }

    async fn accept(&self) -> Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(Connection {
            stream,
            peer,
            kind: ProtocolKind::Telnet,
        })
    }

    async fn negotiate(&self, conn: Connection) -> Result<TerminalIo> {
        let Connection { mut stream, peer, .. } = conn;
        let mut codec = TelnetCodec::new();
        stream.write_all(&TelnetCodec::offer()).await?;

        let mut size = WindowSize::default();
        let mut early = Vec::new();
        let deadline = tokio::time::Instant::now() + self.negotiate_timeout;
        let mut buf = [0u8; 512];
        while !codec.negotiation().settled() {
            let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    debug!("telnet {}: negotiation timed out, using defaults", peer);
                    break;
                }
            };
            if n == 0 {
                return Err(BbsError::Protocol(format!(
                    "{} closed during negotiation",
                    peer
                )));
            }
            debug!("telnet {} <- {}", peer, hex_preview(&buf[..n]));
            let decoded = codec.decode(&buf[..n]);
            if !decoded.replies.is_empty() {
                stream.write_all(&decoded.replies).await?;
            }
            for ev in decoded.events {
                match ev {
                    TermEvent::Resize { cols, rows } => size = WindowSize { cols, rows },
                    TermEvent::Data(d) => early.extend_from_slice(&d),
                    TermEvent::Eof => {}
                }
            }
        }

        let negotiation = codec.negotiation();
        if negotiation.echo == Some(false) {
            warn!("telnet {}: client refused server echo", peer);
        }
        let mut io = pump::spawn_telnet(stream, peer, size, codec);
        io.set_echo(negotiation.echo == Some(true));
        io.unread(&early);
        Ok(io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_iac_in_both_directions() {
        assert_eq!(TelnetCodec::encode(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
        let mut codec = TelnetCodec::new();
        let d = codec.decode(&[b'a', IAC, IAC, b'b']);
        assert_eq!(d.events, vec![TermEvent::Data(vec![b'a', IAC, b'b'])]);
    }

    #[test]
    fn folds_cr_nul_and_cr_lf() {
        let mut codec = TelnetCodec::new();
        let d = codec.decode(b"one\r\0two\r\nthree\r");
        assert_eq!(d.events, vec![TermEvent::Data(b"one\rtwo\rthree\r".to_vec())]);
        // The LF that completes a CR LF may arrive in the next chunk.
        let d = codec.decode(b"\nfour");
        assert_eq!(d.events, vec![TermEvent::Data(b"four".to_vec())]);
    }

    #[test]
    fn naws_produces_resize_even_when_split() {
        let mut codec = TelnetCodec::new();
        let first = codec.decode(&[IAC, SB, OPT_NAWS, 0, 100]);
        assert!(first.events.is_empty());
        let second = codec.decode(&[0, 40, IAC, SE, b'x']);
        assert_eq!(
            second.events,
            vec![
                TermEvent::Resize { cols: 100, rows: 40 },
                TermEvent::Data(vec![b'x'])
            ]
        );
    }

    #[test]
    fn naws_with_escaped_255() {
        let mut codec = TelnetCodec::new();
        let d = codec.decode(&[IAC, SB, OPT_NAWS, 0, IAC, IAC, 0, 24, IAC, SE]);
        assert_eq!(d.events, vec![TermEvent::Resize { cols: 255, rows: 24 }]);
    }

    #[test]
    fn records_answers_and_refuses_unknown_options() {
        let mut codec = TelnetCodec::new();
        let d = codec.decode(&[IAC, DO, OPT_ECHO, IAC, DO, OPT_SGA, IAC, WONT, OPT_NAWS, IAC, DO, 24]);
        assert_eq!(d.replies, vec![IAC, WONT, 24]);
        let n = codec.negotiation();
        assert_eq!(n.echo, Some(true));
        assert_eq!(n.naws, Some(false));
        assert!(n.settled());
    }
}
