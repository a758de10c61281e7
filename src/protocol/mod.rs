//! # Protocol Adapters
//!
//! Every transport the server speaks is reduced to the same [`TerminalIo`] before a
//! session ever sees it:
//!
//! - [`telnet`] - raw TCP with RFC 854 option negotiation (ECHO, SGA, NAWS)
//! - [`ssh`] - russh server with password auth, `shell` and `subsystem sftp` channels
//! - [`sftp`] - read-only SFTP v3 file area served over an SSH subsystem channel
//!
//! An adapter's job ends once it has produced a `TerminalIo`; the session manager owns
//! everything after that. Failures close only the offending connection.
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;

pub mod pump;
pub mod sftp;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod telnet;
pub mod terminal;

pub use terminal::{Style, TermEvent, TermOutput, TermPeer, TermWriter, TerminalIo, WindowSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Telnet,
    Ssh,
    Sftp,
}

impl ProtocolKind {
    /// Interactive kinds get newline translation and echo; SFTP carries raw bytes.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProtocolKind::Sftp)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolKind::Telnet => "telnet",
            ProtocolKind::Ssh => "ssh",
            ProtocolKind::Sftp => "sftp",
        })
    }
}

/// An accepted transport that has not been negotiated yet.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub kind: ProtocolKind,
}

/// A listener that turns raw connections into terminals.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Connection>;

    /// Run the protocol handshake and hand back the session's terminal.
    async fn negotiate(&self, conn: Connection) -> Result<TerminalIo>;

    /// Tell a connection we cannot serve it, then close it. Used before negotiation
    /// when the server is at capacity.
    async fn refuse(&self, conn: Connection, reason: &str) -> Result<()> {
        let mut stream = conn.stream;
        stream.write_all(reason.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.shutdown().await?;
        Ok(())
    }
}
