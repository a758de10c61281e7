//! SSH adapter built on russh.
//!
//! One SSH connection yields at most one session: the first `shell` request produces a
//! terminal of kind `Ssh`, a `subsystem sftp` request one of kind `Sftp`. Password
//! checks are delegated to the board's [`Authenticator`].
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodSet};
use russh_keys::key::KeyPair;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use super::pump::{self, Codec};
use super::terminal::{TermEvent, TerminalIo, WindowSize};
use super::{Connection, ProtocolAdapter, ProtocolKind};
use crate::bbs::auth::Authenticator;
use crate::config::SshConfig;
use crate::error::{BbsError, Result};
use crate::logutil::escape_log;

/// Load the configured host key, or generate a throwaway one.
pub fn load_host_key(path: Option<&str>) -> Result<KeyPair> {
    match path {
        Some(p) => {
            if !Path::new(p).exists() {
                return Err(BbsError::NotFound(format!(
                    "ssh host key {} (create one with: ssh-keygen -t ed25519 -N '' -f {})",
                    p, p
                )));
            }
            russh_keys::load_secret_key(p, None)
                .map_err(|e| BbsError::Protocol(format!("cannot load ssh host key {}: {}", p, e)))
        }
        None => {
            warn!("no ssh.host_key_path configured, generating an ephemeral host key");
            KeyPair::generate_ed25519()
                .ok_or_else(|| BbsError::InternalFault("ed25519 key generation failed".into()))
        }
    }
}

/// What the channel handler hands back to [`SshAdapter::negotiate`].
type Ready = oneshot::Sender<TerminalIo>;

struct SshHandler {
    peer: SocketAddr,
    auth: Arc<dyn Authenticator>,
    allow_anonymous: bool,
    anonymous_names: Arc<Vec<String>>,
    sftp_enabled: bool,
    username: Option<String>,
    channel: Option<Channel<Msg>>,
    size: WindowSize,
    ready: Option<Ready>,
    resize: Option<mpsc::Sender<TermEvent>>,
}

impl SshHandler {
    /// Turn the pending channel into a terminal and hand it to the adapter.
    fn start(&mut self, id: ChannelId, kind: ProtocolKind, session: &mut Session) -> bool {
        let (Some(channel), Some(ready)) = (self.channel.take(), self.ready.take()) else {
            return false;
        };
        if channel.id() != id {
            self.channel = Some(channel);
            self.ready = Some(ready);
            return false;
        }
        let (mut io, events) =
            pump::spawn_with_events(channel.into_stream(), kind, self.peer, self.size, Codec::Raw);
        io.set_authenticated_user(self.username.clone());
        self.resize = Some(events);
        let _ = session.channel_success(id);
        ready.send(io).is_ok()
    }
}

#[async_trait]
impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> std::result::Result<Auth, Self::Error> {
        if self.allow_anonymous
            && self
                .anonymous_names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(user))
        {
            info!(target: "security", "ssh {}: anonymous login as {}", self.peer, escape_log(user));
            self.username = None;
            return Ok(Auth::Accept);
        }
        match self.auth.authenticate(user, password).await {
            Ok(name) => {
                self.username = Some(name);
                Ok(Auth::Accept)
            }
            Err(e) => {
                debug!("ssh {}: auth rejected: {}", self.peer, e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        if self.channel.is_some() || self.ready.is_none() {
            // One terminal per connection.
            return Ok(false);
        }
        self.channel = Some(channel);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if col_width > 0 && row_height > 0 {
            self.size = WindowSize {
                cols: col_width.min(u32::from(u16::MAX)) as u16,
                rows: row_height.min(u32::from(u16::MAX)) as u16,
            };
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if !self.start(channel, ProtocolKind::Ssh, session) {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if name == "sftp" && self.sftp_enabled && self.start(channel, ProtocolKind::Sftp, session) {
            return Ok(());
        }
        debug!("ssh {}: refused subsystem {}", self.peer, escape_log(name));
        let _ = session.channel_failure(channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(tx) = &self.resize {
            let _ = tx.try_send(TermEvent::Resize {
                cols: col_width.min(u32::from(u16::MAX)) as u16,
                rows: row_height.min(u32::from(u16::MAX)) as u16,
            });
        }
        Ok(())
    }
}

const SSH_MSG_DISCONNECT: u8 = 1;
const SSH_DISCONNECT_TOO_MANY_CONNECTIONS: u32 = 12;
const SERVER_ID: &[u8] = b"SSH-2.0-termbbs\r\n";

/// An unencrypted SSH_MSG_DISCONNECT packet. Before key exchange the `none` cipher and
/// MAC are in effect, so clients report the reason instead of a bare connection reset.
fn disconnect_packet(reason: &str) -> Vec<u8> {
    let mut payload = BytesMut::new();
    payload.put_u8(SSH_MSG_DISCONNECT);
    payload.put_u32(SSH_DISCONNECT_TOO_MANY_CONNECTIONS);
    payload.put_u32(reason.len() as u32);
    payload.put_slice(reason.as_bytes());
    payload.put_u32(0); // language tag

    // Length field, padding length byte, payload and padding add up to a multiple of 8.
    let mut padding = 8 - (5 + payload.len()) % 8;
    if padding < 4 {
        padding += 8;
    }
    let mut packet = BytesMut::with_capacity(5 + payload.len() + padding);
    packet.put_u32((1 + payload.len() + padding) as u32);
    packet.put_u8(padding as u8);
    packet.put_slice(&payload);
    packet.put_bytes(0, padding);
    packet.to_vec()
}

/// SSH listener.
pub struct SshAdapter {
    listener: TcpListener,
    server_config: Arc<russh::server::Config>,
    auth: Arc<dyn Authenticator>,
    allow_anonymous: bool,
    anonymous_names: Arc<Vec<String>>,
    sftp_enabled: bool,
    handshake_timeout: Duration,
}

impl SshAdapter {
    pub async fn bind(cfg: &SshConfig, sftp_enabled: bool, auth: Arc<dyn Authenticator>) -> Result<Self> {
        let key = load_host_key(cfg.host_key_path.as_deref())?;
        let server_config = russh::server::Config {
            keys: vec![key],
            methods: MethodSet::PASSWORD,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            inactivity_timeout: None,
            ..Default::default()
        };
        let listener = TcpListener::bind(&cfg.bind).await?;
        info!("ssh listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            server_config: Arc::new(server_config),
            auth,
            allow_anonymous: cfg.allow_anonymous,
            anonymous_names: Arc::new(cfg.anonymous_names.clone()),
            sftp_enabled,
            handshake_timeout: cfg.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl ProtocolAdapter for SshAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ssh
    }

    async fn accept(&self) -> Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(Connection {
            stream,
            peer,
            kind: ProtocolKind::Ssh,
        })
    }

    async fn negotiate(&self, conn: Connection) -> Result<TerminalIo> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = SshHandler {
            peer: conn.peer,
            auth: self.auth.clone(),
            allow_anonymous: self.allow_anonymous,
            anonymous_names: self.anonymous_names.clone(),
            sftp_enabled: self.sftp_enabled,
            username: None,
            channel: None,
            size: WindowSize::default(),
            ready: Some(ready_tx),
            resize: None,
        };
        let peer = conn.peer;
        // One deadline covers the id exchange inside run_stream and the wait for a shell.
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        let running = match tokio::time::timeout_at(
            deadline,
            russh::server::run_stream(self.server_config.clone(), conn.stream, handler),
        )
        .await
        {
            Ok(started) => started.map_err(|e| BbsError::Protocol(format!("ssh {}: {}", peer, e)))?,
            Err(_) => return Err(BbsError::Timeout(format!("ssh handshake with {}", peer))),
        };
        let connection = tokio::spawn(async move {
            if let Err(e) = running.await {
                debug!("ssh {}: connection ended: {}", peer, e);
            }
        });

        match tokio::time::timeout_at(deadline, ready_rx).await {
            Ok(Ok(io)) => Ok(io),
            Ok(Err(_)) => {
                connection.abort();
                Err(BbsError::Protocol(format!(
                    "ssh {} closed before opening a shell",
                    peer
                )))
            }
            Err(_) => {
                connection.abort();
                Err(BbsError::Timeout(format!("ssh handshake with {}", peer)))
            }
        }
    }

    async fn refuse(&self, conn: Connection, reason: &str) -> Result<()> {
        let mut stream = conn.stream;
        stream.write_all(SERVER_ID).await?;
        stream.write_all(&disconnect_packet(reason)).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
