use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::manager::SessionManager;
use crate::error::Result;
use crate::protocol::{ProtocolKind, TermWriter, TerminalIo};
use crate::storage::ProxyHandle;
use crate::validation::validate_user_name;

/// Identifier of a session, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// # Session Information
///
/// A point-in-time description of one connected session. The registry hands out
/// copies; holding one never keeps the session alive.
///
/// ## Lifecycle
///
/// 1. **Admitted** - a capacity permit is held, no `SessionInfo` exists yet
/// 2. **Running** - registered, `username` is `None` until the user logs in
/// 3. **Ended** - deregistered by the supervisor after its proxy handle is released
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub username: Option<String>,
    pub kind: ProtocolKind,
    pub peer: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionInfo {
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| format!("guest{}", self.id))
    }

    pub fn is_logged_in(&self) -> bool {
        self.username.is_some()
    }

    /// Human-readable time since the session started ("5m", "2h03m").
    pub fn online_for(&self) -> String {
        let secs = (Utc::now() - self.started_at).num_seconds().max(0);
        let mins = secs / 60;
        if mins < 60 {
            format!("{}m", mins)
        } else {
            format!("{}h{:02}m", mins / 60, mins % 60)
        }
    }
}

/// State shared between a session's supervisor and anyone holding its registry entry.
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) writer: TermWriter,
    pub(crate) kill: watch::Sender<Option<String>>,
}

/// Everything an application sees of its session.
pub struct SessionContext {
    pub info: SessionInfo,
    pub io: TerminalIo,
    pub db: ProxyHandle,
    manager: SessionManager,
}

impl SessionContext {
    pub(crate) fn new(info: SessionInfo, io: TerminalIo, db: ProxyHandle, manager: SessionManager) -> Self {
        Self {
            info,
            io,
            db,
            manager,
        }
    }

    pub fn id(&self) -> SessionId {
        self.info.id
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Bind the session to a user account, visible to `WHO` from now on.
    pub fn set_username(&mut self, username: &str) -> Result<()> {
        let name = validate_user_name(username)
            .map_err(|e| crate::error::BbsError::Validation(e.to_string()))?;
        self.manager.registry().rename(self.info.id, &name);
        self.info.username = Some(name);
        Ok(())
    }

    /// Record user input for `WHO` idle display.
    pub fn touch(&mut self) {
        self.info.last_activity = Utc::now();
        self.manager.registry().touch(self.info.id);
    }
}

/// The logic that runs inside one session's task.
///
/// Returning ends the session normally; an error ends it as a fault. Either way the
/// manager releases the proxy handle and deregisters the session afterwards.
#[async_trait]
pub trait SessionApp: Send + Sync {
    async fn run(&self, ctx: &mut SessionContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_guest_id() {
        let mut info = SessionInfo {
            id: SessionId(7),
            username: None,
            kind: ProtocolKind::Telnet,
            peer: "127.0.0.1:1".parse().unwrap(),
            started_at: Utc::now(),
            last_activity: Utc::now(),
        };
        assert_eq!(info.display_name(), "guest7");
        assert!(!info.is_logged_in());
        info.username = Some("alice".into());
        assert_eq!(info.display_name(), "alice");
        assert_eq!(info.online_for(), "0m");
    }
}
