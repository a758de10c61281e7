//! Process-wide directory of running sessions.
//!
//! Entries hold a `Weak` to the session's shared state, so the registry never keeps a
//! session alive. Only the session manager mutates it; everyone else reads snapshots.
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::Utc;
use log::debug;

use super::session::{SessionId, SessionInfo, SessionShared};

struct Entry {
    info: SessionInfo,
    shared: Weak<SessionShared>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    entries: Arc<RwLock<HashMap<SessionId, Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn register(&self, info: SessionInfo, shared: &Arc<SessionShared>) {
        debug!("registry: + session {} ({})", info.id, info.peer);
        self.write().insert(
            info.id,
            Entry {
                info,
                shared: Arc::downgrade(shared),
            },
        );
    }

    /// Remove a session. Returns false if it was already gone.
    pub(crate) fn deregister(&self, id: SessionId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            debug!("registry: - session {}", id);
        }
        removed
    }

    pub(crate) fn rename(&self, id: SessionId, username: &str) -> bool {
        match self.write().get_mut(&id) {
            Some(entry) => {
                entry.info.username = Some(username.to_string());
                true
            }
            None => false,
        }
    }

    pub(crate) fn touch(&self, id: SessionId) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.info.last_activity = Utc::now();
        }
    }

    pub(crate) fn shared(&self, id: SessionId) -> Option<Arc<SessionShared>> {
        self.read().get(&id).and_then(|e| e.shared.upgrade())
    }

    pub(crate) fn all_shared(&self) -> Vec<(SessionId, Arc<SessionShared>)> {
        self.read()
            .iter()
            .filter_map(|(id, e)| e.shared.upgrade().map(|s| (*id, s)))
            .collect()
    }

    /// Snapshot of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self.read().values().map(|e| e.info.clone()).collect();
        out.sort_by_key(|i| i.id);
        out
    }

    pub fn find(&self, id: SessionId) -> Option<SessionInfo> {
        self.read().get(&id).map(|e| e.info.clone())
    }

    /// Sessions logged in as `username` (case-insensitive).
    pub fn find_user(&self, username: &str) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .read()
            .values()
            .filter(|e| {
                e.info
                    .username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(username))
            })
            .map(|e| e.info.clone())
            .collect();
        out.sort_by_key(|i| i.id);
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolKind, TerminalIo, WindowSize};
    use tokio::sync::watch;

    fn entry(id: u64) -> (SessionInfo, Arc<SessionShared>, crate::protocol::TermPeer) {
        let peer_addr = "10.0.0.1:2323".parse().unwrap();
        let (io, peer) = TerminalIo::pair(ProtocolKind::Telnet, peer_addr, WindowSize::default());
        let (kill, _) = watch::channel(None);
        let shared = Arc::new(SessionShared {
            writer: io.writer(),
            kill,
        });
        let info = SessionInfo {
            id: SessionId(id),
            username: None,
            kind: ProtocolKind::Telnet,
            peer: peer_addr,
            started_at: Utc::now(),
            last_activity: Utc::now(),
        };
        (info, shared, peer)
    }

    #[test]
    fn deregister_is_idempotent() {
        let reg = SessionRegistry::new();
        let (info, shared, _peer) = entry(1);
        reg.register(info, &shared);
        assert_eq!(reg.len(), 1);
        assert!(reg.deregister(SessionId(1)));
        assert!(!reg.deregister(SessionId(1)));
        assert!(reg.is_empty());
    }

    #[test]
    fn snapshots_do_not_keep_sessions_alive() {
        let reg = SessionRegistry::new();
        let (info, shared, _peer) = entry(2);
        reg.register(info, &shared);
        assert!(reg.rename(SessionId(2), "alice"));
        let snapshot = reg.find(SessionId(2)).unwrap();
        assert_eq!(snapshot.username.as_deref(), Some("alice"));
        assert_eq!(reg.find_user("ALICE").len(), 1);

        drop(shared);
        assert!(reg.shared(SessionId(2)).is_none());
        // The entry stays listed until the supervisor deregisters it.
        assert_eq!(reg.list().len(), 1);
    }
}
