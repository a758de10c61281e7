//! Session admission, supervision and teardown.
//!
//! Each admitted connection runs in its own tokio task, watched by a supervisor task.
//! The supervisor is the only place a session ends: whether the application returns,
//! faults, panics or is killed via [`SessionManager::terminate`], the supervisor
//!
//! 1. sends the final message and closes the terminal,
//! 2. disconnects the session's proxy handle and waits for the engine to confirm its
//!    locks are released,
//! 3. deregisters the session and returns the capacity permit.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::registry::SessionRegistry;
use super::session::{SessionApp, SessionContext, SessionId, SessionInfo, SessionShared};
use crate::error::{BbsError, Result};
use crate::logutil::escape_log;
use crate::metrics;
use crate::protocol::terminal::IDLE_TIMEOUT;
use crate::protocol::{Style, TerminalIo};
use crate::storage::DbProxy;

/// Proof that capacity was reserved for one session. Dropping it frees the slot.
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Completed,
    Terminated(String),
    IdleTimeout,
    Fault(String),
}

impl SessionExit {
    fn farewell(&self) -> String {
        match self {
            SessionExit::Completed => "Goodbye.".to_string(),
            SessionExit::Terminated(reason) => reason.clone(),
            SessionExit::IdleTimeout => "Idle timeout, disconnecting.".to_string(),
            SessionExit::Fault(_) => "Internal error, session closed.".to_string(),
        }
    }
}

/// Handle to a spawned session's supervisor.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    join: JoinHandle<SessionExit>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait until teardown has completed.
    pub async fn wait(self) -> SessionExit {
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => SessionExit::Fault(format!("supervisor failed: {}", e)),
        }
    }
}

struct Inner {
    max_sessions: usize,
    slots: Arc<Semaphore>,
    registry: SessionRegistry,
    db: DbProxy,
    next_id: AtomicU64,
    idle_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

const KILLED_BY_SERVER: &str = "Disconnected by the server.";

impl SessionManager {
    pub fn new(max_sessions: usize, db: DbProxy, idle_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_sessions,
                slots: Arc::new(Semaphore::new(max_sessions)),
                registry: SessionRegistry::new(),
                db,
                next_id: AtomicU64::new(1),
                idle_timeout,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }

    /// Number of sessions currently holding a capacity slot.
    pub fn active(&self) -> usize {
        self.inner.max_sessions - self.inner.slots.available_permits()
    }

    /// Reserve capacity for one more session. Called before negotiation so a full
    /// server refuses without doing any protocol work.
    pub fn try_admit(&self) -> Result<SessionPermit> {
        match self.inner.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(SessionPermit { _permit: permit }),
            Err(_) => {
                metrics::inc_refused_capacity();
                Err(BbsError::CapacityExceeded {
                    max: self.inner.max_sessions,
                })
            }
        }
    }

    /// Start a session on `io` running `app`.
    pub fn spawn(
        &self,
        permit: SessionPermit,
        mut io: TerminalIo,
        app: Arc<dyn SessionApp>,
    ) -> Result<SessionHandle> {
        let db = match self.inner.db.connect() {
            Ok(handle) => handle,
            Err(e) => {
                io.close("The board is unavailable right now.");
                return Err(e);
            }
        };
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let info = SessionInfo {
            id,
            username: io.authenticated_user().map(str::to_string),
            kind: io.kind(),
            peer: io.peer(),
            started_at: now,
            last_activity: now,
        };
        io.set_idle_timeout(self.inner.idle_timeout);

        let writer = io.writer();
        let (kill, kill_rx) = watch::channel(None);
        let shared = Arc::new(SessionShared {
            writer: writer.clone(),
            kill,
        });
        self.inner.registry.register(info.clone(), &shared);
        let active = metrics::record_session_start();
        info!(
            "session {} started: {} from {} ({} active)",
            id, info.kind, info.peer, active
        );

        let handle_id = db.id();
        let ctx = SessionContext::new(info, io, db, self.clone());
        let manager = self.clone();
        let join = tokio::spawn(async move {
            let mut task = tokio::spawn(async move {
                let mut ctx = ctx;
                app.run(&mut ctx).await
            });

            let exit = tokio::select! {
                res = &mut task => match res {
                    Ok(Ok(())) => SessionExit::Completed,
                    Ok(Err(BbsError::Timeout(what))) if what == IDLE_TIMEOUT => SessionExit::IdleTimeout,
                    Ok(Err(e)) => SessionExit::Fault(e.to_string()),
                    Err(e) if e.is_panic() => SessionExit::Fault("session task panicked".into()),
                    Err(e) => SessionExit::Fault(e.to_string()),
                },
                reason = killed(kill_rx) => {
                    task.abort();
                    // Wait for the aborted task so its terminal and handle are dropped.
                    let _ = (&mut task).await;
                    SessionExit::Terminated(reason)
                }
            };

            if let SessionExit::Fault(msg) = &exit {
                metrics::inc_session_faults();
                error!("session {} fault: {}", id, escape_log(msg));
            }
            writer.close(&exit.farewell());

            match manager.inner.db.disconnect(handle_id).await {
                Ok(n) if n > 0 => info!("session {} released {} lock(s)", id, n),
                Ok(_) => {}
                Err(e) => warn!("session {}: proxy disconnect failed: {}", id, e),
            }
            manager.inner.registry.deregister(id);
            let active = metrics::record_session_end();
            info!("session {} ended ({:?}), {} active", id, exit, active);
            drop(shared);
            drop(permit);
            exit
        });

        Ok(SessionHandle { id, join })
    }

    /// Force a session to end. Returns false if no such session is running.
    pub fn terminate(&self, id: SessionId) -> bool {
        self.terminate_with(id, KILLED_BY_SERVER)
    }

    pub fn terminate_with(&self, id: SessionId, reason: &str) -> bool {
        match self.inner.registry.shared(id) {
            Some(shared) => shared.kill.send(Some(reason.to_string())).is_ok(),
            None => false,
        }
    }

    /// Terminate every running session. Returns how many were signalled.
    pub fn terminate_all(&self, reason: &str) -> usize {
        self.inner
            .registry
            .all_shared()
            .into_iter()
            .filter(|(_, shared)| shared.kill.send(Some(reason.to_string())).is_ok())
            .count()
    }

    /// Deliver a notice to every session. Returns how many received it.
    pub fn broadcast(&self, message: &str) -> usize {
        let text = format!("\n*** {}\n", message);
        self.inner
            .registry
            .all_shared()
            .into_iter()
            .filter(|(id, shared)| {
                self.inner
                    .registry
                    .find(*id)
                    .is_some_and(|info| info.kind.is_terminal())
                    && shared.writer.write_styled(Style::Notice, &text)
            })
            .count()
    }

    /// Deliver a private message from one session to another.
    pub fn send(&self, from: SessionId, to: SessionId, message: &str) -> bool {
        let Some(sender) = self.inner.registry.find(from) else {
            return false;
        };
        let Some(target) = self.inner.registry.find(to) else {
            return false;
        };
        if !target.kind.is_terminal() {
            return false;
        }
        let Some(shared) = self.inner.registry.shared(to) else {
            return false;
        };
        let text = format!(
            "\n*** Message from {}: {}\n",
            sender.display_name(),
            message
        );
        shared.writer.write_styled(Style::Notice, &text)
    }

    /// Wait until every session has finished, or `limit` passes.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.active() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

async fn killed(mut rx: watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
