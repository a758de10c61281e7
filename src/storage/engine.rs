//! Single-writer storage engine loop.
//!
//! All proxy traffic funnels into one tokio task that owns the [`Store`] and the advisory
//! lock table. Because every mutation happens on this task, the lock invariant (one owner
//! per record, no writes over another owner's lock) needs no further synchronization.
//!
//! Lock waits never block the loop: a contended `acquire_lock` parks a waiter on the
//! record's FIFO queue with an engine-owned deadline. While a handle is parked, any
//! further requests it submits are held in that handle's backlog so responses still
//! come back in submission order.
//!
//! Orphaned locks are reconciled twice:
//! * at open, every persisted lock from an earlier epoch is released;
//! * periodically, handles whose owning token has been dropped are disconnected.
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Weak;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::protocol::{HandleId, Payload, ProxyOp, ProxyRequest, ProxyResponse, ResponseStatus};
use super::proxy::{DbProxy, HandleToken};
use super::{LockRecord, Store, StoreStats};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::logutil::escape_log;
use crate::validation::{validate_key, validate_namespace};

/// Tunables for the engine loop.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Lock wait used by callers that do not pass their own.
    pub default_lock_timeout: Duration,
    /// Interval of the dead-handle sweep; `None` disables it.
    pub liveness_sweep: Option<Duration>,
    /// Log each command at debug level.
    pub tap: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_lock_timeout: Duration::from_secs(5),
            liveness_sweep: Some(Duration::from_secs(30)),
            tap: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self {
            default_lock_timeout: cfg.lock_timeout(),
            liveness_sweep: cfg.liveness_sweep(),
            tap: cfg.tap_db,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub live_handles: usize,
    pub held_locks: usize,
    pub waiting: usize,
    pub requests_total: u64,
    pub conflicts: u64,
    pub timeouts: u64,
    pub orphaned_released: u64,
    pub store: StoreStats,
}

pub(crate) enum EngineCommand {
    Register {
        handle: HandleId,
        token: Weak<HandleToken>,
    },
    Request(ProxyRequest),
    Disconnect {
        handle: HandleId,
        done: Option<oneshot::Sender<usize>>,
    },
    Snapshot(oneshot::Sender<EngineStats>),
    Shutdown(oneshot::Sender<()>),
}

/// The authoritative owner of the store. Call [`StorageEngine::start`] to run the loop
/// and obtain the [`DbProxy`] that sessions connect through.
pub struct StorageEngine {
    store: Store,
    epoch: Uuid,
    options: EngineOptions,
    reconciled: usize,
}

impl StorageEngine {
    /// Open the store and release every lock left behind by a previous run.
    pub fn open<P: AsRef<Path>>(data_dir: P, options: EngineOptions) -> Result<Self> {
        let store = Store::open(data_dir)?;
        let epoch = Uuid::new_v4();
        let previous = store.begin_epoch(epoch)?;
        let reconciled = reconcile_locks(&store, epoch, &HashSet::new())?;
        if reconciled > 0 {
            warn!(
                "released {} orphaned lock(s) left by engine epoch {}",
                reconciled,
                previous.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into())
            );
        }
        info!("storage engine epoch {} ready", epoch);
        Ok(Self {
            store,
            epoch,
            options,
            reconciled,
        })
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Number of orphaned locks released while opening.
    pub fn reconciled_locks(&self) -> usize {
        self.reconciled
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Spawn the engine loop and return the proxy factory.
    pub fn start(self) -> DbProxy {
        self.spawn().0
    }

    /// Like [`start`](Self::start) but also returns the loop's join handle, so the owner
    /// can notice if the engine dies.
    pub fn spawn(self) -> (DbProxy, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = DbProxy::new(tx, self.epoch, self.options.default_lock_timeout);
        let engine = EngineLoop {
            store: self.store,
            epoch: self.epoch,
            options: self.options,
            locks: HashMap::new(),
            handles: HashMap::new(),
            ready: VecDeque::new(),
            stats: EngineStats::default(),
        };
        let join = tokio::spawn(engine.run(rx));
        (proxy, join)
    }
}

/// Release persisted locks whose owner is not a live handle of `epoch`.
fn reconcile_locks(store: &Store, epoch: Uuid, live: &HashSet<u64>) -> Result<usize> {
    let mut released = 0;
    for (ns, key, record) in store.load_locks()? {
        let alive = matches!(&record, Some(r) if r.epoch == epoch && live.contains(&r.handle));
        if !alive {
            debug!(
                "reconcile: releasing {}/{} (owner {:?})",
                escape_log(&ns),
                escape_log(&key),
                record.map(|r| r.handle)
            );
            store.remove_lock(&ns, &key)?;
            released += 1;
        }
    }
    Ok(released)
}

type RecordKey = (String, String);

struct Waiter {
    handle: HandleId,
    seq: u64,
    deadline: Instant,
    reply: oneshot::Sender<ProxyResponse>,
}

struct LockState {
    owner: HandleId,
    waiters: VecDeque<Waiter>,
}

struct HandleState {
    token: Weak<HandleToken>,
    blocked: bool,
    backlog: VecDeque<ProxyRequest>,
}

struct EngineLoop {
    store: Store,
    epoch: Uuid,
    options: EngineOptions,
    locks: HashMap<RecordKey, LockState>,
    handles: HashMap<HandleId, HandleState>,
    /// Handles whose backlog may be drained.
    ready: VecDeque<HandleId>,
    stats: EngineStats,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl EngineLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        let sweep_enabled = self.options.liveness_sweep.is_some();
        let mut sweep = tokio::time::interval(
            self.options
                .liveness_sweep
                .unwrap_or(Duration::from_secs(3600)),
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Shutdown(done)) => {
                            self.shutdown();
                            let _ = done.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                _ = sleep_until_opt(next_deadline) => self.expire_waiters(Instant::now()),
                _ = sweep.tick(), if sweep_enabled => self.sweep_dead_handles(),
            }
            self.drain_ready();
        }
        debug!("engine command channel closed");
        self.shutdown();
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Register { handle, token } => {
                self.handles.insert(
                    handle,
                    HandleState {
                        token,
                        blocked: false,
                        backlog: VecDeque::new(),
                    },
                );
                debug!("proxy handle {} connected", handle);
            }
            EngineCommand::Request(req) => self.submit(req),
            EngineCommand::Disconnect { handle, done } => {
                let released = self.disconnect(handle);
                if let Some(done) = done {
                    let _ = done.send(released);
                }
            }
            EngineCommand::Snapshot(resp) => {
                let _ = resp.send(self.snapshot());
            }
            EngineCommand::Shutdown(done) => {
                // run() intercepts shutdown; answer anyway so the caller never hangs.
                let _ = done.send(());
            }
        }
    }

    fn submit(&mut self, req: ProxyRequest) {
        match self.handles.get_mut(&req.handle) {
            None => {
                let _ = req.reply.send(ProxyResponse::status(
                    req.seq,
                    ResponseStatus::Fault(format!("handle {} is not connected", req.handle)),
                ));
            }
            Some(state) if state.blocked => state.backlog.push_back(req),
            Some(_) => self.apply(req),
        }
    }

    fn apply(&mut self, req: ProxyRequest) {
        let ProxyRequest {
            handle,
            seq,
            op,
            reply,
        } = req;
        self.stats.requests_total += 1;
        if self.options.tap {
            debug!(
                target: "termbbs::db",
                "{} #{} {} ns={} key={}",
                handle,
                seq,
                op.name(),
                escape_log(op.namespace()),
                op.key().map(escape_log).unwrap_or_default()
            );
        }

        if let Err(e) = check_address(&op) {
            let _ = reply.send(ProxyResponse::status(seq, ResponseStatus::Fault(e)));
            return;
        }

        if let ProxyOp::AcquireLock { ns, key, timeout } = op {
            self.acquire(handle, seq, (ns, key), timeout, reply);
            return;
        }

        let response = match self.execute(handle, seq, op) {
            Ok(resp) => resp,
            Err(e) => {
                error!("storage operation #{} from {} failed: {}", seq, handle, e);
                ProxyResponse::status(seq, ResponseStatus::Fault(e.to_string()))
            }
        };
        if matches!(response.status, ResponseStatus::Conflict { .. }) {
            self.stats.conflicts += 1;
        }
        let _ = reply.send(response);
    }

    fn execute(&mut self, handle: HandleId, seq: u64, op: ProxyOp) -> Result<ProxyResponse> {
        let resp = match op {
            ProxyOp::Get { ns, key } => match self.store.get(&ns, &key)? {
                Some(v) => ProxyResponse::with_payload(seq, Payload::Value(v)),
                None => ProxyResponse::status(seq, ResponseStatus::NotFound),
            },
            ProxyOp::Set { ns, key, value } => {
                if let Some(owner) = self.foreign_owner(handle, &ns, &key) {
                    return Ok(ProxyResponse::status(seq, ResponseStatus::Conflict { owner }));
                }
                self.store.set(&ns, &key, &value)?;
                ProxyResponse::ok(seq)
            }
            ProxyOp::Delete { ns, key } => {
                if let Some(owner) = self.foreign_owner(handle, &ns, &key) {
                    return Ok(ProxyResponse::status(seq, ResponseStatus::Conflict { owner }));
                }
                if self.store.delete(&ns, &key)? {
                    ProxyResponse::ok(seq)
                } else {
                    ProxyResponse::status(seq, ResponseStatus::NotFound)
                }
            }
            ProxyOp::SetDefault { ns, key, value } => {
                if let Some(existing) = self.store.get(&ns, &key)? {
                    return Ok(ProxyResponse::with_payload(seq, Payload::Value(existing)));
                }
                if let Some(owner) = self.foreign_owner(handle, &ns, &key) {
                    return Ok(ProxyResponse::status(seq, ResponseStatus::Conflict { owner }));
                }
                self.store.set(&ns, &key, &value)?;
                ProxyResponse::with_payload(seq, Payload::Value(value))
            }
            ProxyOp::Pop { ns, key } => {
                if let Some(owner) = self.foreign_owner(handle, &ns, &key) {
                    return Ok(ProxyResponse::status(seq, ResponseStatus::Conflict { owner }));
                }
                match self.store.get(&ns, &key)? {
                    Some(old) => {
                        self.store.delete(&ns, &key)?;
                        ProxyResponse::with_payload(seq, Payload::Value(old))
                    }
                    None => ProxyResponse::status(seq, ResponseStatus::NotFound),
                }
            }
            ProxyOp::Contains { ns, key } => {
                ProxyResponse::with_payload(seq, Payload::Flag(self.store.contains(&ns, &key)?))
            }
            ProxyOp::Keys { ns } => ProxyResponse::with_payload(seq, Payload::Keys(self.store.keys(&ns)?)),
            ProxyOp::Items { ns } => {
                ProxyResponse::with_payload(seq, Payload::Items(self.store.items(&ns)?))
            }
            ProxyOp::Count { ns } => ProxyResponse::with_payload(seq, Payload::Count(self.store.count(&ns)?)),
            ProxyOp::Update { ns, entries } => {
                for (key, _) in &entries {
                    if let Some(owner) = self.foreign_owner(handle, &ns, key) {
                        return Ok(ProxyResponse::status(seq, ResponseStatus::Conflict { owner }));
                    }
                }
                self.store.update(&ns, &entries)?;
                ProxyResponse::ok(seq)
            }
            ProxyOp::Release { ns, key } => {
                let k = (ns, key);
                match self.locks.get(&k) {
                    None => ProxyResponse::ok(seq),
                    Some(state) if state.owner != handle => ProxyResponse::status(
                        seq,
                        ResponseStatus::Conflict { owner: state.owner },
                    ),
                    Some(_) => {
                        self.hand_off(k);
                        ProxyResponse::ok(seq)
                    }
                }
            }
            ProxyOp::AcquireLock { .. } => ProxyResponse::status(
                seq,
                ResponseStatus::Fault("acquire_lock reached the plain executor".into()),
            ),
        };
        Ok(resp)
    }

    /// Owner of the lock on (ns, key) when it is someone other than `handle`.
    fn foreign_owner(&self, handle: HandleId, ns: &str, key: &str) -> Option<HandleId> {
        self.locks
            .get(&(ns.to_string(), key.to_string()))
            .map(|s| s.owner)
            .filter(|owner| *owner != handle)
    }

    fn acquire(
        &mut self,
        handle: HandleId,
        seq: u64,
        k: RecordKey,
        timeout: Duration,
        reply: oneshot::Sender<ProxyResponse>,
    ) {
        match self.locks.get_mut(&k) {
            None => {
                if let Err(e) = self.persist_lock(&k, handle) {
                    error!("failed to persist lock {}/{}: {}", k.0, k.1, e);
                    let _ = reply.send(ProxyResponse::status(seq, ResponseStatus::Fault(e.to_string())));
                    return;
                }
                self.locks.insert(
                    k,
                    LockState {
                        owner: handle,
                        waiters: VecDeque::new(),
                    },
                );
                let _ = reply.send(ProxyResponse::ok(seq));
            }
            Some(state) if state.owner == handle => {
                let _ = reply.send(ProxyResponse::ok(seq));
            }
            Some(state) => {
                if timeout.is_zero() {
                    self.stats.timeouts += 1;
                    let _ = reply.send(ProxyResponse::status(seq, ResponseStatus::Timeout));
                    return;
                }
                state.waiters.push_back(Waiter {
                    handle,
                    seq,
                    deadline: Instant::now() + timeout,
                    reply,
                });
                if let Some(h) = self.handles.get_mut(&handle) {
                    h.blocked = true;
                }
            }
        }
    }

    fn persist_lock(&self, k: &RecordKey, owner: HandleId) -> Result<()> {
        self.store.put_lock(
            &k.0,
            &k.1,
            &LockRecord {
                epoch: self.epoch,
                handle: owner.0,
                acquired_at: Utc::now(),
            },
        )
    }

    /// Drop the current owner of `k` and grant the lock to the first waiter that is
    /// still listening.
    fn hand_off(&mut self, k: RecordKey) {
        let Some(mut state) = self.locks.remove(&k) else {
            return;
        };
        if let Err(e) = self.store.remove_lock(&k.0, &k.1) {
            error!("failed to remove persisted lock {}/{}: {}", k.0, k.1, e);
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.reply.is_closed() || !self.handles.contains_key(&waiter.handle) {
                self.unblock(waiter.handle);
                continue;
            }
            if let Err(e) = self.persist_lock(&k, waiter.handle) {
                error!("failed to persist lock {}/{}: {}", k.0, k.1, e);
                let _ = waiter
                    .reply
                    .send(ProxyResponse::status(waiter.seq, ResponseStatus::Fault(e.to_string())));
                self.unblock(waiter.handle);
                continue;
            }
            if waiter.reply.send(ProxyResponse::ok(waiter.seq)).is_err() {
                // Receiver went away between the check and the send.
                let _ = self.store.remove_lock(&k.0, &k.1);
                self.unblock(waiter.handle);
                continue;
            }
            state.owner = waiter.handle;
            self.unblock(waiter.handle);
            self.locks.insert(k, state);
            return;
        }
    }

    fn unblock(&mut self, handle: HandleId) {
        if let Some(h) = self.handles.get_mut(&handle) {
            h.blocked = false;
            self.ready.push_back(handle);
        }
    }

    fn drain_ready(&mut self) {
        while let Some(handle) = self.ready.pop_front() {
            loop {
                let next = match self.handles.get_mut(&handle) {
                    Some(state) if !state.blocked => state.backlog.pop_front(),
                    _ => None,
                };
                match next {
                    Some(req) => self.apply(req),
                    None => break,
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.locks
            .values()
            .flat_map(|s| s.waiters.iter().map(|w| w.deadline))
            .min()
    }

    fn expire_waiters(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for state in self.locks.values_mut() {
            let mut kept = VecDeque::with_capacity(state.waiters.len());
            while let Some(w) = state.waiters.pop_front() {
                if w.deadline <= now {
                    expired.push(w);
                } else {
                    kept.push_back(w);
                }
            }
            state.waiters = kept;
        }
        for w in expired {
            self.stats.timeouts += 1;
            let _ = w.reply.send(ProxyResponse::status(w.seq, ResponseStatus::Timeout));
            self.unblock(w.handle);
        }
    }

    /// Forget a handle: fail its backlog, drop its waits, release its locks.
    fn disconnect(&mut self, handle: HandleId) -> usize {
        let Some(state) = self.handles.remove(&handle) else {
            return 0;
        };
        for req in state.backlog {
            let _ = req.reply.send(ProxyResponse::status(
                req.seq,
                ResponseStatus::Fault("handle disconnected".into()),
            ));
        }
        for lock in self.locks.values_mut() {
            lock.waiters.retain(|w| w.handle != handle);
        }
        let owned: Vec<RecordKey> = self
            .locks
            .iter()
            .filter(|(_, s)| s.owner == handle)
            .map(|(k, _)| k.clone())
            .collect();
        let released = owned.len();
        for k in owned {
            self.hand_off(k);
        }
        debug!("proxy handle {} disconnected, released {} lock(s)", handle, released);
        released
    }

    fn sweep_dead_handles(&mut self) {
        let dead: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, s)| s.token.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for handle in dead {
            let released = self.disconnect(handle);
            self.stats.orphaned_released += released as u64;
            if released > 0 {
                warn!(
                    "liveness sweep: handle {} vanished holding {} lock(s)",
                    handle, released
                );
            }
        }
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            live_handles: self.handles.len(),
            held_locks: self.locks.len(),
            waiting: self.locks.values().map(|s| s.waiters.len()).sum(),
            store: self.store.stats().unwrap_or_default(),
            ..self.stats.clone()
        }
    }

    fn shutdown(&mut self) {
        let handles: Vec<HandleId> = self.handles.keys().copied().collect();
        for handle in handles {
            self.disconnect(handle);
        }
        for (k, state) in self.locks.drain() {
            let _ = self.store.remove_lock(&k.0, &k.1);
            for w in state.waiters {
                let _ = w.reply.send(ProxyResponse::status(
                    w.seq,
                    ResponseStatus::Fault("storage engine shutting down".into()),
                ));
            }
        }
        if let Err(e) = self.store.flush() {
            error!("store flush on shutdown failed: {}", e);
        }
        info!("storage engine epoch {} stopped", self.epoch);
    }
}

fn check_address(op: &ProxyOp) -> std::result::Result<(), String> {
    validate_namespace(op.namespace()).map_err(|e| e.to_string())?;
    if let Some(key) = op.key() {
        validate_key(key).map_err(|e| e.to_string())?;
    }
    if let ProxyOp::Update { entries, .. } = op {
        for (key, _) in entries {
            validate_key(key).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_releases_foreign_epochs_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let current = Uuid::new_v4();
        let stale = LockRecord {
            epoch: Uuid::new_v4(),
            handle: 1,
            acquired_at: Utc::now(),
        };
        let live = LockRecord {
            epoch: current,
            handle: 2,
            acquired_at: Utc::now(),
        };
        let dead = LockRecord {
            epoch: current,
            handle: 3,
            acquired_at: Utc::now(),
        };
        store.put_lock("a", "stale", &stale).unwrap();
        store.put_lock("a", "live", &live).unwrap();
        store.put_lock("a", "dead", &dead).unwrap();

        let live_set: HashSet<u64> = [2].into_iter().collect();
        let released = reconcile_locks(&store, current, &live_set).unwrap();
        assert_eq!(released, 2);
        let left = store.load_locks().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].1, "live");
    }

    #[tokio::test]
    async fn sweep_disconnects_handles_whose_token_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = StorageEngine::open(tmp.path(), EngineOptions::default()).unwrap();
        let mut lp = EngineLoop {
            store: engine.store,
            epoch: engine.epoch,
            options: engine.options,
            locks: HashMap::new(),
            handles: HashMap::new(),
            ready: VecDeque::new(),
            stats: EngineStats::default(),
        };
        let handle = HandleId(1);
        lp.handle_command(EngineCommand::Register {
            handle,
            token: Weak::new(),
        });
        let (reply, mut rx) = oneshot::channel();
        lp.apply(ProxyRequest {
            handle,
            seq: 1,
            op: ProxyOp::AcquireLock {
                ns: "users".into(),
                key: "zoe".into(),
                timeout: Duration::ZERO,
            },
            reply,
        });
        assert_eq!(rx.try_recv().unwrap().status, ResponseStatus::Ok);
        assert_eq!(lp.store.load_locks().unwrap().len(), 1);

        lp.sweep_dead_handles();
        assert!(lp.locks.is_empty());
        assert!(lp.handles.is_empty());
        assert_eq!(lp.stats.orphaned_released, 1);
        assert!(lp.store.load_locks().unwrap().is_empty());
    }

    #[test]
    fn address_check_covers_batch_keys() {
        let op = ProxyOp::Update {
            ns: "users".into(),
            entries: vec![("ok".into(), vec![]), ("".into(), vec![])],
        };
        assert!(check_address(&op).is_err());
        let op = ProxyOp::Keys { ns: "users".into() };
        assert!(check_address(&op).is_ok());
    }
}
