//! Proxy handles: the only way sessions reach the storage engine.
//!
//! [`DbProxy`] is the cheap, clonable factory the session manager holds. Each session
//! gets its own [`ProxyHandle`] from [`DbProxy::connect`]. Dropping a handle (or calling
//! [`DbProxy::disconnect`]) releases every lock it still holds.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::engine::{EngineCommand, EngineStats};
use super::protocol::{HandleId, Payload, ProxyOp, ProxyRequest, ProxyResponse, ResponseStatus};
use crate::error::{BbsError, Result};
use crate::validation::{validate_key, validate_namespace};

/// Liveness token. The engine keeps a `Weak` to it; once the owning handle is gone the
/// engine's sweep treats the handle as dead.
#[derive(Debug)]
pub(crate) struct HandleToken {
    #[allow(dead_code)]
    id: HandleId,
}

struct ProxyShared {
    tx: mpsc::UnboundedSender<EngineCommand>,
    next_handle: AtomicU64,
    epoch: Uuid,
    default_lock_timeout: Duration,
}

/// Factory for proxy handles. Holds no data.
#[derive(Clone)]
pub struct DbProxy {
    shared: Arc<ProxyShared>,
}

impl DbProxy {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<EngineCommand>,
        epoch: Uuid,
        default_lock_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ProxyShared {
                tx,
                next_handle: AtomicU64::new(1),
                epoch,
                default_lock_timeout,
            }),
        }
    }

    /// Open a new handle on the engine.
    pub fn connect(&self) -> Result<ProxyHandle> {
        let id = HandleId(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let token = Arc::new(HandleToken { id });
        self.shared
            .tx
            .send(EngineCommand::Register {
                handle: id,
                token: Arc::downgrade(&token),
            })
            .map_err(|_| BbsError::EngineUnavailable)?;
        Ok(ProxyHandle {
            id,
            tx: self.shared.tx.clone(),
            _token: token,
            next_seq: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            default_lock_timeout: self.shared.default_lock_timeout,
        })
    }

    /// Disconnect `handle` and wait until the engine has released its locks.
    /// Returns how many locks were released. Disconnecting twice is harmless.
    pub async fn disconnect(&self, handle: HandleId) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .tx
            .send(EngineCommand::Disconnect {
                handle,
                done: Some(tx),
            })
            .map_err(|_| BbsError::EngineUnavailable)?;
        rx.await.map_err(|_| BbsError::EngineUnavailable)
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .tx
            .send(EngineCommand::Snapshot(tx))
            .map_err(|_| BbsError::EngineUnavailable)?;
        rx.await.map_err(|_| BbsError::EngineUnavailable)
    }

    /// Stop the engine loop after releasing all locks and flushing the store.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .tx
            .send(EngineCommand::Shutdown(tx))
            .map_err(|_| BbsError::EngineUnavailable)?;
        rx.await.map_err(|_| BbsError::EngineUnavailable)
    }

    pub fn epoch(&self) -> Uuid {
        self.shared.epoch
    }

    pub fn default_lock_timeout(&self) -> Duration {
        self.shared.default_lock_timeout
    }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A submitted request whose response has not been read yet.
pub struct PendingResponse {
    seq: u64,
    rx: Option<oneshot::Receiver<ProxyResponse>>,
    _in_flight: InFlight,
}

impl PendingResponse {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Future for PendingResponse {
    type Output = Result<ProxyResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(BbsError::EngineUnavailable));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(resp)) => Poll::Ready(Ok(resp)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BbsError::EngineUnavailable)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A session's capability for issuing storage operations.
pub struct ProxyHandle {
    id: HandleId,
    tx: mpsc::UnboundedSender<EngineCommand>,
    _token: Arc<HandleToken>,
    next_seq: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    default_lock_timeout: Duration,
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn check_addr(ns: &str, key: Option<&str>) -> Result<()> {
    validate_namespace(ns).map_err(|e| BbsError::Validation(e.to_string()))?;
    if let Some(key) = key {
        validate_key(key).map_err(|e| BbsError::Validation(e.to_string()))?;
    }
    Ok(())
}

impl ProxyHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Requests submitted but not yet answered (or abandoned).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn default_lock_timeout(&self) -> Duration {
        self.default_lock_timeout
    }

    /// Queue `op` without waiting. Responses to submitted requests arrive in submission
    /// order.
    pub fn submit(&self, op: ProxyOp) -> PendingResponse {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let in_flight = InFlight::enter(&self.in_flight);
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(EngineCommand::Request(ProxyRequest {
                handle: self.id,
                seq,
                op,
                reply,
            }))
            .is_ok();
        PendingResponse {
            seq,
            rx: sent.then_some(rx),
            _in_flight: in_flight,
        }
    }

    async fn call(&self, op: ProxyOp) -> Result<ProxyResponse> {
        let pending = self.submit(op);
        let seq = pending.seq();
        let resp = pending.await?;
        debug_assert_eq!(resp.seq, seq, "engine answered out of order");
        Ok(resp)
    }

    fn into_result(resp: ProxyResponse, ns: &str, key: &str) -> Result<Option<Payload>> {
        match resp.status {
            ResponseStatus::Ok => Ok(resp.payload),
            ResponseStatus::NotFound => Err(BbsError::NotFound(format!("{}/{}", ns, key))),
            ResponseStatus::Conflict { owner } => Err(BbsError::StorageConflict {
                namespace: ns.to_string(),
                key: key.to_string(),
                owner: owner.0,
            }),
            ResponseStatus::Timeout => Err(BbsError::Timeout(format!("lock {}/{}", ns, key))),
            ResponseStatus::Fault(msg) => Err(BbsError::InternalFault(msg)),
        }
    }

    /// Read a record. A missing record is `Ok(None)`.
    pub async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::Get {
                ns: ns.into(),
                key: key.into(),
            })
            .await?;
        match Self::into_result(resp, ns, key) {
            Ok(Some(Payload::Value(v))) => Ok(Some(v)),
            Ok(_) => Err(BbsError::InternalFault("unexpected payload for get".into())),
            Err(BbsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a record. Fails with [`BbsError::StorageConflict`] when another handle holds
    /// the record's lock.
    pub async fn set(&self, ns: &str, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::Set {
                ns: ns.into(),
                key: key.into(),
                value: value.into(),
            })
            .await?;
        Self::into_result(resp, ns, key).map(|_| ())
    }

    /// Delete a record, returning whether it existed.
    pub async fn delete(&self, ns: &str, key: &str) -> Result<bool> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::Delete {
                ns: ns.into(),
                key: key.into(),
            })
            .await?;
        match Self::into_result(resp, ns, key) {
            Ok(_) => Ok(true),
            Err(BbsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store `default` if the record is missing and return the value now stored.
    /// An existing record is returned even when another handle holds its lock.
    pub async fn setdefault(&self, ns: &str, key: &str, default: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::SetDefault {
                ns: ns.into(),
                key: key.into(),
                value: default.into(),
            })
            .await?;
        match Self::into_result(resp, ns, key)? {
            Some(Payload::Value(v)) => Ok(v),
            _ => Err(BbsError::InternalFault("unexpected payload for setdefault".into())),
        }
    }

    /// Remove a record and return what it held.
    pub async fn pop(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::Pop {
                ns: ns.into(),
                key: key.into(),
            })
            .await?;
        match Self::into_result(resp, ns, key) {
            Ok(Some(Payload::Value(v))) => Ok(Some(v)),
            Ok(_) => Err(BbsError::InternalFault("unexpected payload for pop".into())),
            Err(BbsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn contains(&self, ns: &str, key: &str) -> Result<bool> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::Contains {
                ns: ns.into(),
                key: key.into(),
            })
            .await?;
        match Self::into_result(resp, ns, key)? {
            Some(Payload::Flag(b)) => Ok(b),
            _ => Err(BbsError::InternalFault("unexpected payload for contains".into())),
        }
    }

    pub async fn keys(&self, ns: &str) -> Result<Vec<String>> {
        check_addr(ns, None)?;
        let resp = self.call(ProxyOp::Keys { ns: ns.into() }).await?;
        match Self::into_result(resp, ns, "*")? {
            Some(Payload::Keys(keys)) => Ok(keys),
            _ => Err(BbsError::InternalFault("unexpected payload for keys".into())),
        }
    }

    pub async fn items(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        check_addr(ns, None)?;
        let resp = self.call(ProxyOp::Items { ns: ns.into() }).await?;
        match Self::into_result(resp, ns, "*")? {
            Some(Payload::Items(items)) => Ok(items),
            _ => Err(BbsError::InternalFault("unexpected payload for items".into())),
        }
    }

    pub async fn count(&self, ns: &str) -> Result<u64> {
        check_addr(ns, None)?;
        let resp = self.call(ProxyOp::Count { ns: ns.into() }).await?;
        match Self::into_result(resp, ns, "*")? {
            Some(Payload::Count(n)) => Ok(n),
            _ => Err(BbsError::InternalFault("unexpected payload for count".into())),
        }
    }

    /// Write several records at once. Nothing is written if any key is locked by
    /// another handle.
    pub async fn update(&self, ns: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        check_addr(ns, None)?;
        for (key, _) in &entries {
            check_addr(ns, Some(key))?;
        }
        let resp = self
            .call(ProxyOp::Update {
                ns: ns.into(),
                entries,
            })
            .await?;
        Self::into_result(resp, ns, "*").map(|_| ())
    }

    /// Take the advisory lock on (ns, key), waiting up to `timeout` for the current
    /// owner to let go. Re-acquiring a lock this handle already owns succeeds at once.
    pub async fn acquire_lock(&self, ns: &str, key: &str, timeout: Duration) -> Result<()> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::AcquireLock {
                ns: ns.into(),
                key: key.into(),
                timeout,
            })
            .await?;
        Self::into_result(resp, ns, key).map(|_| ())
    }

    /// Release a lock this handle owns. Releasing an unlocked record is a no-op.
    pub async fn release(&self, ns: &str, key: &str) -> Result<()> {
        check_addr(ns, Some(key))?;
        let resp = self
            .call(ProxyOp::Release {
                ns: ns.into(),
                key: key.into(),
            })
            .await?;
        Self::into_result(resp, ns, key).map(|_| ())
    }

    /// Acquire a lock released automatically when the guard is dropped.
    pub async fn lock(&self, ns: &str, key: &str, timeout: Duration) -> Result<LockGuard<'_>> {
        self.acquire_lock(ns, key, timeout).await?;
        Ok(LockGuard {
            handle: self,
            ns: ns.to_string(),
            key: key.to_string(),
            released: false,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, ns: &str, key: &str) -> Result<Option<T>> {
        match self.get(ns, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(ns, key, bytes).await
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(EngineCommand::Disconnect {
            handle: self.id,
            done: None,
        });
    }
}

/// Holds an advisory lock until released or dropped.
pub struct LockGuard<'a> {
    handle: &'a ProxyHandle,
    ns: String,
    key: String,
    released: bool,
}

impl LockGuard<'_> {
    /// Release now and report the engine's answer.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.handle.release(&self.ns, &self.key).await
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Fire and forget; the engine still processes the release in order.
            let _ = self.handle.submit(ProxyOp::Release {
                ns: std::mem::take(&mut self.ns),
                key: std::mem::take(&mut self.key),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EngineOptions, StorageEngine};

    fn engine(dir: &std::path::Path) -> DbProxy {
        StorageEngine::open(dir, EngineOptions::default())
            .unwrap()
            .start()
    }

    #[tokio::test]
    async fn dictionary_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = engine(tmp.path());
        let h = proxy.connect().unwrap();

        assert_eq!(h.get("users", "alice").await.unwrap(), None);
        h.set("users", "alice", b"one".to_vec()).await.unwrap();
        h.update(
            "users",
            vec![("bob".into(), b"two".to_vec()), ("carol".into(), b"three".to_vec())],
        )
        .await
        .unwrap();
        assert_eq!(h.get("users", "alice").await.unwrap(), Some(b"one".to_vec()));
        assert!(h.contains("users", "bob").await.unwrap());
        assert_eq!(h.count("users").await.unwrap(), 3);
        assert_eq!(h.keys("users").await.unwrap(), vec!["alice", "bob", "carol"]);
        assert!(h.delete("users", "bob").await.unwrap());
        assert!(!h.delete("users", "bob").await.unwrap());
        assert_eq!(h.items("users").await.unwrap().len(), 2);
        assert_eq!(h.in_flight(), 0);
    }

    #[tokio::test]
    async fn setdefault_and_pop_respect_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = engine(tmp.path());
        let h = proxy.connect().unwrap();
        let other = proxy.connect().unwrap();

        assert_eq!(h.setdefault("boards", "general", b"new".to_vec()).await.unwrap(), b"new");
        assert_eq!(h.setdefault("boards", "general", b"again".to_vec()).await.unwrap(), b"new");

        other
            .acquire_lock("boards", "general", Duration::ZERO)
            .await
            .unwrap();
        other
            .acquire_lock("boards", "locals", Duration::ZERO)
            .await
            .unwrap();
        // Reading an existing value never conflicts; creating or removing one does.
        assert_eq!(h.setdefault("boards", "general", b"x".to_vec()).await.unwrap(), b"new");
        assert!(matches!(
            h.setdefault("boards", "locals", b"x".to_vec()).await,
            Err(BbsError::StorageConflict { .. })
        ));
        assert!(matches!(
            h.pop("boards", "general").await,
            Err(BbsError::StorageConflict { .. })
        ));

        other.release("boards", "general").await.unwrap();
        assert_eq!(h.pop("boards", "general").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(h.pop("boards", "general").await.unwrap(), None);
        assert!(!h.contains("boards", "locals").await.unwrap());
    }

    #[tokio::test]
    async fn json_helpers_roundtrip() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Profile {
            name: String,
            calls: u32,
        }
        let tmp = tempfile::tempdir().unwrap();
        let proxy = engine(tmp.path());
        let h = proxy.connect().unwrap();
        let p = Profile {
            name: "alice".into(),
            calls: 3,
        };
        h.set_json("profiles", "alice", &p).await.unwrap();
        let back: Option<Profile> = h.get_json("profiles", "alice").await.unwrap();
        assert_eq!(back, Some(p));
    }

    #[tokio::test]
    async fn invalid_addresses_fail_before_sending() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = engine(tmp.path());
        let h = proxy.connect().unwrap();
        assert!(matches!(
            h.set("", "k", b"v".to_vec()).await,
            Err(BbsError::Validation(_))
        ));
        assert!(matches!(
            h.get("ns", "bad\0key").await,
            Err(BbsError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn guard_drop_releases_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = engine(tmp.path());
        let a = proxy.connect().unwrap();
        let b = proxy.connect().unwrap();
        {
            let _guard = a
                .lock("boards", "general", Duration::from_millis(100))
                .await
                .unwrap();
            assert!(b.set("boards", "general", b"x".to_vec()).await.is_err());
        }
        b.acquire_lock("boards", "general", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn engine_gone_reports_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy = engine(tmp.path());
        let h = proxy.connect().unwrap();
        proxy.shutdown().await.unwrap();
        assert!(matches!(
            h.get("users", "alice").await,
            Err(BbsError::EngineUnavailable)
        ));
        assert!(proxy.connect().is_err());
    }
}
