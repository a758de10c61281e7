//! # Storage Module - Engine, Proxy and Persistence
//!
//! The storage layer is split into three parts that only meet through the request and
//! response types in [`protocol`]:
//!
//! ```text
//! session task ──► ProxyHandle ──► mpsc ──► engine loop ──► Store (sled)
//!      ▲                                        │
//!      └────────────── oneshot reply ◄──────────┘
//! ```
//!
//! - [`Store`] owns the sled database. Only the engine loop touches it.
//! - [`engine`] runs the single serialized loop that applies operations, arbitrates
//!   advisory locks and reconciles orphaned locks.
//! - [`proxy`] hands out [`ProxyHandle`]s, the capability a session uses to reach the
//!   engine. A handle holds no data, only in-flight bookkeeping.
//!
//! ## On-disk layout
//!
//! ```text
//! data/
//! ├── engine.lock   ← exclusive owner lock (fs2)
//! └── store/        ← sled database
//!     ├── records   ← "<namespace>\0<key>" → value bytes
//!     ├── locks     ← "<namespace>\0<key>" → bincode LockRecord
//!     └── meta      ← engine epoch bookkeeping
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use termbbs::storage::{StorageEngine, EngineOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = StorageEngine::open("./data", EngineOptions::default())?;
//!     let proxy = engine.start();
//!     let handle = proxy.connect()?;
//!     handle.set("users", "alice", b"{}".to_vec()).await?;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod protocol;
pub mod proxy;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::debug;
use serde::{Deserialize, Serialize};
use sled::IVec;
use uuid::Uuid;

use crate::error::{BbsError, Result};

pub use engine::{EngineOptions, EngineStats, StorageEngine};
pub use protocol::{HandleId, Payload, ProxyOp, ProxyResponse, ResponseStatus};
pub use proxy::{DbProxy, LockGuard, PendingResponse, ProxyHandle};

const TREE_RECORDS: &str = "records";
const TREE_LOCKS: &str = "locks";
const TREE_META: &str = "meta";
const META_EPOCH: &[u8] = b"epoch";
const SEP: u8 = 0;

/// Persisted advisory lock owner.
///
/// The epoch ties the owner to one engine run; a record from another epoch can never
/// belong to a live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub epoch: Uuid,
    pub handle: u64,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub namespaces: usize,
    pub locks: usize,
}

/// Sled-backed record and lock persistence.
pub struct Store {
    _db: sled::Db,
    records: sled::Tree,
    locks: sled::Tree,
    meta: sled::Tree,
    _owner_lock: File,
}

impl Store {
    /// Open (or create) the store under `data_dir`, taking exclusive ownership of it.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let lock_path = dir.join("engine.lock");
        let owner_lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        owner_lock.try_lock_exclusive().map_err(|e| {
            BbsError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "data directory {} is owned by another storage engine: {}",
                    dir.display(),
                    e
                ),
            ))
        })?;

        let db = sled::open(Self::db_path(dir))?;
        let records = db.open_tree(TREE_RECORDS)?;
        let locks = db.open_tree(TREE_LOCKS)?;
        let meta = db.open_tree(TREE_META)?;
        debug!("store opened at {}", dir.display());
        Ok(Self {
            _db: db,
            records,
            locks,
            meta,
            _owner_lock: owner_lock,
        })
    }

    fn db_path(dir: &Path) -> PathBuf {
        dir.join("store")
    }

    fn record_key(ns: &str, key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(ns.len() + key.len() + 1);
        out.extend_from_slice(ns.as_bytes());
        out.push(SEP);
        out.extend_from_slice(key.as_bytes());
        out
    }

    fn ns_prefix(ns: &str) -> Vec<u8> {
        let mut out = ns.as_bytes().to_vec();
        out.push(SEP);
        out
    }

    fn split_key(raw: &[u8]) -> Option<(String, String)> {
        let pos = raw.iter().position(|b| *b == SEP)?;
        let ns = std::str::from_utf8(&raw[..pos]).ok()?;
        let key = std::str::from_utf8(&raw[pos + 1..]).ok()?;
        Some((ns.to_string(), key.to_string()))
    }

    pub fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .get(Self::record_key(ns, key))?
            .map(|v: IVec| v.to_vec()))
    }

    pub fn set(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        self.records.insert(Self::record_key(ns, key), value)?;
        Ok(())
    }

    /// Remove a record, returning whether it existed.
    pub fn delete(&self, ns: &str, key: &str) -> Result<bool> {
        Ok(self.records.remove(Self::record_key(ns, key))?.is_some())
    }

    pub fn contains(&self, ns: &str, key: &str) -> Result<bool> {
        Ok(self.records.contains_key(Self::record_key(ns, key))?)
    }

    pub fn keys(&self, ns: &str) -> Result<Vec<String>> {
        let prefix = Self::ns_prefix(ns);
        let mut keys = Vec::new();
        for entry in self.records.scan_prefix(&prefix) {
            let (k, _) = entry?;
            keys.push(String::from_utf8_lossy(&k[prefix.len()..]).into_owned());
        }
        Ok(keys)
    }

    pub fn items(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = Self::ns_prefix(ns);
        let mut items = Vec::new();
        for entry in self.records.scan_prefix(&prefix) {
            let (k, v) = entry?;
            items.push((
                String::from_utf8_lossy(&k[prefix.len()..]).into_owned(),
                v.to_vec(),
            ));
        }
        Ok(items)
    }

    pub fn count(&self, ns: &str) -> Result<u64> {
        let mut n = 0u64;
        for entry in self.records.scan_prefix(Self::ns_prefix(ns)) {
            entry?;
            n += 1;
        }
        Ok(n)
    }

    /// Apply several sets atomically.
    pub fn update(&self, ns: &str, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(Self::record_key(ns, key), value.as_slice());
        }
        self.records.apply_batch(batch)?;
        Ok(())
    }

    pub fn put_lock(&self, ns: &str, key: &str, record: &LockRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.locks.insert(Self::record_key(ns, key), bytes)?;
        Ok(())
    }

    pub fn remove_lock(&self, ns: &str, key: &str) -> Result<()> {
        self.locks.remove(Self::record_key(ns, key))?;
        Ok(())
    }

    /// All persisted lock records. Entries that fail to decode are reported with `None`
    /// so the caller can discard them.
    pub fn load_locks(&self) -> Result<Vec<(String, String, Option<LockRecord>)>> {
        let mut out = Vec::new();
        for entry in self.locks.iter() {
            let (k, v) = entry?;
            let Some((ns, key)) = Self::split_key(&k) else {
                continue;
            };
            let record = bincode::deserialize::<LockRecord>(&v).ok();
            out.push((ns, key, record));
        }
        Ok(out)
    }

    /// Record a new engine epoch, returning the previous one if any.
    pub fn begin_epoch(&self, epoch: Uuid) -> Result<Option<Uuid>> {
        let prev = self
            .meta
            .insert(META_EPOCH, epoch.as_bytes().to_vec())?
            .and_then(|v| Uuid::from_slice(&v).ok());
        Ok(prev)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut records = 0usize;
        let mut namespaces = std::collections::HashSet::new();
        for entry in self.records.iter() {
            let (k, _) = entry?;
            records += 1;
            if let Some((ns, _)) = Self::split_key(&k) {
                namespaces.insert(ns);
            }
        }
        Ok(StoreStats {
            records,
            namespaces: namespaces.len(),
            locks: self.locks.len(),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.records.flush()?;
        self.locks.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}
