//! Request/response types carried between proxy handles and the storage engine.
//!
//! Every [`ProxyRequest`] receives exactly one [`ProxyResponse`]. Responses for one handle
//! are produced in the order that handle submitted its requests; `seq` lets the handle
//! check that.
use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

/// Identifier of a proxy handle, unique within one engine epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOp {
    Get { ns: String, key: String },
    Set { ns: String, key: String, value: Vec<u8> },
    Delete { ns: String, key: String },
    /// Store `value` unless the key exists; answers with whichever value is now stored.
    SetDefault { ns: String, key: String, value: Vec<u8> },
    /// Remove a record and answer with its old value.
    Pop { ns: String, key: String },
    Contains { ns: String, key: String },
    Keys { ns: String },
    Items { ns: String },
    Count { ns: String },
    /// Batch set; all-or-nothing with respect to lock conflicts.
    Update { ns: String, entries: Vec<(String, Vec<u8>)> },
    AcquireLock { ns: String, key: String, timeout: Duration },
    Release { ns: String, key: String },
}

impl ProxyOp {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyOp::Get { .. } => "get",
            ProxyOp::Set { .. } => "set",
            ProxyOp::Delete { .. } => "delete",
            ProxyOp::SetDefault { .. } => "setdefault",
            ProxyOp::Pop { .. } => "pop",
            ProxyOp::Contains { .. } => "contains",
            ProxyOp::Keys { .. } => "keys",
            ProxyOp::Items { .. } => "items",
            ProxyOp::Count { .. } => "count",
            ProxyOp::Update { .. } => "update",
            ProxyOp::AcquireLock { .. } => "acquire_lock",
            ProxyOp::Release { .. } => "release",
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ProxyOp::Get { ns, .. }
            | ProxyOp::Set { ns, .. }
            | ProxyOp::Delete { ns, .. }
            | ProxyOp::SetDefault { ns, .. }
            | ProxyOp::Pop { ns, .. }
            | ProxyOp::Contains { ns, .. }
            | ProxyOp::Keys { ns }
            | ProxyOp::Items { ns }
            | ProxyOp::Count { ns }
            | ProxyOp::Update { ns, .. }
            | ProxyOp::AcquireLock { ns, .. }
            | ProxyOp::Release { ns, .. } => ns,
        }
    }

    /// Key addressed by the operation, if it targets a single record.
    pub fn key(&self) -> Option<&str> {
        match self {
            ProxyOp::Get { key, .. }
            | ProxyOp::Set { key, .. }
            | ProxyOp::Delete { key, .. }
            | ProxyOp::SetDefault { key, .. }
            | ProxyOp::Pop { key, .. }
            | ProxyOp::Contains { key, .. }
            | ProxyOp::AcquireLock { key, .. }
            | ProxyOp::Release { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ProxyRequest {
    pub handle: HandleId,
    pub seq: u64,
    pub op: ProxyOp,
    pub reply: oneshot::Sender<ProxyResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    NotFound,
    /// Record is locked by another handle.
    Conflict { owner: HandleId },
    Timeout,
    Fault(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Value(Vec<u8>),
    Flag(bool),
    Keys(Vec<String>),
    Items(Vec<(String, Vec<u8>)>),
    Count(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub seq: u64,
    pub status: ResponseStatus,
    pub payload: Option<Payload>,
}

impl ProxyResponse {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            status: ResponseStatus::Ok,
            payload: None,
        }
    }

    pub fn with_payload(seq: u64, payload: Payload) -> Self {
        Self {
            seq,
            status: ResponseStatus::Ok,
            payload: Some(payload),
        }
    }

    pub fn status(seq: u64, status: ResponseStatus) -> Self {
        Self {
            seq,
            status,
            payload: None,
        }
    }
}
