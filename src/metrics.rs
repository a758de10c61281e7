//! Process-wide session and connection counters.
//!
//! Counters are plain atomics so listeners, supervisors and the shell can bump and read
//! them without coordination. `snapshot()` gives a consistent-enough view for status
//! output and periodic logging.
use std::sync::atomic::{AtomicU64, Ordering};

static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static REFUSED_CAPACITY: AtomicU64 = AtomicU64::new(0);
static NEGOTIATION_FAILURES: AtomicU64 = AtomicU64::new(0);
static SESSIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_ENDED: AtomicU64 = AtomicU64::new(0);
static SESSION_FAULTS: AtomicU64 = AtomicU64::new(0);
static ACTIVE: AtomicU64 = AtomicU64::new(0);
static PEAK: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounters {
    pub connections_accepted: u64,
    pub refused_capacity: u64,
    pub negotiation_failures: u64,
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub faults: u64,
    pub active: u64,
    pub peak: u64,
}

pub fn inc_connections_accepted() {
    CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_refused_capacity() {
    REFUSED_CAPACITY.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_negotiation_failures() {
    NEGOTIATION_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_session_faults() {
    SESSION_FAULTS.fetch_add(1, Ordering::Relaxed);
}

/// Record a session start, returning the new active count.
pub fn record_session_start() -> u64 {
    SESSIONS_STARTED.fetch_add(1, Ordering::Relaxed);
    let active = ACTIVE.fetch_add(1, Ordering::AcqRel) + 1;
    PEAK.fetch_max(active, Ordering::AcqRel);
    active
}

/// Record a session end, returning the new active count.
pub fn record_session_end() -> u64 {
    SESSIONS_ENDED.fetch_add(1, Ordering::Relaxed);
    let prev = ACTIVE
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
        .unwrap_or(0);
    prev.saturating_sub(1)
}

pub fn snapshot() -> SessionCounters {
    SessionCounters {
        connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
        refused_capacity: REFUSED_CAPACITY.load(Ordering::Relaxed),
        negotiation_failures: NEGOTIATION_FAILURES.load(Ordering::Relaxed),
        sessions_started: SESSIONS_STARTED.load(Ordering::Relaxed),
        sessions_ended: SESSIONS_ENDED.load(Ordering::Relaxed),
        faults: SESSION_FAULTS.load(Ordering::Relaxed),
        active: ACTIVE.load(Ordering::Relaxed),
        peak: PEAK.load(Ordering::Relaxed),
    }
}
