//! Test utilities & fixtures.
//! Throwaway storage engines and in-memory terminals; no sockets unless a test binds one.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use termbbs::bbs::{SessionApp, SessionContext, SessionManager};
use termbbs::protocol::{ProtocolKind, TermPeer, TerminalIo, WindowSize};
use termbbs::storage::{DbProxy, EngineOptions, StorageEngine};

pub const WAIT: Duration = Duration::from_secs(2);

/// A running engine on a fresh temp dir. Keep the `TempDir` alive for the test.
pub fn engine() -> (tempfile::TempDir, DbProxy) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let proxy = StorageEngine::open(tmp.path(), fast_options())
        .expect("engine")
        .start();
    (tmp, proxy)
}

pub fn fast_options() -> EngineOptions {
    EngineOptions {
        default_lock_timeout: Duration::from_millis(200),
        liveness_sweep: Some(Duration::from_millis(50)),
        tap: false,
    }
}

pub fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn terminal(kind: ProtocolKind, port: u16) -> (TerminalIo, TermPeer) {
    TerminalIo::pair(kind, peer(port), WindowSize::default())
}

pub fn manager(max: usize) -> (tempfile::TempDir, DbProxy, SessionManager) {
    let (tmp, proxy) = engine();
    let manager = SessionManager::new(max, proxy.clone(), None);
    (tmp, proxy, manager)
}

/// Reads lines forever, echoing each back as `> line`.
pub struct EchoApp;

#[async_trait]
impl SessionApp for EchoApp {
    async fn run(&self, ctx: &mut SessionContext) -> termbbs::Result<()> {
        ctx.io.write_line("ready");
        while let Some(line) = ctx.io.read_line().await? {
            ctx.io.write_line(&format!("> {}", line));
        }
        Ok(())
    }
}

pub fn echo_app() -> Arc<dyn SessionApp> {
    Arc::new(EchoApp)
}
