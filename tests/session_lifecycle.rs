use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use termbbs::bbs::{SessionApp, SessionContext, SessionExit, SessionId, SessionManager};
use termbbs::protocol::{ProtocolKind, TermOutput};
use termbbs::BbsError;
mod common;

/// Takes a lock, then waits on input that never comes.
struct LockAndBlock;

#[async_trait]
impl SessionApp for LockAndBlock {
    async fn run(&self, ctx: &mut SessionContext) -> termbbs::Result<()> {
        ctx.db
            .acquire_lock("users", "alice", Duration::from_secs(1))
            .await?;
        ctx.io.write_line("locked");
        let _ = ctx.io.read_line().await?;
        Ok(())
    }
}

/// Announces itself, then queues for a lock someone else holds.
struct WaitForLock;

#[async_trait]
impl SessionApp for WaitForLock {
    async fn run(&self, ctx: &mut SessionContext) -> termbbs::Result<()> {
        ctx.io.write_line("waiting");
        ctx.db
            .acquire_lock("boards", "general", Duration::from_secs(30))
            .await?;
        ctx.io.write_line("granted");
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl SessionApp for Panics {
    async fn run(&self, ctx: &mut SessionContext) -> termbbs::Result<()> {
        ctx.io.write_line("about to fail");
        panic!("boom");
    }
}

#[tokio::test]
async fn terminate_unblocks_a_pending_read_and_releases_locks() {
    let (_tmp, proxy, manager) = common::manager(4);
    let (io, mut peer) = common::terminal(ProtocolKind::Telnet, 4001);
    let permit = manager.try_admit().unwrap();
    let handle = manager.spawn(permit, io, Arc::new(LockAndBlock)).unwrap();
    let id = handle.id();

    assert!(peer.read_until("locked", common::WAIT).await.contains("locked"));
    assert!(manager.terminate(id));

    let exit = tokio::time::timeout(common::WAIT, handle.wait())
        .await
        .expect("session did not unwind");
    assert!(matches!(exit, SessionExit::Terminated(_)));

    let farewell = peer.read_until("Disconnected", common::WAIT).await;
    assert!(farewell.contains("Disconnected by the server."));

    // The lock was released before the session was deregistered.
    let other = proxy.connect().unwrap();
    other
        .acquire_lock("users", "alice", Duration::ZERO)
        .await
        .unwrap();
    assert!(manager.registry().find(id).is_none());
    assert_eq!(manager.active(), 0);
    // Terminating again finds nothing.
    assert!(!manager.terminate(id));
}

#[tokio::test]
async fn terminate_interrupts_a_pending_lock_wait() {
    let (_tmp, proxy, manager) = common::manager(4);
    let owner = proxy.connect().unwrap();
    owner
        .acquire_lock("boards", "general", Duration::ZERO)
        .await
        .unwrap();

    let (io, mut peer) = common::terminal(ProtocolKind::Telnet, 4101);
    let handle = manager
        .spawn(manager.try_admit().unwrap(), io, Arc::new(WaitForLock))
        .unwrap();
    assert!(peer.read_until("waiting", common::WAIT).await.contains("waiting"));

    // Make sure the session is queued in the engine before pulling the plug.
    let deadline = tokio::time::Instant::now() + common::WAIT;
    while proxy.stats().await.unwrap().waiting == 0 {
        assert!(tokio::time::Instant::now() < deadline, "session never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(manager.terminate(handle.id()));
    let exit = tokio::time::timeout(common::WAIT, handle.wait())
        .await
        .expect("session stuck in its lock wait");
    assert!(matches!(exit, SessionExit::Terminated(_)));
    assert_eq!(proxy.stats().await.unwrap().waiting, 0);

    // The owner's release must not hand the lock to the dead session.
    owner.release("boards", "general").await.unwrap();
    assert_eq!(proxy.stats().await.unwrap().held_locks, 0);
    let next = proxy.connect().unwrap();
    next.acquire_lock("boards", "general", Duration::ZERO)
        .await
        .unwrap();
    let rest = peer.read_until("granted", Duration::from_millis(100)).await;
    assert!(!rest.contains("granted"), "got {:?}", rest);
}

#[tokio::test]
async fn capacity_is_enforced_before_session_creation() {
    let (_tmp, _proxy, manager) = common::manager(2);
    let mut handles = Vec::new();
    let mut peers = Vec::new();
    for port in 0..2 {
        let (io, peer) = common::terminal(ProtocolKind::Ssh, 5000 + port);
        let permit = manager.try_admit().unwrap();
        handles.push(manager.spawn(permit, io, common::echo_app()).unwrap());
        peers.push(peer);
    }
    assert_eq!(manager.active(), 2);

    let err = manager.try_admit().unwrap_err();
    assert!(matches!(err, BbsError::CapacityExceeded { max: 2 }));
    assert_eq!(manager.registry().len(), 2);

    // Ending one session frees its slot.
    assert!(peers[0].eof().await);
    let first = handles.remove(0);
    assert_eq!(first.wait().await, SessionExit::Completed);
    assert!(manager.try_admit().is_ok());
}

#[tokio::test]
async fn dropped_permit_frees_capacity() {
    let (_tmp, _proxy, manager) = common::manager(1);
    let permit = manager.try_admit().unwrap();
    assert!(manager.try_admit().is_err());
    drop(permit);
    assert!(manager.try_admit().is_ok());
}

#[tokio::test]
async fn panicking_session_does_not_affect_others() {
    let (_tmp, _proxy, manager) = common::manager(4);

    let (io_ok, mut peer_ok) = common::terminal(ProtocolKind::Telnet, 6001);
    let ok = manager
        .spawn(manager.try_admit().unwrap(), io_ok, common::echo_app())
        .unwrap();
    let (io_bad, mut peer_bad) = common::terminal(ProtocolKind::Telnet, 6002);
    let bad = manager
        .spawn(manager.try_admit().unwrap(), io_bad, Arc::new(Panics))
        .unwrap();

    assert!(matches!(bad.wait().await, SessionExit::Fault(_)));
    let out = peer_bad.read_until("Internal error", common::WAIT).await;
    assert!(out.contains("Internal error"));

    assert!(peer_ok.read_until("ready", common::WAIT).await.contains("ready"));
    peer_ok.send_line("still here").await;
    assert!(peer_ok
        .read_until("> still here", common::WAIT)
        .await
        .contains("> still here"));
    assert!(manager.registry().find(ok.id()).is_some());
    assert_eq!(manager.registry().len(), 1);
}

#[tokio::test]
async fn idle_sessions_are_closed() {
    let (_tmp, proxy) = common::engine();
    let manager = SessionManager::new(2, proxy, Some(Duration::from_millis(100)));
    let (io, mut peer) = common::terminal(ProtocolKind::Telnet, 7001);
    let handle = manager
        .spawn(manager.try_admit().unwrap(), io, common::echo_app())
        .unwrap();
    let exit = tokio::time::timeout(common::WAIT, handle.wait())
        .await
        .unwrap();
    assert_eq!(exit, SessionExit::IdleTimeout);
    assert!(peer.read_until("Idle timeout", common::WAIT).await.contains("Idle timeout"));
}

#[tokio::test]
async fn terminate_all_and_drain() {
    let (_tmp, _proxy, manager) = common::manager(3);
    let mut peers = Vec::new();
    for port in 0..3 {
        let (io, peer) = common::terminal(ProtocolKind::Telnet, 8000 + port);
        manager
            .spawn(manager.try_admit().unwrap(), io, common::echo_app())
            .unwrap();
        peers.push(peer);
    }
    assert_eq!(manager.terminate_all("Server shutting down."), 3);
    assert!(manager.drain(common::WAIT).await);
    assert!(manager.registry().is_empty());
    for peer in &mut peers {
        let mut closed = None;
        while let Ok(Some(out)) = tokio::time::timeout(common::WAIT, peer.output.recv()).await {
            if let TermOutput::Close(reason) = out {
                closed = Some(reason);
                break;
            }
        }
        assert_eq!(closed.as_deref(), Some("Server shutting down."));
    }
}

#[tokio::test]
async fn broadcast_and_private_messages_reach_terminals_only() {
    let (_tmp, _proxy, manager) = common::manager(4);
    let (io_a, mut peer_a) = common::terminal(ProtocolKind::Telnet, 9001);
    let (io_b, mut peer_b) = common::terminal(ProtocolKind::Ssh, 9002);
    let (io_f, _peer_f) = common::terminal(ProtocolKind::Sftp, 9003);
    let a = manager
        .spawn(manager.try_admit().unwrap(), io_a, common::echo_app())
        .unwrap();
    let b = manager
        .spawn(manager.try_admit().unwrap(), io_b, common::echo_app())
        .unwrap();
    let f = manager
        .spawn(manager.try_admit().unwrap(), io_f, common::echo_app())
        .unwrap();

    assert_eq!(manager.broadcast("maintenance at noon"), 2);
    assert!(peer_a
        .read_until("maintenance at noon", common::WAIT)
        .await
        .contains("*** maintenance at noon"));
    assert!(peer_b
        .read_until("maintenance at noon", common::WAIT)
        .await
        .contains("maintenance"));

    assert!(manager.send(a.id(), b.id(), "hi there"));
    let got = peer_b.read_until("hi there", common::WAIT).await;
    assert!(got.contains(&format!("Message from guest{}: hi there", a.id())));
    assert!(!manager.send(a.id(), f.id(), "files only"));
    assert!(!manager.send(a.id(), SessionId(9999), "nobody"));
}
