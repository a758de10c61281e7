use std::sync::Arc;

use termbbs::bbs::auth::{Authenticator, StoreAuthenticator};
use termbbs::bbs::{SessionExit, SessionHandle, SessionManager, Shell};
use termbbs::config::{Argon2Config, Config};
use termbbs::protocol::{ProtocolKind, TermPeer};
mod common;

struct Board {
    _tmp: tempfile::TempDir,
    manager: SessionManager,
    shell: Arc<Shell>,
}

async fn board() -> Board {
    let (tmp, proxy) = common::engine();
    let cheap = Argon2Config {
        memory_kib: Some(1024),
        time_cost: Some(1),
        parallelism: Some(1),
    };
    let auth = StoreAuthenticator::new(&proxy, Some(&cheap)).unwrap();
    auth.set_password("alice", "hunter22").await.unwrap();
    auth.set_password("sysop", "letmein!").await.unwrap();

    let mut config = Config::default();
    config.bbs.name = "Test Board".into();
    config.bbs.max_sessions = 4;
    let auth: Arc<dyn Authenticator> = auth;
    Board {
        _tmp: tmp,
        manager: SessionManager::new(4, proxy, None),
        shell: Arc::new(Shell::new(&config, auth)),
    }
}

impl Board {
    async fn connect(&self, port: u16) -> (SessionHandle, TermPeer) {
        let (io, mut peer) = common::terminal(ProtocolKind::Telnet, port);
        let handle = self
            .manager
            .spawn(self.manager.try_admit().unwrap(), io, self.shell.clone())
            .unwrap();
        let banner = peer.read_until("> ", common::WAIT).await;
        assert!(banner.contains("Test Board"), "got {:?}", banner);
        (handle, peer)
    }
}

async fn run(peer: &mut TermPeer, line: &str, expect: &str) -> String {
    peer.send_line(line).await;
    let out = peer.read_until(expect, common::WAIT).await;
    assert!(out.contains(expect), "after {:?} expected {:?}, got {:?}", line, expect, out);
    out
}

async fn login(peer: &mut TermPeer, user: &str, password: &str) -> String {
    run(peer, &format!("login {}", user), "Password: ").await;
    peer.send_line(password).await;
    peer.read_until("> ", common::WAIT).await
}

#[tokio::test]
async fn guest_can_list_and_log_in() {
    let board = board().await;
    let (a, mut peer) = board.connect(1001).await;

    let who = run(&mut peer, "WHO", "nodes in use.").await;
    assert!(who.contains(&format!("guest{}", a.id())));
    assert!(who.contains("1 of 4 nodes in use."));

    let help = run(&mut peer, "help", "QUIT").await;
    assert!(!help.contains("KICK"));

    let out = login(&mut peer, "alice", "wrong-one").await;
    assert!(out.contains("Login failed."));
    // The password is masked, never echoed.
    assert!(!out.contains("wrong-one"));

    let out = login(&mut peer, "Alice", "hunter22").await;
    assert!(out.contains("Welcome back, alice."));
    assert!(out.contains("alice> "));
    assert_eq!(
        board.manager.registry().find(a.id()).unwrap().username.as_deref(),
        Some("alice")
    );

    run(&mut peer, "bogus", "Unknown command. Type HELP.").await;
    run(&mut peer, "quit", "Goodbye.").await;
    assert_eq!(a.wait().await, SessionExit::Completed);
}

#[tokio::test]
async fn sysop_commands_are_restricted() {
    let board = board().await;
    let (a, mut alice) = board.connect(2001).await;
    let (b, mut sysop) = board.connect(2002).await;

    login(&mut alice, "alice", "hunter22").await;
    run(&mut alice, &format!("kick {}", b.id()), "Permission denied.").await;
    run(&mut alice, "broadcast hello", "Permission denied.").await;

    run(&mut alice, &format!("msg {} psst", b.id()), "Message sent.").await;
    let got = sysop.read_until("psst", common::WAIT).await;
    assert!(got.contains("Message from alice: psst"), "got {:?}", got);

    let out = login(&mut sysop, "sysop", "letmein!").await;
    assert!(out.contains("Welcome back, sysop."));
    run(&mut sysop, "help", "BROADCAST").await;

    run(&mut sysop, "broadcast tea time", "Delivered to 2 session(s).").await;
    let got = alice.read_until("tea time", common::WAIT).await;
    assert!(got.contains("Broadcast from sysop: tea time"));

    run(&mut sysop, "kick alice", "Session disconnected.").await;
    let exit = tokio::time::timeout(common::WAIT, a.wait()).await.unwrap();
    assert_eq!(
        exit,
        SessionExit::Terminated("You have been disconnected by the sysop.".into())
    );
    let got = alice.read_until("sysop.", common::WAIT).await;
    assert!(got.contains("You have been disconnected by the sysop."));

    run(&mut sysop, "msg alice anyone?", "No such session.").await;
}

#[tokio::test]
async fn second_login_shows_previous_call() {
    let board = board().await;
    let (first, mut peer) = board.connect(3001).await;
    login(&mut peer, "alice", "hunter22").await;
    run(&mut peer, "quit", "Goodbye.").await;
    first.wait().await;

    let (_second, mut peer) = board.connect(3002).await;
    let out = login(&mut peer, "alice", "hunter22").await;
    assert!(out.contains("Last call:"), "got {:?}", out);
    assert!(out.contains("via telnet from 127.0.0.1:3001"), "got {:?}", out);
}

#[tokio::test]
async fn transport_authenticated_user_skips_login() {
    let board = board().await;
    let (mut io, mut peer) = common::terminal(ProtocolKind::Ssh, 4001);
    io.set_authenticated_user(Some("alice".into()));
    board
        .manager
        .spawn(board.manager.try_admit().unwrap(), io, board.shell.clone())
        .unwrap();
    let out = peer.read_until("alice> ", common::WAIT).await;
    assert!(out.contains("Logged in as alice."), "got {:?}", out);
}
