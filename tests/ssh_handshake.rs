#![cfg(feature = "ssh")]

use std::sync::Arc;
use std::time::Duration;

use termbbs::bbs::auth::{Authenticator, StoreAuthenticator};
use termbbs::bbs::server::{serve_adapter, Apps};
use termbbs::bbs::SessionManager;
use termbbs::config::SshConfig;
use termbbs::protocol::ssh::SshAdapter;
use termbbs::protocol::ProtocolAdapter;
use termbbs::storage::DbProxy;
use termbbs::BbsError;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
mod common;

async fn adapter(handshake_timeout_secs: u64) -> (tempfile::TempDir, DbProxy, SshAdapter) {
    let (tmp, proxy) = common::engine();
    let auth: Arc<dyn Authenticator> = StoreAuthenticator::new(&proxy, None).unwrap();
    let cfg = SshConfig {
        enabled: true,
        bind: "127.0.0.1:0".into(),
        handshake_timeout_secs,
        ..SshConfig::default()
    };
    let adapter = SshAdapter::bind(&cfg, false, auth).await.unwrap();
    (tmp, proxy, adapter)
}

#[tokio::test]
async fn silent_client_times_out_during_handshake() {
    let (_tmp, _proxy, adapter) = adapter(1).await;
    let _client = TcpStream::connect(adapter.local_addr().unwrap()).await.unwrap();
    let conn = adapter.accept().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(4), adapter.negotiate(conn))
        .await
        .expect("negotiate outlived the handshake timeout");
    assert!(matches!(result, Err(BbsError::Timeout(_))));
}

#[tokio::test]
async fn silent_clients_give_their_slot_back() {
    let (_tmp, proxy, adapter) = adapter(1).await;
    let addr = adapter.local_addr().unwrap();
    let manager = SessionManager::new(1, proxy, None);
    let apps = Apps {
        shell: common::echo_app(),
        sftp: None,
    };
    tokio::spawn(serve_adapter(Arc::new(adapter), manager.clone(), apps));

    let _client = TcpStream::connect(addr).await.unwrap();
    let deadline = tokio::time::Instant::now() + common::WAIT;
    while manager.active() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "connection never admitted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The handshake deadline passes with nothing sent, and the slot comes back.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while manager.active() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "slot still held by a silent client");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(manager.try_admit().is_ok());
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn refusal_is_an_ssh_disconnect() {
    let (_tmp, _proxy, adapter) = adapter(5).await;
    let mut client = TcpStream::connect(adapter.local_addr().unwrap()).await.unwrap();
    let conn = adapter.accept().await.unwrap();
    adapter.refuse(conn, "all 1 nodes are busy").await.unwrap();

    let mut got = Vec::new();
    tokio::time::timeout(common::WAIT, client.read_to_end(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert!(got.starts_with(b"SSH-2.0-termbbs\r\n"));
    let packet = &got[b"SSH-2.0-termbbs\r\n".len()..];
    // Message number right after the length and padding-length fields.
    assert_eq!(packet[5], 1);
    assert!(String::from_utf8_lossy(packet).contains("all 1 nodes are busy"));
}
