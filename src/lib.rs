//! # termbbs - A Multi-User Terminal Bulletin Board
//!
//! termbbs serves a classic line-oriented BBS over telnet and SSH, plus a read-only file
//! area over SFTP. Every session runs as its own supervised task and talks to one shared
//! store through a proxy handle, so a misbehaving caller can only ever lose its own
//! connection.
//!
//! ## Features
//!
//! - **Telnet**: ECHO/SGA/NAWS negotiation with graceful fallback for dumb clients.
//! - **SSH**: Password or anonymous login, PTY sizing and window-change tracking.
//! - **SFTP**: Read-only browsing and download of a configured directory.
//! - **Shared store**: A single-writer engine over sled with per-key exclusive locks,
//!   FIFO waiters and crash recovery of orphaned locks.
//! - **Administration**: `WHO`, `MSG`, `KICK` and `BROADCAST` from the shell.
//! - **Security**: Argon2id passwords and a dedicated `security` log target.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termbbs::config::Config;
//! use termbbs::bbs::BbsServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = BbsServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bbs`] - Server lifecycle, session manager, registry, shell and accounts
//! - [`protocol`] - Telnet, SSH and SFTP adapters producing a uniform [`protocol::TerminalIo`]
//! - [`storage`] - Storage engine, proxy handles and the lock table
//! - [`config`] - Configuration loading and validation
//! - [`validation`] - Name, key and path validation
//! - [`error`] - The crate error type
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Protocol       │ ← telnet / ssh / sftp adapters
//! │  Adapters       │
//! └─────────────────┘
//!          │ TerminalIo
//! ┌─────────────────┐
//! │  Session        │ ← one supervised task per caller
//! │  Manager        │
//! └─────────────────┘
//!          │ ProxyHandle
//! ┌─────────────────┐
//! │  Storage        │ ← single-writer engine task
//! │  Engine         │
//! └─────────────────┘
//! ```

pub mod bbs;
pub mod config;
pub mod error;
pub mod logutil;
pub mod metrics;
pub mod protocol;
pub mod storage;
pub mod validation;

pub use error::{BbsError, Result};
