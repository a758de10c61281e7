//! # BBS Core Module
//!
//! Everything above the transport: who is connected, what they run, and how the board
//! starts and stops.
//!
//! ## Components
//!
//! - [`server`] - Startup, listener accept loops and graceful shutdown
//! - [`manager`] - Admission control, per-session supervision and termination
//! - [`registry`] - Shared table of live sessions used by `WHO`, `MSG` and `KICK`
//! - [`session`] - Session identity, context and the [`SessionApp`] trait
//! - [`shell`] - The built-in line shell
//! - [`auth`] - Argon2id password accounts stored through the proxy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  BbsServer      │ ← listeners, signal handling
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  SessionManager │ ← permits, supervisors, registry
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  SessionApp     │ ← Shell or SFTP, one ProxyHandle each
//! └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use termbbs::bbs::BbsServer;
//! use termbbs::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = BbsServer::new(config).await?;
//!     server.run().await
//! }
//! ```

pub mod auth;
pub mod manager;
pub mod registry;
pub mod server;
pub mod session;
pub mod shell;

pub use manager::{SessionExit, SessionHandle, SessionManager, SessionPermit};
pub use registry::SessionRegistry;
pub use server::BbsServer;
pub use session::{SessionApp, SessionContext, SessionId, SessionInfo};
pub use shell::Shell;
