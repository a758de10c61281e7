//! # Configuration Management Module
//!
//! All runtime settings for termbbs live in a single TOML file, loaded once at startup
//! and shared read-only by the listeners, the session manager and the storage engine.
//!
//! ## Configuration Structure
//!
//! - [`BbsConfig`] - Board identity, sysop account and session limits
//! - [`TelnetConfig`] - Telnet listener and option negotiation timeout
//! - [`SshConfig`] - SSH listener, host key and anonymous login policy
//! - [`SftpConfig`] - Read-only file area served over the SSH `sftp` subsystem
//! - [`StorageConfig`] - Storage engine location, lock timeouts and liveness sweeps
//! - [`LoggingConfig`] - Log level and files
//! - [`SecurityConfig`] - Password hashing parameters
//!
//! ## Configuration File Format
//!
//! ```toml
//! [bbs]
//! name = "termbbs"
//! sysop = "sysop"
//! max_sessions = 32
//! idle_timeout = 10
//!
//! [telnet]
//! enabled = true
//! bind = "0.0.0.0:6023"
//!
//! [storage]
//! data_dir = "./data"
//! lock_timeout_ms = 5000
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use termbbs::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Board: {} (max {} sessions)", config.bbs.name, config.bbs.max_sessions);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::validation::validate_sysop_name;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bbs: BbsConfig,
    #[serde(default)]
    pub telnet: TelnetConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub sftp: SftpConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: Option<SecurityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsConfig {
    pub name: String,
    pub sysop: String,
    #[serde(default)]
    pub welcome_message: String,
    /// Hard cap on concurrently running sessions across all protocols.
    pub max_sessions: usize,
    /// Minutes without input before a session is ended. 0 disables.
    pub idle_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelnetConfig {
    pub enabled: bool,
    pub bind: String,
    /// How long to wait for option replies before degrading to defaults.
    #[serde(default = "default_negotiate_timeout_ms")]
    pub negotiate_timeout_ms: u64,
}

fn default_negotiate_timeout_ms() -> u64 {
    1500
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:6023".to_string(),
            negotiate_timeout_ms: default_negotiate_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub enabled: bool,
    pub bind: String,
    /// OpenSSH or PKCS#8 private key. When unset an ephemeral key is generated per start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_path: Option<String>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Accept the names in `anonymous_names` with any password.
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default = "default_anonymous_names")]
    pub anonymous_names: Vec<String>,
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_anonymous_names() -> Vec<String> {
    vec!["anonymous".to_string(), "guest".to_string()]
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:6022".to_string(),
            host_key_path: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            allow_anonymous: false,
            anonymous_names: default_anonymous_names(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub enabled: bool,
    /// Directory exposed read-only to SFTP clients.
    pub root: String,
    /// Largest READ reply in bytes.
    #[serde(default = "default_max_read")]
    pub max_read: u32,
}

fn default_max_read() -> u32 {
    32 * 1024
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: "./data/files".to_string(),
            max_read: default_max_read(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Default wait for `acquire_lock` when the caller does not pass one.
    pub lock_timeout_ms: u64,
    /// Interval between sweeps that drop locks of dead proxy handles. 0 disables.
    #[serde(default = "default_liveness_sweep_secs")]
    pub liveness_sweep_secs: u64,
    /// Log every proxied command at debug level (target `termbbs::db`).
    #[serde(default)]
    pub tap_db: bool,
}

fn default_liveness_sweep_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Argon2Config {
    #[serde(default)]
    pub memory_kib: Option<u32>,
    #[serde(default)]
    pub time_cost: Option<u32>,
    #[serde(default)]
    pub parallelism: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub argon2: Option<Argon2Config>,
}

impl BbsConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.idle_timeout) * 60))
        }
    }
}

impl TelnetConfig {
    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiate_timeout_ms)
    }
}

impl SshConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn liveness_sweep(&self) -> Option<Duration> {
        if self.liveness_sweep_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.liveness_sweep_secs))
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_sysop_name(&self.bbs.sysop)
            .map_err(|e| anyhow!("Invalid sysop name '{}': {}", self.bbs.sysop, e))?;
        if self.bbs.max_sessions == 0 {
            return Err(anyhow!("bbs.max_sessions must be at least 1"));
        }
        if !self.telnet.enabled && !self.ssh.enabled {
            return Err(anyhow!("at least one of telnet or ssh must be enabled"));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(anyhow!("storage.data_dir cannot be empty"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bbs: BbsConfig {
                name: "termbbs".to_string(),
                sysop: "sysop".to_string(),
                welcome_message: "Welcome aboard. Type HELP for commands.".to_string(),
                max_sessions: 32,
                idle_timeout: 10,
            },
            telnet: TelnetConfig::default(),
            ssh: SshConfig::default(),
            sftp: SftpConfig::default(),
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                lock_timeout_ms: 5000,
                liveness_sweep_secs: default_liveness_sweep_secs(),
                tap_db: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("termbbs.log".to_string()),
                security_file: Some("termbbs-security.log".to_string()),
            },
            security: Some(SecurityConfig::default()),
        }
    }
}
