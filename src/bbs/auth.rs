//! Password authentication over the storage proxy.
//!
//! Accounts live as JSON records in the `users` namespace, keyed by the canonical
//! (lowercase) username. Passwords are Argon2id PHC strings.
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use serde::{Deserialize, Serialize};

use crate::config::Argon2Config;
use crate::error::{BbsError, Result};
use crate::logutil::escape_log;
use crate::storage::{DbProxy, ProxyHandle};
use crate::validation::validate_user_name;

pub const USERS_NS: &str = "users";
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

/// Pluggable credential check shared by the shell `LOGIN` command and SSH.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check credentials. On success returns the canonical username.
    async fn authenticate(&self, username: &str, password: &str) -> Result<String>;
}

/// Build the Argon2id hasher, honouring configured cost parameters.
pub fn hasher(cfg: Option<&Argon2Config>) -> Argon2<'static> {
    let Some(a) = cfg else {
        return Argon2::default();
    };
    let base = Params::DEFAULT;
    let mem = a.memory_kib.unwrap_or(base.m_cost());
    let time = a.time_cost.unwrap_or(base.t_cost());
    let para = a.parallelism.unwrap_or(base.p_cost());
    match Params::new(mem, time, para, None) {
        Ok(params) => Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        Err(e) => {
            warn!("invalid argon2 parameters ({}), using defaults", e);
            Argon2::default()
        }
    }
}

pub fn hash_password(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(BbsError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let salt = SaltString::generate(&mut rand::thread_rng());
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| BbsError::InternalFault(format!("password hash failure: {}", e)))
}

/// Create or replace an account's password. Returns the canonical username.
pub async fn set_password(
    db: &ProxyHandle,
    argon2: &Argon2<'_>,
    username: &str,
    password: &str,
) -> Result<String> {
    let name = validate_user_name(username).map_err(|e| BbsError::Validation(e.to_string()))?;
    let password_hash = hash_password(argon2, password)?;
    let _guard = db.lock(USERS_NS, &name, db.default_lock_timeout()).await?;
    let record = match db.get_json::<UserRecord>(USERS_NS, &name).await? {
        Some(existing) => UserRecord {
            password_hash,
            ..existing
        },
        None => UserRecord {
            username: name.clone(),
            password_hash,
            created_at: Utc::now(),
            last_login: None,
        },
    };
    db.set_json(USERS_NS, &name, &record).await?;
    info!(target: "security", "password set for {}", escape_log(&name));
    Ok(name)
}

/// Verifies against the `users` namespace through its own proxy handle.
pub struct StoreAuthenticator {
    db: ProxyHandle,
    argon2: Argon2<'static>,
}

impl StoreAuthenticator {
    pub fn new(proxy: &DbProxy, cfg: Option<&Argon2Config>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            db: proxy.connect()?,
            argon2: hasher(cfg),
        }))
    }

    pub fn handle(&self) -> &ProxyHandle {
        &self.db
    }

    pub async fn set_password(&self, username: &str, password: &str) -> Result<String> {
        set_password(&self.db, &self.argon2, username, password).await
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        let name = validate_user_name(username)
            .map_err(|_| BbsError::Auth(escape_log(username)))?;
        let Some(mut record) = self.db.get_json::<UserRecord>(USERS_NS, &name).await? else {
            warn!(target: "security", "login for unknown user {}", escape_log(&name));
            return Err(BbsError::Auth(name));
        };
        let parsed = PasswordHash::new(&record.password_hash)
            .map_err(|e| BbsError::InternalFault(format!("corrupt password hash: {}", e)))?;
        if self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            warn!(target: "security", "bad password for {}", escape_log(&name));
            return Err(BbsError::Auth(name));
        }
        record.last_login = Some(Utc::now());
        // Best effort; a locked record only loses the timestamp.
        if let Err(e) = self.db.set_json(USERS_NS, &name, &record).await {
            warn!("could not record login time for {}: {}", escape_log(&name), e);
        }
        info!(target: "security", "login ok for {}", escape_log(&name));
        Ok(name)
    }
}
