//! Input validation for usernames, storage addresses and file-area paths.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Username validation errors with helpful messages
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsernameError {
    #[error("Username is too short (minimum {min} characters)")]
    TooShort { min: usize },

    #[error("Username is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("Username contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },

    #[error("Username is a reserved system name")]
    Reserved,
}

/// Storage address errors (namespace / key).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("{what} cannot be empty")]
    Empty { what: &'static str },

    #[error("{what} is too long (maximum {max} bytes)")]
    TooLong { what: &'static str, max: usize },

    #[error("{what} contains a NUL byte")]
    Nul { what: &'static str },
}

pub const MAX_NAMESPACE_LEN: usize = 64;
pub const MAX_KEY_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct UsernameRules {
    pub min_length: usize,
    pub max_length: usize,
    pub allow_reserved: bool,
}

impl UsernameRules {
    /// Rules for the configured sysop account. The sysop logs in like any user, so
    /// reserved names are refused here too.
    pub fn sysop() -> Self {
        UsernameRules {
            min_length: 2,
            max_length: 20,
            allow_reserved: false,
        }
    }

    /// Rules for accounts created through `passwd` or used at SSH login.
    pub fn user() -> Self {
        UsernameRules {
            min_length: 2,
            max_length: 30,
            allow_reserved: false,
        }
    }
}

fn reserved_names() -> HashSet<&'static str> {
    [
        "admin", "administrator", "root", "system", "operator", "guest", "anonymous",
        "nobody", "daemon", "who", "help", "login", "logout", "quit", "all",
    ]
    .iter()
    .copied()
    .collect()
}

/// Validate a username. Returns the canonical (lowercased) form used as storage key.
pub fn validate_username(username: &str, rules: &UsernameRules) -> Result<String, UsernameError> {
    if username.chars().count() < rules.min_length {
        return Err(UsernameError::TooShort {
            min: rules.min_length,
        });
    }
    if username.chars().count() > rules.max_length {
        return Err(UsernameError::TooLong {
            max: rules.max_length,
        });
    }

    let invalid: HashSet<char> = username
        .chars()
        .filter(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || *c == '.'))
        .collect();
    if !invalid.is_empty() {
        let mut chars: Vec<char> = invalid.into_iter().collect();
        chars.sort_unstable();
        return Err(UsernameError::InvalidCharacters {
            chars: chars.into_iter().collect(),
        });
    }

    let lower = username.to_ascii_lowercase();
    if !rules.allow_reserved && reserved_names().contains(lower.as_str()) {
        return Err(UsernameError::Reserved);
    }
    Ok(lower)
}

pub fn validate_user_name(name: &str) -> Result<String, UsernameError> {
    validate_username(name, &UsernameRules::user())
}

pub fn validate_sysop_name(name: &str) -> Result<String, UsernameError> {
    validate_username(name, &UsernameRules::sysop())
}

/// Validate a storage namespace. NUL is the namespace/key separator on disk.
pub fn validate_namespace(ns: &str) -> Result<(), AddressError> {
    validate_part(ns, "namespace", MAX_NAMESPACE_LEN)
}

pub fn validate_key(key: &str) -> Result<(), AddressError> {
    validate_part(key, "key", MAX_KEY_LEN)
}

fn validate_part(value: &str, what: &'static str, max: usize) -> Result<(), AddressError> {
    if value.is_empty() {
        return Err(AddressError::Empty { what });
    }
    if value.len() > max {
        return Err(AddressError::TooLong { what, max });
    }
    if value.contains('\0') {
        return Err(AddressError::Nul { what });
    }
    Ok(())
}

/// Resolve a client-supplied path inside `root`, rejecting anything that climbs out.
///
/// Client paths are treated as rooted at the file area: `/`, `.` and `` all map to `root`.
/// Returns the filesystem path and the normalized virtual path (always starting with `/`).
pub fn resolve_area_path(root: &Path, requested: &str) -> Option<(PathBuf, String)> {
    let mut parts: Vec<String> = Vec::new();
    for comp in Path::new(requested).components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(p) => parts.push(p.to_str()?.to_string()),
            Component::Prefix(_) => return None,
        }
    }
    let mut fs_path = root.to_path_buf();
    for p in &parts {
        fs_path.push(p);
    }
    let virtual_path = format!("/{}", parts.join("/"));
    Some((fs_path, virtual_path))
}
