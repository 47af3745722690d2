//! Authentication chain and access-control mode. Federated OAuth and a static
//! user/password list may be active at the same time; the engine consumes the
//! result as an ordered authenticator chain plus a password db file the
//! authenticator re-reads on its refresh period, so user rotation needs no
//! restart.

#![forbid(unsafe_code)]

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const PASSWORD_DB_FILE: &str = "password.db";
pub const AUTHENTICATOR_FILE: &str = "password-authenticator.properties";
pub const OAUTH_FILE: &str = "oauth2.properties";
const PASSWORD_REFRESH_PERIOD: &str = "1m";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("static user line {line} is not user:password: {text:?}")]
    InvalidUserLine { line: usize, text: String },
    #[error("static user {user:?} declared twice (lines {first} and {second})")]
    DuplicateUser { user: String, first: usize, second: usize },
    #[error("oauth config missing {field}")]
    MissingOauthField { field: &'static str },
}

/// Federated OAuth client registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OauthConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
}

/// The engine-consumable result: authenticator files plus the mechanism
/// chain, in the order the engine should try them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChainSpec {
    pub mechanisms: Vec<&'static str>,
    /// `(file name, body)` pairs to materialize under the conf directory.
    pub artifacts: Vec<(String, String)>,
}

impl AuthChainSpec {
    pub fn is_open(&self) -> bool {
        self.mechanisms.is_empty()
    }
}

/// Parse line-oriented `user:password` pairs. Blank lines and `#` comments
/// are skipped; anything else malformed is rejected with its line number.
pub fn parse_static_users(text: &str) -> Result<Vec<(String, String)>, AuthError> {
    let mut users: Vec<(String, String)> = Vec::new();
    let mut seen: Vec<(String, usize)> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (user, password) = trimmed
            .split_once(':')
            .ok_or_else(|| AuthError::InvalidUserLine { line, text: trimmed.to_string() })?;
        let user = user.trim();
        if user.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidUserLine { line, text: trimmed.to_string() });
        }
        if let Some((_, first)) = seen.iter().find(|(u, _)| u == user) {
            return Err(AuthError::DuplicateUser {
                user: user.to_string(),
                first: *first,
                second: line,
            });
        }
        seen.push((user.to_string(), line));
        users.push((user.to_string(), password.to_string()));
    }
    Ok(users)
}

/// Merge the enabled mechanisms into one chain. Order is fixed: OAuth first
/// when present, then the password file. Neither enabled yields an open
/// chain with no artifacts.
pub fn build_auth_chain(
    conf_dir: &Path,
    oauth: Option<&OauthConfig>,
    static_users: Option<&str>,
) -> Result<AuthChainSpec, AuthError> {
    let mut mechanisms = Vec::new();
    let mut artifacts = Vec::new();

    if let Some(cfg) = oauth {
        if cfg.issuer.is_empty() {
            return Err(AuthError::MissingOauthField { field: "issuer" });
        }
        if cfg.client_id.is_empty() {
            return Err(AuthError::MissingOauthField { field: "client-id" });
        }
        if cfg.client_secret.is_empty() {
            return Err(AuthError::MissingOauthField { field: "client-secret" });
        }
        mechanisms.push("OAUTH2");
        artifacts.push((
            OAUTH_FILE.to_string(),
            format!(
                "http-server.authentication.oauth2.issuer={}\n\
                 http-server.authentication.oauth2.client-id={}\n\
                 http-server.authentication.oauth2.client-secret={}\n",
                cfg.issuer, cfg.client_id, cfg.client_secret
            ),
        ));
    }

    if let Some(text) = static_users {
        let users = parse_static_users(text)?;
        let mut db = String::new();
        for (user, password) in &users {
            db.push_str(user);
            db.push(':');
            db.push_str(password);
            db.push('\n');
        }
        mechanisms.push("PASSWORD");
        artifacts.push((
            AUTHENTICATOR_FILE.to_string(),
            format!(
                "password-authenticator.name=file\n\
                 file.password-file={}\n\
                 file.refresh-period={}\n",
                conf_dir.join(PASSWORD_DB_FILE).display(),
                PASSWORD_REFRESH_PERIOD
            ),
        ));
        artifacts.push((PASSWORD_DB_FILE.to_string(), db));
        info!(users = users.len(), "password authenticator enabled");
    }

    Ok(AuthChainSpec { mechanisms, artifacts })
}

/// Default access decision when no external authorization engine rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    All,
    None,
}

/// Who governs access decisions right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveMode {
    /// An external authorization engine is connected; its decisions rule.
    External,
    /// No external engine; the configured default governs.
    Default(AccessMode),
}

/// Resolve the effective access mode. An external engine that is expected
/// but not reachable means deny-all, never a silent fallback to allow.
pub fn build_access_mode(
    policy_expected: bool,
    policy_active: bool,
    configured_default: AccessMode,
) -> EffectiveMode {
    if policy_active {
        return EffectiveMode::External;
    }
    if policy_expected {
        return EffectiveMode::Default(AccessMode::None);
    }
    EffectiveMode::Default(configured_default)
}
