//! Secret resolution: typed credential bundles fetched by opaque id.
//! Plaintext is handed to the caller for the current pass only; nothing is
//! cached here.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use quarry_core::{SecretBundle, SecretError};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Narrow interface over the external secret storage backend.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, secret_id: &str) -> Result<SecretBundle, SecretError>;
}

fn default_attempts() -> u32 {
    std::env::var("QUARRY_SECRET_RETRIES")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(3)
}

/// Resolve with bounded exponential backoff. Only transient errors retry;
/// a missing secret or a missing field requires spec correction, not time.
pub async fn resolve_with_retry(
    store: &dyn SecretStore,
    secret_id: &str,
    attempts: Option<u32>,
) -> Result<SecretBundle, SecretError> {
    let max = attempts.unwrap_or_else(default_attempts).max(1);
    let mut delay = Duration::from_millis(50);
    let mut last = None;
    for attempt in 1..=max {
        match store.resolve(secret_id) {
            Ok(bundle) => {
                debug!(secret_id, attempt, "secret resolved");
                return Ok(bundle);
            }
            Err(e) if e.is_transient() && attempt < max => {
                warn!(secret_id, attempt, error = %e, "transient secret error; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable with max >= 1, but keep the type checker honest.
    Err(last.unwrap_or(SecretError::NotFound(secret_id.to_string())))
}

/// In-memory store, used for tests and for specs supplied inline.
#[derive(Default)]
pub struct StaticSecretStore {
    entries: FxHashMap<String, SecretBundle>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, secret_id: impl Into<String>, bundle: SecretBundle) {
        self.entries.insert(secret_id.into(), bundle);
    }
}

impl SecretStore for StaticSecretStore {
    fn resolve(&self, secret_id: &str) -> Result<SecretBundle, SecretError> {
        self.entries
            .get(secret_id)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(secret_id.to_string()))
    }
}

/// Directory-backed store: one JSON document per secret id.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SecretStore for FileSecretStore {
    fn resolve(&self, secret_id: &str) -> Result<SecretBundle, SecretError> {
        let path = self.dir.join(format!("{secret_id}.json"));
        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(secret_id.to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(SecretError::Unauthorized(secret_id.to_string()));
            }
            Err(e) => {
                return Err(SecretError::Transient {
                    id: secret_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        serde_json::from_str(&raw).map_err(|e| SecretError::Malformed {
            id: secret_id.to_string(),
            field: e.to_string(),
        })
    }
}
