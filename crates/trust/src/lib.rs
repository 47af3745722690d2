//! Shared trust store: imports certificate blocks supplied out-of-band and
//! exposes the substitution values for `{SSL_PATH}` / `{SSL_PWD}` template
//! placeholders. Imports are idempotent by content digest.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use quarry_core::{CertBundle, TrustError, SSL_PATH_TOKEN, SSL_PWD_TOKEN};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

const STORE_FILE: &str = "truststore.pem";
const PASS_FILE: &str = ".truststore.pass";

/// What a rendered catalog needs to reference the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustHandle {
    pub store_path: PathBuf,
    pub passphrase: String,
}

impl TrustHandle {
    /// Replace `{SSL_PATH}` / `{SSL_PWD}` occurrences with store values.
    pub fn substitute(&self, text: &str) -> String {
        text.replace(SSL_PATH_TOKEN, &self.store_path.display().to_string())
            .replace(SSL_PWD_TOKEN, &self.passphrase)
    }
}

/// A concatenated PEM bundle on disk plus its access passphrase. The
/// passphrase survives restarts so rendered output stays stable.
pub struct TrustStore {
    store_path: PathBuf,
    passphrase: String,
    imported: BTreeSet<String>,
    persist: bool,
}

impl TrustStore {
    pub fn open(conf_dir: &Path) -> Result<Self, TrustError> {
        std::fs::create_dir_all(conf_dir).map_err(|e| TrustError::Import {
            id: "truststore".to_string(),
            reason: format!("creating {}: {e}", conf_dir.display()),
        })?;
        Self::load(conf_dir, true)
    }

    /// Read-only view for plan/dry-run passes: imports are tracked in memory
    /// and substitution uses the persisted passphrase when one exists, but
    /// nothing touches disk.
    pub fn preview(conf_dir: &Path) -> Result<Self, TrustError> {
        Self::load(conf_dir, false)
    }

    fn load(conf_dir: &Path, persist: bool) -> Result<Self, TrustError> {
        let store_path = conf_dir.join(STORE_FILE);
        let pass_path = conf_dir.join(PASS_FILE);

        let passphrase = match std::fs::read_to_string(&pass_path) {
            Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                let fresh = generate_passphrase();
                if persist {
                    std::fs::write(&pass_path, &fresh).map_err(|e| TrustError::Import {
                        id: "truststore".to_string(),
                        reason: format!("writing passphrase: {e}"),
                    })?;
                }
                fresh
            }
        };

        let mut imported = BTreeSet::new();
        if let Ok(existing) = std::fs::read_to_string(&store_path) {
            for block in split_pem_blocks(&existing) {
                imported.insert(digest(&block));
            }
        }

        debug!(path = %store_path.display(), certs = imported.len(), persist, "trust store opened");
        Ok(Self { store_path, passphrase, imported, persist })
    }

    pub fn handle(&self) -> TrustHandle {
        TrustHandle { store_path: self.store_path.clone(), passphrase: self.passphrase.clone() }
    }

    /// Import one certificate bundle. Re-importing identical content is a
    /// no-op that returns the same handle.
    pub fn import(&mut self, bundle: &CertBundle) -> Result<TrustHandle, TrustError> {
        let pem = normalize_pem(&bundle.id, &bundle.pem)?;
        let mut appended = 0usize;
        for block in split_pem_blocks(&pem) {
            let d = digest(&block);
            if self.imported.contains(&d) {
                continue;
            }
            if self.persist {
                append_block(&self.store_path, &block).map_err(|e| TrustError::Import {
                    id: bundle.id.clone(),
                    reason: e.to_string(),
                })?;
            }
            self.imported.insert(d);
            appended += 1;
        }
        if appended > 0 {
            info!(id = %bundle.id, appended, "certificates added to trust store");
        }
        Ok(self.handle())
    }

    /// Replace `{SSL_PATH}` / `{SSL_PWD}` occurrences with store values.
    pub fn substitute(&self, text: &str) -> String {
        self.handle().substitute(text)
    }

    pub fn is_empty(&self) -> bool {
        self.imported.is_empty()
    }
}

/// Accept certificates as plain PEM or base64-wrapped PEM.
fn normalize_pem(id: &str, raw: &str) -> Result<String, TrustError> {
    let trimmed = raw.trim();
    if trimmed.contains("-----BEGIN CERTIFICATE-----") {
        return Ok(trimmed.to_string());
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(trimmed.as_bytes())
        .map_err(|e| TrustError::Import { id: id.to_string(), reason: format!("not PEM or base64: {e}") })?;
    let text = String::from_utf8(decoded).map_err(|_| TrustError::Import {
        id: id.to_string(),
        reason: "decoded certificate is not UTF-8".to_string(),
    })?;
    if !text.contains("-----BEGIN CERTIFICATE-----") {
        return Err(TrustError::Import {
            id: id.to_string(),
            reason: "no CERTIFICATE block found".to_string(),
        });
    }
    Ok(text.trim().to_string())
}

fn split_pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    let mut inside = false;
    for line in pem.lines() {
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            inside = true;
            current.clear();
        }
        if inside {
            current.push(line);
        }
        if line.starts_with("-----END CERTIFICATE-----") && inside {
            blocks.push(current.join("\n"));
            inside = false;
        }
    }
    blocks
}

fn append_block(path: &Path, block: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{block}")
}

fn digest(block: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_passphrase() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
