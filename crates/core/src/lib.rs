//! Quarry core types: catalog model, connector taxonomy, fingerprints.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod error;

pub use error::{
    CatalogError, PropagationError, ReconcileError, RenderError, SecretError,
    SpecValidationError, TrustError,
};

/// Placeholder tokens a backend URL/config may embed; resolved against the
/// trust store at render time.
pub const SSL_PATH_TOKEN: &str = "{SSL_PATH}";
pub const SSL_PWD_TOKEN: &str = "{SSL_PWD}";

/// The finite set of supported connectors. Anything else is rejected at
/// validation time, before any secret is touched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Connector {
    Postgresql,
    Mysql,
    Redshift,
    Bigquery,
    Elasticsearch,
    Gsheets,
    Prometheus,
    Redis,
}

/// How a connector sources credentials and shapes its property file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorFamily {
    /// connection-url/user/password properties, role-keyed database secret.
    Jdbc,
    /// JSON service-account blob materialized next to the properties file.
    ServiceAccount,
    /// connector.name plus merged config only.
    Passthrough,
}

impl Connector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connector::Postgresql => "postgresql",
            Connector::Mysql => "mysql",
            Connector::Redshift => "redshift",
            Connector::Bigquery => "bigquery",
            Connector::Elasticsearch => "elasticsearch",
            Connector::Gsheets => "gsheets",
            Connector::Prometheus => "prometheus",
            Connector::Redis => "redis",
        }
    }

    pub fn family(&self) -> ConnectorFamily {
        match self {
            Connector::Postgresql | Connector::Mysql | Connector::Redshift => {
                ConnectorFamily::Jdbc
            }
            Connector::Bigquery | Connector::Gsheets => ConnectorFamily::ServiceAccount,
            Connector::Elasticsearch | Connector::Prometheus | Connector::Redis => {
                ConnectorFamily::Passthrough
            }
        }
    }
}

impl FromStr for Connector {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgresql" => Ok(Connector::Postgresql),
            "mysql" => Ok(Connector::Mysql),
            "redshift" => Ok(Connector::Redshift),
            "bigquery" => Ok(Connector::Bigquery),
            "elasticsearch" => Ok(Connector::Elasticsearch),
            "gsheets" => Ok(Connector::Gsheets),
            "prometheus" => Ok(Connector::Prometheus),
            "redis" => Ok(Connector::Redis),
            other => Err(RenderError::UnsupportedConnector(other.to_string())),
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reusable connector template parameterized by individual catalogs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendTemplate {
    pub name: String,
    pub connector: Connector,
    /// Base connection URL; may embed `{SSL_PATH}` / `{SSL_PWD}`.
    pub url: String,
    /// Query-string fragment appended as `?params`.
    pub params: Option<String>,
    /// Shared `key=value` lines merged into every catalog using this backend.
    pub config: Option<String>,
}

/// One desired catalog: a named connection from the engine to a data source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogSpec {
    pub name: String,
    pub backend: String,
    /// Required for credentialed connector families; passthrough connectors
    /// may omit it.
    pub secret_id: Option<String>,
    pub database: Option<String>,
    pub project: Option<String>,
    pub metasheet_id: Option<String>,
    /// Catalog-level `key=value` lines; win over backend config on conflict.
    pub config: Option<String>,
}

/// Certificate material supplied out-of-band. The id tags the catalog or
/// backend that consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertBundle {
    pub id: String,
    pub pem: String,
}

/// One database role credential inside a resolved secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbCredential {
    pub user: String,
    pub password: String,
    /// Appended to the catalog name so one spec can fan out per replica.
    #[serde(default)]
    pub suffix: Option<String>,
}

/// Resolved credential material, shaped by connector family. Resolved once
/// per pass and never retained beyond it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SecretBundle {
    Database {
        replicas: BTreeMap<String, DbCredential>,
    },
    ServiceAccount {
        /// Keyed by project id (bigquery) or catalog name (gsheets).
        accounts: BTreeMap<String, String>,
    },
}

/// A finished per-catalog property set. Deterministic: identical inputs
/// always produce the identical `content_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedCatalog {
    pub name: String,
    pub properties: String,
    pub content_hash: String,
    /// Extra files the catalog needs next to its properties (e.g. a
    /// service-account JSON blob), keyed by file name.
    #[serde(default)]
    pub aux: BTreeMap<String, String>,
}

impl RenderedCatalog {
    pub fn new(name: impl Into<String>, properties: impl Into<String>) -> Self {
        let name = name.into();
        let properties = properties.into();
        let content_hash = content_hash(&properties);
        Self { name, properties, content_hash, aux: BTreeMap::new() }
    }

    pub fn with_aux(mut self, file: impl Into<String>, body: impl Into<String>) -> Self {
        self.aux.insert(file.into(), body.into());
        self
    }
}

/// The currently-applied catalog set plus its aggregate fingerprint.
/// Replaced as a whole after a successful pass, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ReconciledSet {
    pub catalogs: BTreeMap<String, RenderedCatalog>,
    pub fingerprint: String,
}

impl ReconciledSet {
    pub fn from_catalogs(catalogs: BTreeMap<String, RenderedCatalog>) -> Self {
        let fingerprint = aggregate_fingerprint(&catalogs);
        Self { catalogs, fingerprint }
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}

/// The unit exchanged between the coordinator and dependent nodes.
/// Delivered atomically; consumers must treat redelivery as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfigMessage {
    pub discovery_uri: String,
    pub fingerprint: String,
    pub artifacts: BTreeMap<String, String>,
}

/// SHA-256 hex digest of a property text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex(&hasher.finalize())
}

/// Aggregate fingerprint over all content hashes in name-sorted order, so
/// the input declaration order never affects the result.
pub fn aggregate_fingerprint(catalogs: &BTreeMap<String, RenderedCatalog>) -> String {
    let mut hasher = Sha256::new();
    for (name, rc) in catalogs {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(rc.content_hash.as_bytes());
        hasher.update([0u8]);
    }
    hex(&hasher.finalize())
}

/// Catalog names become file names and SQL identifiers; keep them tight.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
