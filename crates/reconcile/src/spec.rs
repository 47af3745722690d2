//! Declarative catalog spec document: YAML parsing and reference validation.
//! Validation runs before any secret is resolved and reports every problem
//! it finds, not just the first.

use std::collections::BTreeMap;
use std::str::FromStr;

use quarry_core::{
    is_valid_name, BackendTemplate, CatalogSpec, CertBundle, Connector, ConnectorFamily,
    ReconcileError, SpecValidationError,
};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// The document operators supply in full on every change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecDoc {
    #[serde(default)]
    pub catalogs: BTreeMap<String, CatalogDoc>,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendDoc>,
    #[serde(default)]
    pub certs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CatalogDoc {
    pub backend: String,
    pub secret_id: Option<String>,
    pub database: Option<String>,
    pub project: Option<String>,
    pub metasheet_id: Option<String>,
    pub config: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendDoc {
    /// Kept as text here so an unknown connector is reported alongside the
    /// other validation problems instead of failing the whole parse.
    pub connector: String,
    pub url: String,
    pub params: Option<String>,
    pub config: Option<String>,
}

/// A spec that passed reference validation; safe to resolve secrets for.
#[derive(Debug, Clone)]
pub struct ValidatedSpec {
    pub catalogs: Vec<CatalogSpec>,
    pub backends: FxHashMap<String, BackendTemplate>,
    pub certs: Vec<CertBundle>,
}

impl SpecDoc {
    pub fn parse(text: &str) -> Result<Self, ReconcileError> {
        serde_yaml::from_str(text).map_err(|e| ReconcileError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<ValidatedSpec, SpecValidationError> {
        let mut problems = Vec::new();

        let mut backends = FxHashMap::default();
        for (name, doc) in &self.backends {
            if !is_valid_name(name) {
                problems.push(format!("invalid backend name {name:?}"));
            }
            match Connector::from_str(&doc.connector) {
                Ok(connector) => {
                    backends.insert(
                        name.clone(),
                        BackendTemplate {
                            name: name.clone(),
                            connector,
                            url: doc.url.clone(),
                            params: doc.params.clone(),
                            config: doc.config.clone(),
                        },
                    );
                }
                Err(_) => problems.push(format!(
                    "backend {name:?} uses unsupported connector {:?}",
                    doc.connector
                )),
            }
        }

        let mut catalogs = Vec::with_capacity(self.catalogs.len());
        for (name, doc) in &self.catalogs {
            if !is_valid_name(name) {
                problems.push(format!("invalid catalog name {name:?}"));
            }
            match backends.get(&doc.backend) {
                None => {
                    if !self.backends.contains_key(&doc.backend) {
                        problems.push(format!(
                            "catalog {name:?} references unknown backend {:?}",
                            doc.backend
                        ));
                    }
                    // Backend exists but was itself invalid; already reported.
                }
                Some(backend) => {
                    let needs_secret = backend.connector.family() != ConnectorFamily::Passthrough;
                    if needs_secret && doc.secret_id.is_none() {
                        problems.push(format!(
                            "catalog {name:?} ({}) requires a secret-id",
                            backend.connector
                        ));
                    }
                }
            }
            catalogs.push(CatalogSpec {
                name: name.clone(),
                backend: doc.backend.clone(),
                secret_id: doc.secret_id.clone(),
                database: doc.database.clone(),
                project: doc.project.clone(),
                metasheet_id: doc.metasheet_id.clone(),
                config: doc.config.clone(),
            });
        }

        let mut certs = Vec::with_capacity(self.certs.len());
        for (id, pem) in &self.certs {
            let known = self.catalogs.contains_key(id) || self.backends.contains_key(id);
            if !known {
                problems.push(format!("cert {id:?} matches no declared catalog or backend"));
            }
            certs.push(CertBundle { id: id.clone(), pem: pem.clone() });
        }

        if !problems.is_empty() {
            return Err(SpecValidationError { problems });
        }
        Ok(ValidatedSpec { catalogs, backends, certs })
    }
}
