//! Catalog template renderer: backend template + catalog override + resolved
//! secret + trust material in, finished property sets out. Output is fully
//! deterministic so the reconciler can diff by content hash.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use quarry_core::{
    BackendTemplate, CatalogError, CatalogSpec, ConnectorFamily, RenderError, RenderedCatalog,
    SecretBundle, SecretError, SSL_PATH_TOKEN, SSL_PWD_TOKEN,
};
use quarry_trust::TrustHandle;
use tracing::debug;

/// Renders catalogs against a fixed configuration directory (service-account
/// blobs are referenced by their materialized path under it).
pub struct Renderer {
    conf_dir: PathBuf,
}

impl Renderer {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self { conf_dir: conf_dir.into() }
    }

    /// Render one catalog spec. A database secret carrying several replica
    /// roles fans out into one artifact per replica (`{name}{suffix}`);
    /// everything else yields exactly one artifact.
    pub fn render(
        &self,
        spec: &CatalogSpec,
        backend: &BackendTemplate,
        secret: Option<&SecretBundle>,
        trust: Option<&TrustHandle>,
    ) -> Result<Vec<RenderedCatalog>, CatalogError> {
        if references_trust(spec, backend) && trust.is_none() {
            return Err(RenderError::MissingTrustMaterial { catalog: spec.name.clone() }.into());
        }

        let merged = merge_config(spec, backend)?;

        let rendered = match backend.connector.family() {
            ConnectorFamily::Jdbc => self.render_jdbc(spec, backend, secret, &merged)?,
            ConnectorFamily::ServiceAccount => {
                self.render_service_account(spec, backend, secret, &merged)?
            }
            ConnectorFamily::Passthrough => {
                let base = vec![("connector.name".to_string(), backend.connector.to_string())];
                vec![finish(spec.name.clone(), base, &merged)]
            }
        };
        let rendered = self.substitute_trust(rendered, trust)?;
        debug!(catalog = %spec.name, connector = %backend.connector, artifacts = rendered.len(), "catalog rendered");
        Ok(rendered)
    }

    fn render_jdbc(
        &self,
        spec: &CatalogSpec,
        backend: &BackendTemplate,
        secret: Option<&SecretBundle>,
        merged: &BTreeMap<String, String>,
    ) -> Result<Vec<RenderedCatalog>, CatalogError> {
        let replicas = match secret {
            Some(SecretBundle::Database { replicas }) => replicas,
            Some(_) => {
                return Err(RenderError::SecretShape {
                    catalog: spec.name.clone(),
                    expected: "database",
                }
                .into())
            }
            None => {
                return Err(RenderError::MissingField {
                    catalog: spec.name.clone(),
                    field: "secret-id".to_string(),
                }
                .into())
            }
        };
        if replicas.is_empty() {
            return Err(SecretError::Malformed {
                id: spec.secret_id.clone().unwrap_or_default(),
                field: "replicas".to_string(),
            }
            .into());
        }

        let url = jdbc_url(spec, backend);
        // BTreeMap iteration keeps replica order stable across passes.
        let mut out = Vec::with_capacity(replicas.len());
        for cred in replicas.values() {
            let name = match &cred.suffix {
                Some(suffix) => format!("{}{}", spec.name, suffix),
                None => spec.name.clone(),
            };
            let base = vec![
                ("connector.name".to_string(), backend.connector.to_string()),
                ("connection-url".to_string(), url.clone()),
                ("connection-user".to_string(), cred.user.clone()),
                ("connection-password".to_string(), cred.password.clone()),
            ];
            out.push(finish(name, base, merged));
        }
        // Trust substitution happens on the assembled text so url, params and
        // config lines are all covered.
        Ok(out)
    }

    fn render_service_account(
        &self,
        spec: &CatalogSpec,
        backend: &BackendTemplate,
        secret: Option<&SecretBundle>,
        merged: &BTreeMap<String, String>,
    ) -> Result<Vec<RenderedCatalog>, CatalogError> {
        let accounts = match secret {
            Some(SecretBundle::ServiceAccount { accounts }) => accounts,
            Some(_) => {
                return Err(RenderError::SecretShape {
                    catalog: spec.name.clone(),
                    expected: "service-account",
                }
                .into())
            }
            None => {
                return Err(RenderError::MissingField {
                    catalog: spec.name.clone(),
                    field: "secret-id".to_string(),
                }
                .into())
            }
        };

        let creds_file = format!("{}.json", spec.name);
        let creds_path = self.conf_dir.join(&creds_file).display().to_string();

        let (account_key, base) = match backend.connector {
            quarry_core::Connector::Bigquery => {
                let project = spec.project.as_deref().ok_or(RenderError::MissingField {
                    catalog: spec.name.clone(),
                    field: "project".to_string(),
                })?;
                let base = vec![
                    ("connector.name".to_string(), backend.connector.to_string()),
                    ("bigquery.project-id".to_string(), project.to_string()),
                    ("bigquery.credentials-file".to_string(), creds_path),
                ];
                (project.to_string(), base)
            }
            _ => {
                let metasheet =
                    spec.metasheet_id.as_deref().ok_or(RenderError::MissingField {
                        catalog: spec.name.clone(),
                        field: "metasheet-id".to_string(),
                    })?;
                let base = vec![
                    ("connector.name".to_string(), backend.connector.to_string()),
                    ("gsheets.metadata-sheet-id".to_string(), metasheet.to_string()),
                    ("gsheets.credentials-path".to_string(), creds_path),
                ];
                (spec.name.clone(), base)
            }
        };

        let blob = accounts.get(&account_key).ok_or(SecretError::Malformed {
            id: spec.secret_id.clone().unwrap_or_default(),
            field: account_key.clone(),
        })?;

        Ok(vec![finish(spec.name.clone(), base, merged).with_aux(creds_file, blob.clone())])
    }

    /// Apply trust substitution across a batch of rendered catalogs and
    /// reject any leftover placeholder tokens.
    pub fn substitute_trust(
        &self,
        rendered: Vec<RenderedCatalog>,
        trust: Option<&TrustHandle>,
    ) -> Result<Vec<RenderedCatalog>, CatalogError> {
        rendered
            .into_iter()
            .map(|rc| {
                let properties = match trust {
                    Some(t) => t.substitute(&rc.properties),
                    None => rc.properties.clone(),
                };
                if properties.contains(SSL_PATH_TOKEN) || properties.contains(SSL_PWD_TOKEN) {
                    return Err(RenderError::MissingTrustMaterial { catalog: rc.name.clone() }
                        .into());
                }
                Ok(RenderedCatalog { aux: rc.aux, ..RenderedCatalog::new(rc.name, properties) })
            })
            .collect()
    }
}

fn jdbc_url(spec: &CatalogSpec, backend: &BackendTemplate) -> String {
    let mut url = backend.url.clone();
    // Redshift URLs name the database inside the template, never appended.
    if backend.connector != quarry_core::Connector::Redshift {
        if let Some(db) = &spec.database {
            url = format!("{url}/{db}");
        }
    }
    if let Some(params) = &backend.params {
        url = format!("{url}?{params}");
    }
    url
}

fn references_trust(spec: &CatalogSpec, backend: &BackendTemplate) -> bool {
    let mut texts = vec![backend.url.as_str()];
    if let Some(p) = &backend.params {
        texts.push(p);
    }
    if let Some(c) = &backend.config {
        texts.push(c);
    }
    if let Some(c) = &spec.config {
        texts.push(c);
    }
    texts
        .iter()
        .any(|t| t.contains(SSL_PATH_TOKEN) || t.contains(SSL_PWD_TOKEN))
}

/// Merge backend config lines with catalog config lines, last-write-wins by
/// key with the catalog level winning. Keyed merge keeps the result
/// independent of declaration order.
fn merge_config(
    spec: &CatalogSpec,
    backend: &BackendTemplate,
) -> Result<BTreeMap<String, String>, CatalogError> {
    let mut merged = BTreeMap::new();
    for text in [backend.config.as_deref(), spec.config.as_deref()].into_iter().flatten() {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                CatalogError::from(RenderError::InvalidConfig {
                    catalog: spec.name.clone(),
                    line: line.to_string(),
                })
            })?;
            merged.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(merged)
}

/// Assemble the property text: fixed base keys in canonical order, then the
/// merged config keys sorted. Base keys cannot be clobbered from config.
fn finish(
    name: String,
    base: Vec<(String, String)>,
    merged: &BTreeMap<String, String>,
) -> RenderedCatalog {
    let mut text = String::new();
    for (k, v) in &base {
        text.push_str(k);
        text.push('=');
        text.push_str(v);
        text.push('\n');
    }
    for (k, v) in merged {
        if base.iter().any(|(bk, _)| bk == k) {
            continue;
        }
        text.push_str(k);
        text.push('=');
        text.push_str(v);
        text.push('\n');
    }
    RenderedCatalog::new(name, text)
}
