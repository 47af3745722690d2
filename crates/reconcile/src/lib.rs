//! Catalog set reconciler: parse and validate the declarative spec, render
//! every catalog, diff against the currently-applied set and apply the plan
//! with minimal disruption. The applied set is a single arc-swapped snapshot
//! replaced only after a fully successful pass.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::join_all;
use metrics::{counter, histogram};
use quarry_core::{
    CatalogError, ReconcileError, ReconciledSet, RenderedCatalog, SecretBundle, SecretError,
    SpecValidationError,
};
use quarry_render::Renderer;
use quarry_secrets::{resolve_with_retry, SecretStore};
use quarry_trust::TrustStore;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

pub mod sink;
pub mod spec;

pub use sink::{ArtifactSink, FsSink, MemorySink};
pub use spec::{SpecDoc, ValidatedSpec};

/// Ordered operations for one pass. Removals are applied first so a renamed
/// catalog never collides with its old artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_add: Vec<String>,
    pub to_update: Vec<String>,
    pub to_remove: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// Compare a freshly rendered catalog set against the applied one.
pub fn diff(prior: &ReconciledSet, next: &BTreeMap<String, RenderedCatalog>) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for (name, rc) in next {
        match prior.catalogs.get(name) {
            None => plan.to_add.push(name.clone()),
            Some(old) if old.content_hash != rc.content_hash => plan.to_update.push(name.clone()),
            Some(_) => {}
        }
    }
    for name in prior.catalogs.keys() {
        if !next.contains_key(name) {
            plan.to_remove.push(name.clone());
        }
    }
    plan
}

/// Owns the applied set for one node. All mutation goes through a pass.
pub struct Reconciler {
    renderer: Renderer,
    conf_dir: PathBuf,
    applied: ArcSwap<ReconciledSet>,
}

impl Reconciler {
    pub fn new(conf_dir: impl Into<PathBuf>, initial: Option<ReconciledSet>) -> Self {
        let conf_dir = conf_dir.into();
        Self {
            renderer: Renderer::new(&conf_dir),
            conf_dir,
            applied: ArcSwap::from_pointee(initial.unwrap_or_default()),
        }
    }

    /// Snapshot of the last successfully applied set. Readers may hold this
    /// across passes; it is never mutated in place.
    pub fn applied(&self) -> Arc<ReconciledSet> {
        self.applied.load_full()
    }

    /// Run one full pass. On any failure the applied set is left untouched.
    pub async fn reconcile(
        &self,
        spec_text: &str,
        secrets: &dyn SecretStore,
        sink: &dyn ArtifactSink,
        dry_run: bool,
    ) -> Result<ReconcilePlan, ReconcileError> {
        let t0 = std::time::Instant::now();
        counter!("reconcile_attempts", 1u64);

        let doc = SpecDoc::parse(spec_text)?;
        let spec = doc.validate()?;

        // Dry runs must not leave trust material behind; render against a
        // read-only view of the store instead.
        let mut trust_store = if dry_run {
            TrustStore::preview(&self.conf_dir)?
        } else {
            TrustStore::open(&self.conf_dir)?
        };
        for cert in &spec.certs {
            trust_store.import(cert)?;
        }
        let trust = if trust_store.is_empty() { None } else { Some(trust_store.handle()) };

        // Secrets for independent catalogs resolve concurrently; each id is
        // fetched once even when several catalogs share it.
        let ids: BTreeSet<&str> =
            spec.catalogs.iter().filter_map(|c| c.secret_id.as_deref()).collect();
        let lookups = ids.iter().map(|id| async move {
            (*id, resolve_with_retry(secrets, id, None).await)
        });
        let resolved: FxHashMap<&str, Result<SecretBundle, SecretError>> =
            join_all(lookups).await.into_iter().collect();

        let mut failures: Vec<(String, CatalogError)> = Vec::new();
        let mut collisions: Vec<String> = Vec::new();
        let mut next: BTreeMap<String, RenderedCatalog> = BTreeMap::new();
        for cat in &spec.catalogs {
            let backend = &spec.backends[&cat.backend];
            let secret = match cat.secret_id.as_deref() {
                Some(id) => match &resolved[id] {
                    Ok(bundle) => Some(bundle),
                    Err(e) => {
                        failures.push((cat.name.clone(), e.clone().into()));
                        continue;
                    }
                },
                None => None,
            };
            match self.renderer.render(cat, backend, secret, trust.as_ref()) {
                Ok(rendered) => {
                    for rc in rendered {
                        if next.insert(rc.name.clone(), rc.clone()).is_some() {
                            collisions.push(format!(
                                "rendered catalog name {:?} produced by more than one spec entry",
                                rc.name
                            ));
                        }
                    }
                }
                Err(e) => failures.push((cat.name.clone(), e)),
            }
        }
        if !collisions.is_empty() {
            counter!("reconcile_err", 1u64);
            return Err(SpecValidationError { problems: collisions }.into());
        }
        if !failures.is_empty() {
            counter!("reconcile_err", 1u64);
            return Err(ReconcileError::Catalogs { failures });
        }

        let prior = self.applied.load_full();
        let plan = diff(&prior, &next);
        if dry_run {
            return Ok(plan);
        }

        // Removals first, then adds/updates; unchanged entries untouched.
        // A removed catalog takes its aux artifacts (credential blobs) along.
        for name in &plan.to_remove {
            sink.remove_catalog(name).map_err(|e| ReconcileError::Apply {
                catalog: name.clone(),
                reason: e.to_string(),
            })?;
            if let Some(old) = prior.catalogs.get(name) {
                for file in old.aux.keys() {
                    sink.remove_aux(file).map_err(|e| ReconcileError::Apply {
                        catalog: name.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        let next_set = ReconciledSet::from_catalogs(next);
        for name in plan.to_add.iter().chain(plan.to_update.iter()) {
            sink.write_catalog(&next_set.catalogs[name]).map_err(|e| ReconcileError::Apply {
                catalog: name.clone(),
                reason: e.to_string(),
            })?;
        }
        // Aux files an updated render no longer produces are stale too.
        for name in &plan.to_update {
            if let Some(old) = prior.catalogs.get(name) {
                for file in old.aux.keys() {
                    if !next_set.catalogs[name].aux.contains_key(file) {
                        sink.remove_aux(file).map_err(|e| ReconcileError::Apply {
                            catalog: name.clone(),
                            reason: e.to_string(),
                        })?;
                    }
                }
            }
        }
        if !plan.is_noop() {
            sink.signal_restart(&next_set.fingerprint).map_err(|e| ReconcileError::Apply {
                catalog: "(restart)".to_string(),
                reason: e.to_string(),
            })?;
        }

        info!(
            fingerprint = %next_set.fingerprint,
            added = plan.to_add.len(),
            updated = plan.to_update.len(),
            removed = plan.to_remove.len(),
            "reconcile pass applied"
        );
        self.applied.store(Arc::new(next_set));
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_ok", 1u64);
        Ok(plan)
    }

    /// Remove a single catalog by name. Returns false when nothing matched.
    pub fn remove(&self, name: &str, sink: &dyn ArtifactSink) -> Result<bool, ReconcileError> {
        let prior = self.applied.load_full();
        if !prior.catalogs.contains_key(name) {
            return Ok(false);
        }
        sink.remove_catalog(name).map_err(|e| ReconcileError::Apply {
            catalog: name.to_string(),
            reason: e.to_string(),
        })?;
        for file in prior.catalogs[name].aux.keys() {
            sink.remove_aux(file).map_err(|e| ReconcileError::Apply {
                catalog: name.to_string(),
                reason: e.to_string(),
            })?;
        }
        let mut catalogs = prior.catalogs.clone();
        catalogs.remove(name);
        let next_set = ReconciledSet::from_catalogs(catalogs);
        sink.signal_restart(&next_set.fingerprint).map_err(|e| ReconcileError::Apply {
            catalog: "(restart)".to_string(),
            reason: e.to_string(),
        })?;
        info!(catalog = name, fingerprint = %next_set.fingerprint, "catalog removed");
        self.applied.store(Arc::new(next_set));
        Ok(true)
    }

    /// Directory holding shared artifacts (trust store, aux files).
    pub fn conf_dir(&self) -> &std::path::Path {
        &self.conf_dir
    }
}

/// Spawn the single-pass worker loop. Requests arriving while a pass is in
/// flight coalesce down to the newest spec; superseded intermediates are
/// dropped, never queued. The watch channel publishes the fingerprint after
/// each successful pass.
pub fn spawn_reconcile_loop(
    reconciler: Arc<Reconciler>,
    secrets: Arc<dyn SecretStore>,
    sink: Arc<dyn ArtifactSink>,
    cap: usize,
) -> (mpsc::Sender<String>, watch::Receiver<String>) {
    let (tx, mut rx) = mpsc::channel::<String>(cap);
    let initial = reconciler.applied().fingerprint.clone();
    let (fp_tx, fp_rx) = watch::channel(initial);

    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            // Coalesce: only the latest pending spec matters.
            let mut latest = first;
            let mut superseded = 0u64;
            while let Ok(newer) = rx.try_recv() {
                latest = newer;
                superseded += 1;
            }
            if superseded > 0 {
                counter!("reconcile_superseded", superseded);
                warn!(superseded, "dropped superseded reconcile requests");
            }
            match reconciler.reconcile(&latest, secrets.as_ref(), sink.as_ref(), false).await {
                Ok(plan) => {
                    if !plan.is_noop() {
                        let _ = fp_tx.send(reconciler.applied().fingerprint.clone());
                    }
                }
                Err(e) => error!(error = %e, "reconcile pass failed; applied set retained"),
            }
        }
        info!("reconcile loop stopped");
    });

    (tx, fp_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::DbCredential;
    use quarry_secrets::StaticSecretStore;

    const SPEC_SALES: &str = r#"
catalogs:
  sales:
    backend: dwh
    secret-id: sales-creds
backends:
  dwh:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;

    fn store_with(entries: &[(&str, &str, &str)]) -> StaticSecretStore {
        let mut store = StaticSecretStore::new();
        for (id, user, password) in entries {
            let mut replicas = BTreeMap::new();
            replicas.insert(
                "rw".to_string(),
                DbCredential {
                    user: user.to_string(),
                    password: password.to_string(),
                    suffix: None,
                },
            );
            store.insert(id.to_string(), SecretBundle::Database { replicas });
        }
        store
    }

    fn reconciler() -> (Reconciler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let r = Reconciler::new(dir.path().join("conf"), None);
        (r, dir)
    }

    #[tokio::test]
    async fn end_to_end_postgresql_catalog() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();

        let plan = r.reconcile(SPEC_SALES, &secrets, &sink, false).await.unwrap();
        assert_eq!(plan.to_add, vec!["sales".to_string()]);
        assert!(plan.to_update.is_empty() && plan.to_remove.is_empty());

        let props = sink.catalogs.lock().unwrap()["sales"].clone();
        assert!(props.contains("connection-url=jdbc:postgresql://db:5432"));
        assert!(props.contains("connection-user=trino"));
        assert!(props.contains("connection-password=p1"));
        assert!(!props.contains("{SSL_"));
        assert_eq!(r.applied().catalogs.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_spec_is_a_noop() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();

        let first = r.reconcile(SPEC_SALES, &secrets, &sink, false).await.unwrap();
        assert!(!first.is_noop());
        let second = r.reconcile(SPEC_SALES, &secrets, &sink, false).await.unwrap();
        assert!(second.is_noop());
        // No re-render side effects: exactly one restart signal.
        assert_eq!(sink.restart_count(), 1);
    }

    #[tokio::test]
    async fn diff_add_update_remove() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("a-creds", "u", "p"), ("b-creds", "u", "p"), ("c-creds", "u", "p")]);
        let sink = MemorySink::new();

        let before = r#"
catalogs:
  a:
    backend: db
    secret-id: a-creds
  b:
    backend: db
    secret-id: b-creds
backends:
  db:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;
        r.reconcile(before, &secrets, &sink, false).await.unwrap();

        let after = r#"
catalogs:
  b:
    backend: db
    secret-id: b-creds
    database: fresh
  c:
    backend: db
    secret-id: c-creds
backends:
  db:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;
        let plan = r.reconcile(after, &secrets, &sink, false).await.unwrap();
        assert_eq!(plan.to_remove, vec!["a".to_string()]);
        assert_eq!(plan.to_update, vec!["b".to_string()]);
        assert_eq!(plan.to_add, vec!["c".to_string()]);
        assert!(!sink.catalogs.lock().unwrap().contains_key("a"));
    }

    #[tokio::test]
    async fn removing_the_only_catalog() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();
        r.reconcile(SPEC_SALES, &secrets, &sink, false).await.unwrap();

        let emptied = r#"
backends:
  dwh:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;
        let plan = r.reconcile(emptied, &secrets, &sink, false).await.unwrap();
        assert_eq!(plan.to_remove, vec!["sales".to_string()]);
        assert!(plan.to_add.is_empty() && plan.to_update.is_empty());
    }

    #[tokio::test]
    async fn failing_pass_retains_the_prior_set_and_names_every_culprit() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();
        r.reconcile(SPEC_SALES, &secrets, &sink, false).await.unwrap();
        let before = r.applied();

        let broken = r#"
catalogs:
  sales:
    backend: dwh
    secret-id: sales-creds
  orders:
    backend: dwh
    secret-id: missing-1
  users:
    backend: dwh
    secret-id: missing-2
backends:
  dwh:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;
        let err = r.reconcile(broken, &secrets, &sink, false).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2 catalog(s) failed"), "{msg}");
        assert!(msg.contains("orders") && msg.contains("users"));
        // Atomic: nothing applied, prior snapshot intact.
        assert_eq!(r.applied().fingerprint, before.fingerprint);
        assert_eq!(sink.restart_count(), 1);
    }

    #[tokio::test]
    async fn removed_catalog_takes_its_aux_artifacts_along() {
        let (r, _dir) = reconciler();
        let mut secrets = StaticSecretStore::new();
        let mut accounts = BTreeMap::new();
        accounts.insert("proj-1".to_string(), "{}".to_string());
        secrets.insert("bq-creds", SecretBundle::ServiceAccount { accounts });
        let sink = MemorySink::new();

        let with_events = r#"
catalogs:
  events:
    backend: bq
    secret-id: bq-creds
    project: proj-1
backends:
  bq:
    connector: bigquery
    url: unused
"#;
        r.reconcile(with_events, &secrets, &sink, false).await.unwrap();
        assert!(sink.aux.lock().unwrap().contains_key("events.json"));

        let emptied = r#"
backends:
  bq:
    connector: bigquery
    url: unused
"#;
        let plan = r.reconcile(emptied, &secrets, &sink, false).await.unwrap();
        assert_eq!(plan.to_remove, vec!["events".to_string()]);
        assert!(!sink.catalogs.lock().unwrap().contains_key("events"));
        // The credential blob must not outlive its catalog.
        assert!(!sink.aux.lock().unwrap().contains_key("events.json"));
    }

    #[tokio::test]
    async fn remove_by_name_takes_aux_artifacts_along() {
        let (r, _dir) = reconciler();
        let mut secrets = StaticSecretStore::new();
        let mut accounts = BTreeMap::new();
        accounts.insert("proj-1".to_string(), "{}".to_string());
        secrets.insert("bq-creds", SecretBundle::ServiceAccount { accounts });
        let sink = MemorySink::new();

        let spec = r#"
catalogs:
  events:
    backend: bq
    secret-id: bq-creds
    project: proj-1
backends:
  bq:
    connector: bigquery
    url: unused
"#;
        r.reconcile(spec, &secrets, &sink, false).await.unwrap();
        assert!(r.remove("events", &sink).unwrap());
        assert!(!sink.aux.lock().unwrap().contains_key("events.json"));
    }

    #[tokio::test]
    async fn dry_run_leaves_no_trust_material() {
        let dir = tempfile::tempdir().unwrap();
        let r = Reconciler::new(dir.path().join("conf"), None);
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();

        let spec = r#"
catalogs:
  sales:
    backend: dwh
    secret-id: sales-creds
backends:
  dwh:
    connector: postgresql
    url: jdbc:postgresql://db:5432?sslrootcert={SSL_PATH}
certs:
  dwh: |
    -----BEGIN CERTIFICATE-----
    MIIBszCCAVmgAwIBAgIUX
    -----END CERTIFICATE-----
"#;
        let plan = r.reconcile(spec, &secrets, &sink, true).await.unwrap();
        assert_eq!(plan.to_add, vec!["sales".to_string()]);
        assert!(!dir.path().join("conf/truststore.pem").exists());
        assert!(!dir.path().join("conf/.truststore.pass").exists());
    }

    #[tokio::test]
    async fn validation_rejects_before_touching_secrets() {
        struct Exploding;
        impl SecretStore for Exploding {
            fn resolve(&self, _: &str) -> Result<SecretBundle, SecretError> {
                panic!("secret resolved for an invalid spec");
            }
        }
        let (r, _dir) = reconciler();
        let sink = MemorySink::new();
        let bad = r#"
catalogs:
  sales:
    backend: ghost
    secret-id: sales-creds
backends:
  dwh:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;
        let err = r.reconcile(bad, &Exploding, &sink, false).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[tokio::test]
    async fn dry_run_never_writes() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();
        let plan = r.reconcile(SPEC_SALES, &secrets, &sink, true).await.unwrap();
        assert_eq!(plan.to_add, vec!["sales".to_string()]);
        assert!(sink.catalogs.lock().unwrap().is_empty());
        assert_eq!(sink.restart_count(), 0);
        assert!(r.applied().is_empty());
    }

    #[tokio::test]
    async fn remove_by_name() {
        let (r, _dir) = reconciler();
        let secrets = store_with(&[("sales-creds", "trino", "p1")]);
        let sink = MemorySink::new();
        r.reconcile(SPEC_SALES, &secrets, &sink, false).await.unwrap();

        assert!(r.remove("sales", &sink).unwrap());
        assert!(r.applied().is_empty());
        assert!(!r.remove("sales", &sink).unwrap());
        assert_eq!(sink.restart_count(), 2);
    }

    #[tokio::test]
    async fn loop_coalesces_to_the_newest_spec() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(Reconciler::new(dir.path().join("conf"), None));
        let secrets: Arc<dyn SecretStore> = Arc::new(store_with(&[
            ("sales-creds", "trino", "p1"),
            ("ops-creds", "ops", "p2"),
        ]));
        let sink = Arc::new(MemorySink::new());

        let intermediate = SPEC_SALES;
        let newest = r#"
catalogs:
  ops:
    backend: dwh
    secret-id: ops-creds
backends:
  dwh:
    connector: postgresql
    url: jdbc:postgresql://db:5432
"#;

        let (tx, mut fp_rx) = spawn_reconcile_loop(
            reconciler.clone(),
            secrets,
            sink.clone() as Arc<dyn ArtifactSink>,
            8,
        );
        // Queue both before the worker can pick anything up; only the
        // newest should be applied.
        tx.send(intermediate.to_string()).await.unwrap();
        tx.send(newest.to_string()).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), fp_rx.changed())
            .await
            .expect("fingerprint publication")
            .unwrap();

        let applied = reconciler.applied();
        assert!(applied.catalogs.contains_key("ops"));
        assert!(!applied.catalogs.contains_key("sales"));
        assert_eq!(sink.restart_count(), 1);
        drop(tx);
    }
}
