//! Where reconciled artifacts land. The engine supervisor picks the property
//! files up on its next restart/reload; the sink only materializes them and
//! records the restart request.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use quarry_core::RenderedCatalog;
use rustc_hash::FxHashMap;
use tracing::info;

pub trait ArtifactSink: Send + Sync {
    fn write_catalog(&self, catalog: &RenderedCatalog) -> Result<()>;
    fn remove_catalog(&self, name: &str) -> Result<()>;
    /// Shared (non-catalog) artifacts: service-account blobs, auth files.
    fn write_aux(&self, file: &str, body: &str) -> Result<()>;
    /// Aux artifacts hold credential material; callers remove them when the
    /// owning catalog goes away.
    fn remove_aux(&self, file: &str) -> Result<()>;
    /// Ask the supervisor for an engine restart once the pass is complete.
    fn signal_restart(&self, fingerprint: &str) -> Result<()>;
}

/// Filesystem sink: one `{name}.properties` per catalog under the catalog
/// directory, aux artifacts under the conf directory, and a restart marker
/// the supervisor watches.
pub struct FsSink {
    catalog_dir: PathBuf,
    conf_dir: PathBuf,
}

impl FsSink {
    pub fn new(catalog_dir: impl Into<PathBuf>, conf_dir: impl Into<PathBuf>) -> Result<Self> {
        let catalog_dir = catalog_dir.into();
        let conf_dir = conf_dir.into();
        std::fs::create_dir_all(&catalog_dir)
            .with_context(|| format!("creating {}", catalog_dir.display()))?;
        std::fs::create_dir_all(&conf_dir)
            .with_context(|| format!("creating {}", conf_dir.display()))?;
        Ok(Self { catalog_dir, conf_dir })
    }

    pub fn catalog_path(&self, name: &str) -> PathBuf {
        self.catalog_dir.join(format!("{name}.properties"))
    }
}

impl ArtifactSink for FsSink {
    fn write_catalog(&self, catalog: &RenderedCatalog) -> Result<()> {
        let path = self.catalog_path(&catalog.name);
        std::fs::write(&path, &catalog.properties)
            .with_context(|| format!("writing {}", path.display()))?;
        for (file, body) in &catalog.aux {
            self.write_aux(file, body)?;
        }
        Ok(())
    }

    fn remove_catalog(&self, name: &str) -> Result<()> {
        let path = self.catalog_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn write_aux(&self, file: &str, body: &str) -> Result<()> {
        let path = self.conf_dir.join(file);
        std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))
    }

    fn remove_aux(&self, file: &str) -> Result<()> {
        let path = self.conf_dir.join(file);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn signal_restart(&self, fingerprint: &str) -> Result<()> {
        let path = self.conf_dir.join(".restart-requested");
        std::fs::write(&path, fingerprint)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(fingerprint, "engine restart requested");
        Ok(())
    }
}

/// In-memory sink for tests: observable writes, removals and restart count.
#[derive(Default)]
pub struct MemorySink {
    pub catalogs: Mutex<FxHashMap<String, String>>,
    pub aux: Mutex<FxHashMap<String, String>>,
    pub restarts: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.lock().unwrap().len()
    }
}

impl ArtifactSink for MemorySink {
    fn write_catalog(&self, catalog: &RenderedCatalog) -> Result<()> {
        self.catalogs
            .lock()
            .unwrap()
            .insert(catalog.name.clone(), catalog.properties.clone());
        for (file, body) in &catalog.aux {
            self.aux.lock().unwrap().insert(file.clone(), body.clone());
        }
        Ok(())
    }

    fn remove_catalog(&self, name: &str) -> Result<()> {
        self.catalogs.lock().unwrap().remove(name);
        Ok(())
    }

    fn write_aux(&self, file: &str, body: &str) -> Result<()> {
        self.aux.lock().unwrap().insert(file.to_string(), body.to_string());
        Ok(())
    }

    fn remove_aux(&self, file: &str) -> Result<()> {
        self.aux.lock().unwrap().remove(file);
        Ok(())
    }

    fn signal_restart(&self, fingerprint: &str) -> Result<()> {
        self.restarts.lock().unwrap().push(fingerprint.to_string());
        Ok(())
    }
}
