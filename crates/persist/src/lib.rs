//! Minimal SQLite store for applied catalog sets. Used for warm starts: the
//! reconciler seeds its prior set from here so the first pass after a process
//! restart diffs against what is actually on disk instead of re-applying
//! everything. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use quarry_core::ReconciledSet;

/// One applied set for one node, as recorded after a successful pass.
#[derive(Debug, Clone)]
pub struct AppliedRecord {
    pub node: String,
    pub fingerprint: String,
    pub ts: i64,
    pub set: ReconciledSet,
}

pub trait Store {
    fn put_applied(&self, record: AppliedRecord) -> Result<()>;
    fn last_applied(&self, node: &str) -> Result<Option<AppliedRecord>>;
    fn history(&self, node: &str, limit: Option<usize>) -> Result<Vec<AppliedRecord>>;
}

/// SQLite-backed store. Simple, synchronous; the reconcile path is not
/// latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("QUARRY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS applied_set (
                node        TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                ts          INTEGER NOT NULL,
                artifacts   TEXT NOT NULL
            )",
            [],
        )
        .context("creating applied_set table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_applied_set_node_ts ON applied_set(node, ts DESC)",
            [],
        )
        .ok();
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl Store for SqliteStore {
    fn put_applied(&self, record: AppliedRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let artifacts =
            serde_json::to_string(&record.set).context("serializing applied set")?;
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO applied_set(node, fingerprint, ts, artifacts) VALUES (?1, ?2, ?3, ?4)",
            (&record.node, &record.fingerprint, record.ts, &artifacts),
        )?;
        // Keep latest 3 by ts per node (delete older rows by rowid)
        tx.execute(
            "DELETE FROM applied_set
             WHERE node = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM applied_set WHERE node = ?1 ORDER BY ts DESC, rowid DESC LIMIT 3
               )",
            [&record.node],
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn last_applied(&self, node: &str) -> Result<Option<AppliedRecord>> {
        Ok(self.history(node, Some(1))?.into_iter().next())
    }

    fn history(&self, node: &str, limit: Option<usize>) -> Result<Vec<AppliedRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(3);
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT fingerprint, ts, artifacts FROM applied_set
             WHERE node = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((node, cap as i64))?;
        let mut out: Vec<AppliedRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let fingerprint: String = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let artifacts: String = row.get(2)?;
            let set: ReconciledSet =
                serde_json::from_str(&artifacts).context("deserializing applied set")?;
            out.push(AppliedRecord { node: node.to_string(), fingerprint, ts, set });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".quarry");
        let _ = std::fs::create_dir_all(&p);
        p.push("quarry.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "quarry.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::RenderedCatalog;
    use std::collections::BTreeMap;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "quarry-test-{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    fn set(key: &str, value: &str) -> ReconciledSet {
        let mut catalogs = BTreeMap::new();
        catalogs
            .insert(key.to_string(), RenderedCatalog::new(key, format!("k={}\n", value)));
        ReconciledSet::from_catalogs(catalogs)
    }

    #[test]
    fn put_get_rotate() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        for i in 0..5 {
            let applied = set("sales", &format!("v{}", i));
            s.put_applied(AppliedRecord {
                node: "coordinator".to_string(),
                fingerprint: applied.fingerprint.clone(),
                ts: i as i64,
                set: applied,
            })
            .unwrap();
        }
        let rows = s.history("coordinator", None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].set.catalogs["sales"].properties, "k=v4\n");
        assert_eq!(rows[2].set.catalogs["sales"].properties, "k=v2\n");
    }

    #[test]
    fn last_applied_round_trips_the_set() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        assert!(s.last_applied("coordinator").unwrap().is_none());

        let applied = set("sales", "v1");
        let fp = applied.fingerprint.clone();
        s.put_applied(AppliedRecord {
            node: "coordinator".to_string(),
            fingerprint: fp.clone(),
            ts: now_ts(),
            set: applied.clone(),
        })
        .unwrap();

        let got = s.last_applied("coordinator").unwrap().unwrap();
        assert_eq!(got.fingerprint, fp);
        assert_eq!(got.set, applied);
    }

    #[test]
    fn nodes_are_isolated() {
        let path = temp_db();
        let s = SqliteStore::open(&path).unwrap();
        let applied = set("sales", "v1");
        s.put_applied(AppliedRecord {
            node: "worker-0".to_string(),
            fingerprint: applied.fingerprint.clone(),
            ts: 1,
            set: applied,
        })
        .unwrap();
        assert!(s.last_applied("coordinator").unwrap().is_none());
        assert!(s.last_applied("worker-0").unwrap().is_some());
    }
}
