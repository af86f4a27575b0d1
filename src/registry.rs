//! App registry with JSON snapshot persistence
//!
//! Each app is split into durable [`AppMetadata`], which is written to the
//! snapshot, and an in-memory [`AppRuntime`] holding the process handle and
//! log buffer. Only metadata ever reaches disk.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::logs::SharedLogBuffer;

/// Durable description of a deployed app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    pub name: String,
    pub port: u16,
    pub path: PathBuf,
    #[serde(default)]
    pub template: String,
    #[serde(alias = "start")]
    pub start_command: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Live state that never leaves the process
#[derive(Debug, Default)]
pub struct AppRuntime {
    pub child: Option<Child>,
    pub logs: Option<SharedLogBuffer>,
    pub folder_missing: bool,
}

/// One registry record
#[derive(Debug)]
pub struct AppEntry {
    meta: Mutex<AppMetadata>,
    runtime: Mutex<AppRuntime>,
}

impl AppEntry {
    pub fn new(meta: AppMetadata) -> Self {
        Self {
            meta: Mutex::new(meta),
            runtime: Mutex::new(AppRuntime::default()),
        }
    }

    pub fn meta(&self) -> AppMetadata {
        self.meta.lock().clone()
    }

    pub fn update_meta<R>(&self, f: impl FnOnce(&mut AppMetadata) -> R) -> R {
        f(&mut self.meta.lock())
    }

    pub fn port(&self) -> u16 {
        self.meta.lock().port
    }

    pub fn is_running(&self) -> bool {
        self.meta.lock().running
    }

    /// Take ownership of the live process handle, if any
    pub fn take_child(&self) -> Option<Child> {
        self.runtime.lock().child.take()
    }

    pub fn set_child(&self, child: Child) {
        self.runtime.lock().child = Some(child);
    }

    /// Drop the process handle if the process has exited on its own,
    /// returning its exit status. A live handle is left in place.
    pub fn reap_exited(&self) -> Option<String> {
        let mut runtime = self.runtime.lock();
        let status = crate::process::exit_status(runtime.child.as_mut()?)?;
        runtime.child = None;
        Some(status)
    }

    pub fn logs(&self) -> Option<SharedLogBuffer> {
        self.runtime.lock().logs.clone()
    }

    pub fn set_logs(&self, logs: SharedLogBuffer) {
        self.runtime.lock().logs = Some(logs);
    }

    pub fn folder_missing(&self) -> bool {
        self.runtime.lock().folder_missing
    }

    pub fn set_folder_missing(&self, missing: bool) {
        self.runtime.lock().folder_missing = missing;
    }
}

/// All known apps keyed by name, plus per-name operation locks
pub struct Registry {
    apps: DashMap<String, Arc<AppEntry>>,
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    path: PathBuf,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            apps: DashMap::new(),
            op_locks: DashMap::new(),
            path: path.into(),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize deploy/stop/restart for one name.
    ///
    /// The lock exists independently of the record so a deploy can hold it
    /// before the record is created.
    pub async fn lock_app(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.op_locks.entry(name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    pub fn get(&self, name: &str) -> Option<Arc<AppEntry>> {
        self.apps.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Insert a record, or replace the metadata of an existing one in place
    /// (keeping its runtime).
    pub fn upsert(&self, meta: AppMetadata) -> Arc<AppEntry> {
        match self.apps.get(&meta.name) {
            Some(existing) => {
                let entry = Arc::clone(existing.value());
                drop(existing);
                *entry.meta.lock() = meta;
                entry
            }
            None => {
                let entry = Arc::new(AppEntry::new(meta.clone()));
                self.apps
                    .entry(meta.name)
                    .or_insert(entry)
                    .value()
                    .clone()
            }
        }
    }

    /// Every record, sorted by name
    pub fn all(&self) -> Vec<(String, Arc<AppEntry>)> {
        let mut entries: Vec<_> = self
            .apps
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Ports held by every record other than `name`
    pub fn ports_excluding(&self, name: &str) -> HashSet<u16> {
        self.apps
            .iter()
            .filter(|e| e.key() != name)
            .map(|e| e.value().port())
            .collect()
    }

    /// Name of a running record other than `name` that owns `port`
    pub fn running_holder(&self, port: u16, name: &str) -> Option<String> {
        self.apps
            .iter()
            .find(|e| e.key() != name && e.value().port() == port && e.value().is_running())
            .map(|e| e.key().clone())
    }

    fn snapshot(&self) -> BTreeMap<String, AppMetadata> {
        self.apps
            .iter()
            .map(|e| (e.key().clone(), e.value().meta()))
            .collect()
    }

    /// Write every record's metadata to disk via a temp file and rename.
    pub async fn persist(&self) -> Result<(), SupervisorError> {
        let _guard = self.persist_lock.lock().await;

        let snapshot = self.snapshot();
        let content = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = tmp_path_for(&self.path);
        tokio::fs::write(&tmp_path, &content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!(path = %self.path.display(), apps = snapshot.len(), "Persisted registry");
        Ok(())
    }

    /// Persist, logging instead of failing; the in-memory state stays authoritative.
    pub async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist registry");
        }
    }

    /// Read the snapshot from disk.
    ///
    /// A missing file is an empty registry. A corrupt file is also treated as
    /// empty, with a warning, so a bad snapshot never blocks startup.
    pub async fn load_snapshot(&self) -> Vec<AppMetadata> {
        match read_snapshot(&self.path).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Ignoring registry snapshot");
                Vec::new()
            }
        }
    }

    /// Names recorded in the on-disk snapshot
    pub async fn persisted_names(&self) -> Result<Vec<String>, SupervisorError> {
        Ok(read_snapshot(&self.path)
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn read_snapshot(path: &Path) -> Result<Vec<AppMetadata>, SupervisorError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No registry snapshot, starting empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let records: BTreeMap<String, AppMetadata> =
        serde_json::from_str(&content).map_err(|e| SupervisorError::PersistenceCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    Ok(records
        .into_iter()
        .map(|(key, mut meta)| {
            meta.name = key;
            meta
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, port: u16) -> AppMetadata {
        AppMetadata {
            name: name.to_string(),
            port,
            path: PathBuf::from(format!("/srv/{name}")),
            template: "node".to_string(),
            start_command: "npm start".to_string(),
            running: true,
            pid: Some(4242),
            started_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_upsert_replaces_metadata_in_place() {
        let registry = Registry::new("/nonexistent/registry.json");
        let first = registry.upsert(meta("alpha", 3100));
        first.set_folder_missing(true);

        let second = registry.upsert(meta("alpha", 3101));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.port(), 3101);
        assert!(second.folder_missing());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_all_is_sorted() {
        let registry = Registry::new("/nonexistent/registry.json");
        registry.upsert(meta("gamma", 3102));
        registry.upsert(meta("alpha", 3100));
        registry.upsert(meta("beta", 3101));
        let names: Vec<_> = registry.all().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_ports_excluding_and_running_holder() {
        let registry = Registry::new("/nonexistent/registry.json");
        registry.upsert(meta("alpha", 3100));
        let beta = registry.upsert(meta("beta", 3101));

        assert_eq!(registry.ports_excluding("alpha"), HashSet::from([3101]));
        assert_eq!(registry.running_holder(3101, "alpha"), Some("beta".to_string()));
        assert_eq!(registry.running_holder(3101, "beta"), None);

        beta.update_meta(|m| m.running = false);
        assert_eq!(registry.running_holder(3101, "alpha"), None);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.json");

        let registry = Registry::new(&path);
        let original = meta("alpha", 3100);
        let entry = registry.upsert(original.clone());
        entry.set_logs(crate::logs::LogBuffer::shared(10));
        registry.persist().await.unwrap();

        assert!(!tmp_path_for(&path).exists());

        let restored = Registry::new(&path).load_snapshot().await;
        assert_eq!(restored, vec![original]);
    }

    #[tokio::test]
    async fn test_snapshot_has_no_live_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = Registry::new(&path);
        let entry = registry.upsert(meta("alpha", 3100));
        entry.set_logs(crate::logs::LogBuffer::shared(10));
        entry.set_folder_missing(true);
        registry.persist().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let record = value["alpha"].as_object().unwrap();

        assert_eq!(record["startCommand"], "npm start");
        assert_eq!(record["port"], 3100);
        for live in ["child", "logs", "logBuffer", "processHandle", "folderMissing"] {
            assert!(!record.contains_key(live), "{live} leaked into snapshot");
        }
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        assert!(registry.load_snapshot().await.is_empty());
        assert!(registry.persisted_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{ not json").unwrap();

        let registry = Registry::new(&path);
        assert!(registry.load_snapshot().await.is_empty());
        assert!(matches!(
            registry.persisted_names().await,
            Err(SupervisorError::PersistenceCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_accepts_legacy_start_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{"alpha":{"name":"alpha","port":3100,"template":"node","path":"/srv/alpha","start":"node index.js","running":true,"startedAt":"2024-05-01T12:00:00Z"}}"#,
        )
        .unwrap();

        let records = Registry::new(&path).load_snapshot().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].start_command, "node index.js");
        assert!(records[0].started_at.is_some());
    }

    #[tokio::test]
    async fn test_op_lock_serializes_same_name() {
        let registry = Arc::new(Registry::new("/nonexistent/registry.json"));
        let guard = registry.lock_app("alpha").await;

        let r = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _g = r.lock_app("alpha").await;
        });

        // Other names are independent
        let _beta = registry.lock_app("beta").await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
