// crates/server/src/temp.rs
//! Per-job scratch directories.
//!
//! Registered as the hub's cleanup hook, so a job that closes with an error
//! or a heartbeat timeout loses its directory before any listener hears
//! about the close. Completed jobs keep their output until the periodic
//! sweep finds it older than the retention window.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use charart_core::config::MIN_INTERVAL;
use charart_types::JobId;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct TempDirRegistry {
    root: PathBuf,
    dirs: DashMap<JobId, PathBuf>,
}

impl TempDirRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirs: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or reuse) the directory for `job_id`.
    pub fn create(&self, job_id: &str) -> io::Result<PathBuf> {
        if let Some(existing) = self.dirs.get(job_id) {
            return Ok(existing.clone());
        }
        let dir = self.root.join(dir_name(job_id));
        std::fs::create_dir_all(&dir)?;
        self.dirs.insert(job_id.to_string(), dir.clone());
        debug!(job_id, dir = %dir.display(), "temp dir created");
        Ok(dir)
    }

    pub fn path(&self, job_id: &str) -> Option<PathBuf> {
        self.dirs.get(job_id).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Forget `job_id` and delete its directory. Returns whether one was
    /// registered.
    pub fn remove(&self, job_id: &str) -> bool {
        let Some((_, dir)) = self.dirs.remove(job_id) else {
            return false;
        };
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(job_id, dir = %dir.display(), "temp dir removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id, dir = %dir.display(), error = %e, "failed to remove temp dir"),
        }
        true
    }
}

impl TempDirRegistry {
    /// Delete every entry under the root untouched for at least `retention`,
    /// skipping directories whose job `is_active` reports as still running.
    /// Returns how many entries were removed.
    pub fn sweep(&self, retention: Duration, is_active: impl Fn(&str) -> bool) -> io::Result<usize> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let owners: HashMap<PathBuf, JobId> = self
            .dirs
            .iter()
            .map(|entry| (entry.value().clone(), entry.key().clone()))
            .collect();
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable temp entry");
                    continue;
                }
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < retention {
                continue;
            }
            let owner = owners.get(&path);
            if owner.is_some_and(|job_id| is_active(job_id.as_str())) {
                continue;
            }

            let result = if meta.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    removed += 1;
                    if let Some(job_id) = owner {
                        self.dirs.remove(job_id);
                    }
                    debug!(path = %path.display(), age_secs = age.as_secs(), "expired temp entry removed");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove expired temp entry"),
            }
        }
        Ok(removed)
    }

    /// Sweep once now and then every `every`. The filesystem work runs on
    /// the blocking pool.
    pub fn spawn_sweeper<A>(self: Arc<Self>, retention: Duration, every: Duration, is_active: A) -> JoinHandle<()>
    where
        A: Fn(&str) -> bool + Clone + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let registry = Arc::clone(&self);
                let is_active = is_active.clone();
                match tokio::task::spawn_blocking(move || registry.sweep(retention, is_active)).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => info!(removed, root = %self.root.display(), "temp sweep finished"),
                    Ok(Err(e)) => warn!(root = %self.root.display(), error = %e, "temp sweep failed"),
                    Err(e) => warn!(error = %e, "temp sweep task failed"),
                }
            }
        })
    }
}

/// Job ids come from clients; keep them from escaping the root.
///
/// The mapping is one-to-one: ASCII letters, digits and `-` pass through,
/// `_` becomes `__`, and every other byte becomes `_` plus two lowercase
/// hex digits. The empty id maps to a lone `_`, which no other id produces.
fn dir_name(job_id: &str) -> String {
    if job_id.is_empty() {
        return "_".to_string();
    }
    let mut name = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        match byte {
            b'_' => name.push_str("__"),
            b if b.is_ascii_alphanumeric() || b == b'-' => name.push(char::from(b)),
            b => name.push_str(&format!("_{b:02x}")),
        }
    }
    name
}
