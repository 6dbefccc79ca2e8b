//! Deferred and age-based workspace removal.
//!
//! Removal can fail transiently (a file still held open by a process that is going away, a
//! platform lock). Such paths are parked in a pending set and retried by a periodic sweep
//! instead of failing the caller.

use std::{
    collections::HashSet,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::{sync::Mutex, task::JoinHandle};

use crate::{logs, process_manager, workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    /// Could not be removed now; queued for the next sweep.
    Deferred,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub deferred: Vec<PathBuf>,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.removed.extend(other.removed);
        self.deferred.extend(other.deferred);
    }
}

/// Workspaces that belong to a live (starting/running/stopping) session. The sweeps never
/// touch these.
pub trait LiveWorkspaces: Send + Sync + 'static {
    fn live_workspaces(&self) -> impl Future<Output = HashSet<PathBuf>> + Send;
}

/// A fixed snapshot.
impl LiveWorkspaces for HashSet<PathBuf> {
    async fn live_workspaces(&self) -> HashSet<PathBuf> {
        self.clone()
    }
}

/// Where the age-based sweep looks and how old things must be.
#[derive(Debug, Clone)]
pub struct StaleSweep {
    pub workspaces_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub max_age: Duration,
    pub legacy_max_age: Duration,
    pub log_max_files: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupScheduler {
    // Held across every removal, so `cancel` waits out one that is in flight.
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Background sweep handle; the task is aborted when this is dropped.
#[derive(Debug)]
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn try_remove(path: &Path) -> Result<bool, std::io::Error> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl CleanupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn defer(&self, path: PathBuf) {
        self.pending.lock().await.insert(path);
    }

    pub async fn pending(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.pending.lock().await.iter().cloned().collect();
        out.sort();
        out
    }

    pub async fn is_pending(&self, path: &Path) -> bool {
        self.pending.lock().await.contains(path)
    }

    /// Claims a path for a session that is about to use it again: drops it from the pending
    /// set, waiting for a removal of it that is already under way. Call before recreating
    /// the directory.
    pub async fn cancel(&self, path: &Path) -> bool {
        self.pending.lock().await.remove(path)
    }

    /// One removal attempt; on failure the path is queued instead of reported.
    pub async fn remove_now_or_defer(&self, path: &Path) -> RemovalOutcome {
        let mut pending = self.pending.lock().await;
        remove_or_park(&mut pending, path).await
    }

    /// Retries every pending path that is neither claimed nor live. Liveness is asked
    /// again for each path, under the same lock `cancel` takes.
    pub async fn sweep_pending<L: LiveWorkspaces>(&self, live: &L) -> SweepReport {
        let snapshot = self.pending().await;
        let mut report = SweepReport::default();

        for path in snapshot {
            let mut pending = self.pending.lock().await;
            if !pending.contains(&path) {
                continue;
            }
            if live.live_workspaces().await.contains(&path) {
                report.deferred.push(path);
                continue;
            }
            match try_remove(&path).await {
                Ok(_) => {
                    pending.remove(&path);
                    report.removed.push(path);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "pending removal still failing");
                    report.deferred.push(path);
                }
            }
        }

        report
    }

    /// Removes orphaned workspaces older than the configured ages, plus their run records
    /// and console logs. Directories that match neither naming scheme are left alone.
    pub async fn sweep_stale<L: LiveWorkspaces>(
        &self,
        cfg: &StaleSweep,
        live: &L,
        now: SystemTime,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let Ok(mut rd) = tokio::fs::read_dir(&cfg.workspaces_dir).await else {
            return report;
        };

        while let Ok(Some(entry)) = rd.next_entry().await {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let max_age = if workspace::is_workspace_name(&name) {
                cfg.max_age
            } else if workspace::is_legacy_name(&name) {
                cfg.legacy_max_age
            } else {
                continue;
            };
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }

            let Some(touched) = last_touched(cfg, &name, &path).await else {
                continue;
            };
            let age = now.duration_since(touched).unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }

            let mut pending = self.pending.lock().await;
            if live.live_workspaces().await.contains(&path) {
                continue;
            }
            tracing::info!(
                workspace = %name,
                age_secs = age.as_secs(),
                "removing stale workspace"
            );
            match remove_or_park(&mut pending, &path).await {
                RemovalOutcome::Removed | RemovalOutcome::Missing => report.removed.push(path),
                RemovalOutcome::Deferred => report.deferred.push(path),
            }
            drop(pending);
            remove_artifacts(cfg, &name).await;
        }

        report
    }

    /// Periodic sweep: the pending set every `interval`, the stale sweep every
    /// `stale_every`.
    pub fn spawn<L: LiveWorkspaces>(
        &self,
        source: L,
        interval: Duration,
        stale: Option<(StaleSweep, Duration)>,
    ) -> CleanupTask {
        let scheduler = self.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick; startup runs its own sweep.
            ticker.tick().await;
            let mut last_stale = tokio::time::Instant::now();

            loop {
                ticker.tick().await;
                let mut report = scheduler.sweep_pending(&source).await;

                if let Some((cfg, every)) = &stale
                    && last_stale.elapsed() >= *every
                {
                    last_stale = tokio::time::Instant::now();
                    report.merge(scheduler.sweep_stale(cfg, &source, SystemTime::now()).await);
                }

                if !report.removed.is_empty() {
                    tracing::info!(
                        removed = report.removed.len(),
                        deferred = report.deferred.len(),
                        "cleanup sweep"
                    );
                }
            }
        });

        CleanupTask { handle }
    }
}

async fn remove_or_park(pending: &mut HashSet<PathBuf>, path: &Path) -> RemovalOutcome {
    match try_remove(path).await {
        Ok(true) => {
            pending.remove(path);
            RemovalOutcome::Removed
        }
        Ok(false) => {
            pending.remove(path);
            RemovalOutcome::Missing
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "workspace removal failed; deferring"
            );
            pending.insert(path.to_path_buf());
            RemovalOutcome::Deferred
        }
    }
}

async fn mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

// Newest of the directory itself, its run record and its console log.
async fn last_touched(cfg: &StaleSweep, name: &str, dir: &Path) -> Option<SystemTime> {
    let mut newest = mtime(dir).await?;
    let record = process_manager::run_record_path(&cfg.runs_dir, name);
    let log = cfg.logs_dir.join(format!("{name}.log"));
    for p in [record, log] {
        if let Some(t) = mtime(&p).await
            && t > newest
        {
            newest = t;
        }
    }
    Some(newest)
}

pub(crate) async fn remove_artifacts(cfg: &StaleSweep, name: &str) {
    let _ = tokio::fs::remove_file(process_manager::run_record_path(&cfg.runs_dir, name)).await;
    for f in logs::console_log_files(&cfg.logs_dir, name, cfg.log_max_files) {
        let _ = tokio::fs::remove_file(f).await;
    }
}
