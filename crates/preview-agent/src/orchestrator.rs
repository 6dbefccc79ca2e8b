//! Session registry: the entry point callers use to start, stop, inspect, update and delete
//! preview sessions.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use preview_process::{FileEntry, RunId, SessionState, SessionStatus};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::{
    cleanup::{CleanupScheduler, CleanupTask, LiveWorkspaces, RemovalOutcome, StaleSweep, SweepReport},
    config::AgentConfig,
    error::SessionError,
    host_url,
    killer::{self, ProcessTreeKiller, TerminateOutcome, TreeHandle},
    launch,
    logs::{LogBuffer, LogSink},
    port_alloc::PortAllocator,
    process_manager::{self, ExitInfo, RunRecord},
    workspace::{self, WorkspaceStore, WriteSummary},
};

const STALE_SWEEP_EVERY: Duration = Duration::from_secs(60 * 60);

type ExitRx = watch::Receiver<Option<ExitInfo>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInfo {
    pub url: String,
    pub port: u16,
    pub run_id: RunId,
    /// Dependencies were installed during this call.
    pub first_time: bool,
    /// The session was already running; files were synced, nothing was spawned.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePreview {
    pub path: PathBuf,
    pub exists: bool,
    pub running: bool,
    pub size_bytes: u64,
}

#[derive(Debug)]
struct SessionEntry {
    run_id: RunId,
    state: SessionState,
    port: u16,
    workspace: PathBuf,
    tree: Option<TreeHandle>,
    exit_rx: Option<ExitRx>,
    started_at_unix_ms: Option<u64>,
}

impl SessionEntry {
    fn exit(&self) -> Option<ExitInfo> {
        self.exit_rx.as_ref().and_then(|rx| *rx.borrow())
    }

    fn is_running(&self) -> bool {
        self.state == SessionState::Running && self.exit().is_none()
    }

    // Running on paper, but the process is gone and the monitor has not pruned it yet.
    fn is_dead(&self) -> bool {
        self.state == SessionState::Running && self.exit().is_some()
    }

    // Seen by a holder of the session lock, a STARTING entry has lost its launch task.
    fn needs_stop(&self) -> bool {
        self.is_running() || self.state == SessionState::Starting
    }

    fn owned_by(&self, run_id: &RunId) -> bool {
        &self.run_id == run_id && self.state == SessionState::Starting
    }
}

#[derive(Debug)]
struct Registry {
    sessions: HashMap<String, SessionEntry>,
    ports: PortAllocator,
}

impl Registry {
    fn prune_dead(&mut self, session_id: &str) {
        if self.sessions.get(session_id).is_some_and(SessionEntry::is_dead) {
            self.sessions.remove(session_id);
        }
    }

    /// Ports of every live entry except `session_id`'s own. Starting entries count.
    fn held_by_others(&self, session_id: &str) -> HashSet<u16> {
        self.sessions
            .iter()
            .filter(|(id, e)| id.as_str() != session_id && !e.is_dead())
            .map(|(_, e)| e.port)
            .collect()
    }

    fn remove_run(&mut self, session_id: &str, run_id: &RunId) -> Option<SessionEntry> {
        if self
            .sessions
            .get(session_id)
            .is_some_and(|e| &e.run_id == run_id)
        {
            return self.sessions.remove(session_id);
        }
        None
    }
}

#[derive(Debug)]
struct Inner {
    config: AgentConfig,
    store: WorkspaceStore,
    registry: Mutex<Registry>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // One sink, and so one console-log writer, per session until it is deleted.
    logs: Mutex<HashMap<String, LogSink>>,
    cleanup: CleanupScheduler,
    killer: Arc<dyn ProcessTreeKiller>,
}

/// Cloneable handle; clones share the same sessions.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub async fn new(config: AgentConfig) -> anyhow::Result<Self> {
        Self::with_killer(config, killer::platform_killer()).await
    }

    pub async fn with_killer(
        config: AgentConfig,
        killer: Arc<dyn ProcessTreeKiller>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        for dir in [config.workspaces_dir(), config.runs_dir(), config.logs_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }

        let mut ports = PortAllocator::new(config.port_range.clone());
        let records = process_manager::load_run_records(&config.runs_dir()).await;
        for r in &records {
            ports.remember(&r.session_id, r.port);
        }
        if !records.is_empty() {
            tracing::info!(sessions = records.len(), "restored sticky ports from run records");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                store: WorkspaceStore::new(config.workspaces_dir()),
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    ports,
                }),
                session_locks: Mutex::new(HashMap::new()),
                logs: Mutex::new(HashMap::new()),
                cleanup: CleanupScheduler::new(),
                killer,
                config,
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.inner.cleanup
    }

    pub fn workspace_path(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        self.inner.store.path_for(session_id)
    }

    async fn session_lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.session_locks.lock().await;
            // Only the map holds an idle lock; clones happen under this guard.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn log_sink(&self, session_id: &str, name: &str) -> LogSink {
        let cfg = &self.inner.config;
        let mut logs = self.inner.logs.lock().await;
        logs.entry(session_id.to_string())
            .or_insert_with(|| {
                LogSink::open(
                    session_id,
                    Arc::new(Mutex::new(LogBuffer::new(cfg.log_max_lines))),
                    cfg.logs_dir().join(format!("{name}.log")),
                    cfg.log_file_max_bytes,
                    cfg.log_file_max_files,
                )
            })
            .clone()
    }

    fn stale_sweep(&self) -> StaleSweep {
        let cfg = &self.inner.config;
        StaleSweep {
            workspaces_dir: cfg.workspaces_dir(),
            runs_dir: cfg.runs_dir(),
            logs_dir: cfg.logs_dir(),
            max_age: cfg.stale_workspace_age,
            legacy_max_age: cfg.legacy_workspace_age,
            log_max_files: cfg.log_file_max_files,
        }
    }

    pub async fn start(
        &self,
        session_id: &str,
        files: Vec<FileEntry>,
    ) -> Result<StartInfo, SessionError> {
        self.start_with_env(session_id, files, BTreeMap::new()).await
    }

    /// Starts the session's dev server, or syncs files into it when it is already running.
    ///
    /// Once a port is reserved the launch runs on its own task holding the session lock.
    /// Dropping this future (a caller-side timeout) does not abandon the launch: it still
    /// ends RUNNING or cleaned up, and a later `stop` waits for it.
    pub async fn start_with_env(
        &self,
        session_id: &str,
        files: Vec<FileEntry>,
        env: BTreeMap<String, String>,
    ) -> Result<StartInfo, SessionError> {
        let name = workspace::workspace_name(session_id)?;
        workspace::validate_file_tree(&files)?;
        let guard = self.session_lock(session_id).await;

        let workspace = self.inner.store.path_for(session_id)?;
        let run_id = RunId::new();

        let port = {
            let mut reg = self.inner.registry.lock().await;
            reg.prune_dead(session_id);

            if let Some(e) = reg.sessions.get(session_id)
                && e.is_running()
            {
                let (port, run_id) = (e.port, e.run_id.clone());
                drop(reg);
                self.inner.store.write(&workspace, &files).await?;
                tracing::info!(session_id, port, "session already running; files synced");
                return Ok(StartInfo {
                    url: host_url::resolve(&self.inner.config.host, port),
                    port,
                    run_id,
                    first_time: false,
                    reused: true,
                });
            }

            let held = reg.held_by_others(session_id);
            let port = reg.ports.allocate(session_id, &held)?;
            reg.sessions.insert(
                session_id.to_string(),
                SessionEntry {
                    run_id: run_id.clone(),
                    state: SessionState::Starting,
                    port,
                    workspace: workspace.clone(),
                    tree: None,
                    exit_rx: None,
                    started_at_unix_ms: None,
                },
            );
            port
        };

        let task = {
            let this = self.clone();
            let session_id = session_id.to_string();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let res = this
                    .launch(&session_id, &name, &run_id, port, &files, &env)
                    .await;
                if let Err(e) = &res {
                    this.inner
                        .registry
                        .lock()
                        .await
                        .remove_run(&session_id, &run_id);
                    tracing::warn!(
                        session_id = %session_id,
                        port,
                        error = %e,
                        code = e.code(),
                        "start failed"
                    );
                }
                res
            })
        };

        let first_time = match task.await {
            Ok(res) => res?,
            Err(e) => {
                let orphan = self
                    .inner
                    .registry
                    .lock()
                    .await
                    .remove_run(session_id, &run_id);
                if let Some(entry) = orphan {
                    self.terminate(session_id, entry.tree, entry.exit_rx).await;
                }
                return Err(SessionError::Internal(
                    anyhow::Error::new(e).context("launch task failed"),
                ));
            }
        };

        Ok(StartInfo {
            url: host_url::resolve(&self.inner.config.host, port),
            port,
            run_id,
            first_time,
            reused: false,
        })
    }

    // The session's entry was taken away (shutdown) while this run was starting.
    async fn abandon(&self, session_id: &str, tree: TreeHandle) -> SessionError {
        killer::terminate_tree(
            self.inner.killer.as_ref(),
            tree,
            self.inner.config.terminate_timeout,
        )
        .await;
        SessionError::StartFailed {
            message: format!("session {session_id} was stopped while starting"),
            stderr_excerpt: String::new(),
        }
    }

    // Everything after the port is reserved. The caller removes the STARTING entry on error.
    async fn launch(
        &self,
        session_id: &str,
        name: &str,
        run_id: &RunId,
        port: u16,
        files: &[FileEntry],
        env: &BTreeMap<String, String>,
    ) -> Result<bool, SessionError> {
        let cfg = &self.inner.config;
        let store = &self.inner.store;

        // Claim before recreating, or a sweep in flight could remove the fresh tree.
        self.inner
            .cleanup
            .cancel(&store.path_for(session_id)?)
            .await;
        let (workspace, first_time) = store.ensure(session_id).await?;
        let summary = store.write(&workspace, files).await?;
        tracing::debug!(
            session_id,
            written = summary.written,
            unchanged = summary.unchanged,
            "file tree synced"
        );

        let sink = self.log_sink(session_id, name).await;
        if first_time {
            tracing::info!(session_id, "installing dependencies");
            process_manager::run_install(
                &launch::plan_install(&cfg.package_manager),
                &workspace,
                &sink,
            )
            .await?;
        }

        let plan = launch::plan_run(&workspace, &cfg.package_manager, port, env).await?;
        let mut run = process_manager::spawn_run(&plan, &workspace, &sink).await?;

        let claimed = {
            let mut reg = self.inner.registry.lock().await;
            match reg.sessions.get_mut(session_id) {
                Some(e) if e.owned_by(run_id) => {
                    e.tree = Some(run.tree);
                    true
                }
                _ => false,
            }
        };
        if !claimed {
            return Err(self.abandon(session_id, run.tree).await);
        }

        run.await_grace(cfg.grace_period, self.inner.killer.as_ref(), &sink)
            .await?;

        if let Some(timeout) = cfg.ready_probe_timeout
            && let Err(e) = run.await_ready(port, timeout, &sink).await
        {
            killer::terminate_tree(self.inner.killer.as_ref(), run.tree, cfg.terminate_timeout)
                .await;
            return Err(e);
        }

        let (tree, exit_rx) = run.into_running();
        let started_at = process_manager::now_unix_ms();

        let record = RunRecord {
            session_id: session_id.to_string(),
            run_id: run_id.0.clone(),
            port,
            started_at_unix_ms: started_at,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: Some(tree.pid),
            pgid: tree.pgid,
            command: plan.program.clone(),
            args: plan.args.clone(),
            cwd: workspace.display().to_string(),
        };
        if let Err(e) = process_manager::write_run_record(&cfg.runs_dir(), name, &record).await {
            tracing::warn!(session_id, error = %e, "failed to write run record");
        }

        let claimed = {
            let mut reg = self.inner.registry.lock().await;
            match reg.sessions.get_mut(session_id) {
                Some(e) if e.owned_by(run_id) => {
                    e.state = SessionState::Running;
                    e.tree = Some(tree);
                    e.exit_rx = Some(exit_rx.clone());
                    e.started_at_unix_ms = Some(started_at);
                    true
                }
                _ => false,
            }
        };
        if !claimed {
            return Err(self.abandon(session_id, tree).await);
        }
        self.spawn_exit_monitor(session_id.to_string(), run_id.clone(), exit_rx);

        tracing::info!(session_id, port, pid = tree.pid, first_time, "dev server started");
        Ok(first_time)
    }

    // Prunes the entry when its process dies on its own. Stop removes its own entry.
    fn spawn_exit_monitor(
        &self,
        session_id: String,
        run_id: RunId,
        mut exit_rx: ExitRx,
    ) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let info = exit_rx.wait_for(Option::is_some).await.ok().and_then(|v| *v);
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut reg = inner.registry.lock().await;
            if reg
                .sessions
                .get(&session_id)
                .is_some_and(|e| e.run_id == run_id && e.state == SessionState::Running)
            {
                reg.sessions.remove(&session_id);
                tracing::warn!(
                    session_id = %session_id,
                    exit = %info.map(|i| i.describe()).unwrap_or_default(),
                    "dev server exited unexpectedly"
                );
            }
        });
    }

    /// Terminates the session's process tree. The workspace is kept.
    pub async fn stop(&self, session_id: &str) -> Result<(), SessionError> {
        workspace::workspace_name(session_id)?;
        let _guard = self.session_lock(session_id).await;
        self.stop_locked(session_id).await
    }

    async fn stop_locked(&self, session_id: &str) -> Result<(), SessionError> {
        let (run_id, tree, exit_rx) = {
            let mut reg = self.inner.registry.lock().await;
            reg.prune_dead(session_id);
            match reg.sessions.get_mut(session_id) {
                Some(e) if e.needs_stop() => {
                    e.state = SessionState::Stopping;
                    (e.run_id.clone(), e.tree, e.exit_rx.clone())
                }
                _ => {
                    return Err(SessionError::NotRunning {
                        session_id: session_id.to_string(),
                    });
                }
            }
        };

        self.terminate(session_id, tree, exit_rx).await;
        self.inner
            .registry
            .lock()
            .await
            .remove_run(session_id, &run_id);
        tracing::info!(session_id, "session stopped");
        Ok(())
    }

    async fn terminate(
        &self,
        session_id: &str,
        tree: Option<TreeHandle>,
        exit_rx: Option<ExitRx>,
    ) {
        let timeout = self.inner.config.terminate_timeout;
        if let Some(tree) = tree {
            let outcome = killer::terminate_tree(self.inner.killer.as_ref(), tree, timeout).await;
            if outcome == TerminateOutcome::Lingering {
                tracing::warn!(session_id, pid = tree.pid, "process tree outlived termination");
            }
        }
        // Let the waiter reap the direct child before the entry disappears.
        if let Some(mut rx) = exit_rx {
            let _ = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        }
    }

    /// Never fails; unknown or invalid sessions report `running: false`.
    pub async fn status(&self, session_id: &str) -> SessionStatus {
        let reg = self.inner.registry.lock().await;
        let Some(e) = reg.sessions.get(session_id) else {
            return SessionStatus::absent(session_id);
        };

        let exit = e.exit();
        SessionStatus {
            session_id: session_id.to_string(),
            running: e.is_running(),
            state: Some(if exit.is_some() {
                SessionState::Exited
            } else {
                e.state
            }),
            run_id: Some(e.run_id.clone()),
            port: Some(e.port),
            url: Some(host_url::resolve(&self.inner.config.host, e.port)),
            pid: e.tree.map(|t| t.pid),
            exit_code: exit.and_then(|i| i.code),
            started_at_unix_ms: e.started_at_unix_ms,
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionStatus> {
        let mut ids: Vec<String> = {
            let reg = self.inner.registry.lock().await;
            reg.sessions.keys().cloned().collect()
        };
        ids.sort();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let s = self.status(&id).await;
            if s.state.is_some() {
                out.push(s);
            }
        }
        out
    }

    /// Additive sync into a running session's workspace; the dev server's own watcher
    /// picks the changes up.
    pub async fn update_files(
        &self,
        session_id: &str,
        files: Vec<FileEntry>,
    ) -> Result<WriteSummary, SessionError> {
        workspace::workspace_name(session_id)?;
        workspace::validate_file_tree(&files)?;
        let _guard = self.session_lock(session_id).await;

        let workspace = {
            let mut reg = self.inner.registry.lock().await;
            reg.prune_dead(session_id);
            match reg.sessions.get(session_id) {
                Some(e) if e.is_running() => e.workspace.clone(),
                _ => {
                    return Err(SessionError::NotRunning {
                        session_id: session_id.to_string(),
                    });
                }
            }
        };

        self.inner.store.write(&workspace, &files).await
    }

    /// Stops the session if needed and removes its workspace, sticky port, run record and
    /// logs. A workspace that cannot be removed right now is handed to the cleanup
    /// scheduler and the call still succeeds.
    pub async fn delete(&self, session_id: &str) -> Result<RemovalOutcome, SessionError> {
        let name = workspace::workspace_name(session_id)?;
        let _guard = self.session_lock(session_id).await;
        let path = self.inner.store.path_for(session_id)?;

        let running = {
            let mut reg = self.inner.registry.lock().await;
            reg.prune_dead(session_id);
            reg.sessions.get(session_id).is_some_and(SessionEntry::needs_stop)
        };
        if running {
            self.stop_locked(session_id).await?;
        }

        let exists = tokio::fs::metadata(&path).await.is_ok();
        if !exists && !running {
            return Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            });
        }

        self.inner.registry.lock().await.ports.forget(session_id);
        let outcome = self.inner.cleanup.remove_now_or_defer(&path).await;
        crate::cleanup::remove_artifacts(&self.stale_sweep(), &name).await;
        self.inner.logs.lock().await.remove(session_id);

        tracing::info!(session_id, outcome = ?outcome, "session deleted");
        Ok(outcome)
    }

    /// What `delete` would remove.
    pub async fn delete_preview(&self, session_id: &str) -> Result<DeletePreview, SessionError> {
        let path = self.inner.store.path_for(session_id)?;
        let exists = tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir());
        let running = self.status(session_id).await.running;
        let size_bytes = if exists {
            WorkspaceStore::size_bytes(&path).await
        } else {
            0
        };
        Ok(DeletePreview {
            path,
            exists,
            running,
            size_bytes,
        })
    }

    /// `(lines, next_cursor)`; cursor 0 returns the newest `limit` lines.
    pub async fn tail_logs(
        &self,
        session_id: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<String>, u64), SessionError> {
        let sink = self.inner.logs.lock().await.get(session_id).cloned();
        let Some(sink) = sink else {
            return Err(SessionError::NotFound {
                session_id: session_id.to_string(),
            });
        };
        let out = sink.buffer().lock().await.tail_after(cursor, limit.max(1));
        Ok(out)
    }

    /// Terminates every live session. Workspaces are kept.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, RunId, Option<TreeHandle>, Option<ExitRx>)> = {
            let mut reg = self.inner.registry.lock().await;
            reg.sessions
                .iter_mut()
                .map(|(id, e)| {
                    e.state = SessionState::Stopping;
                    (id.clone(), e.run_id.clone(), e.tree, e.exit_rx.clone())
                })
                .collect()
        };

        for (id, run_id, tree, exit_rx) in entries {
            self.terminate(&id, tree, exit_rx).await;
            self.inner.registry.lock().await.remove_run(&id, &run_id);
        }
        tracing::info!("all sessions stopped");
    }

    /// Pending removals plus the age-based sweep, once. Meant for process start.
    pub async fn startup_sweep(&self) -> SweepReport {
        let mut report = self.inner.cleanup.sweep_pending(self).await;
        let stale = self
            .inner
            .cleanup
            .sweep_stale(&self.stale_sweep(), self, SystemTime::now())
            .await;
        report.merge(stale);
        tracing::info!(
            removed = report.removed.len(),
            deferred = report.deferred.len(),
            "startup sweep finished"
        );
        report
    }

    /// Starts the periodic cleanup task. Dropping the handle stops it.
    pub fn spawn_cleanup(&self) -> CleanupTask {
        self.inner.cleanup.spawn(
            self.clone(),
            self.inner.config.cleanup_interval,
            Some((self.stale_sweep(), STALE_SWEEP_EVERY)),
        )
    }
}

impl LiveWorkspaces for Orchestrator {
    async fn live_workspaces(&self) -> HashSet<PathBuf> {
        let reg = self.inner.registry.lock().await;
        reg.sessions
            .values()
            .filter(|e| !e.is_dead())
            .map(|e| e.workspace.clone())
            .collect()
    }
}
