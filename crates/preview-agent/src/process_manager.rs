//! Spawning the install and run steps, and judging whether a run survived startup.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Child,
    sync::watch,
    task::JoinHandle,
};

use crate::{
    error::SessionError,
    killer::{ProcessTreeKiller, TreeHandle},
    launch::{self, LaunchPlan},
    logs::{LogSink, STDERR_TAG, STDOUT_TAG},
};

const EXCERPT_LINES: usize = 40;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt as _;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(c), _) => format!("exit code {c}"),
            (None, Some(s)) => format!("signal {s}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// A dev server that has been spawned but not yet judged healthy.
#[derive(Debug)]
pub struct SpawnedRun {
    pub tree: TreeHandle,
    /// Becomes `Some` once the direct child has been reaped.
    pub exit_rx: watch::Receiver<Option<ExitInfo>>,
    since_seq: u64,
    readers: Vec<JoinHandle<()>>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children die with the agent instead of holding their port forever.
    // `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn pipe_output(child: &mut Child, sink: &LogSink) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        let sink = sink.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.emit(format!("{STDOUT_TAG}{line}")).await;
            }
        }));
    }
    if let Some(err) = child.stderr.take() {
        let sink = sink.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.emit(format!("{STDERR_TAG}{line}")).await;
            }
        }));
    }
    readers
}

// A forked grandchild can keep the pipes open after the direct child is gone.
async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for r in readers {
        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, r).await;
    }
}

async fn excerpt_since(sink: &LogSink, since: u64) -> String {
    sink.buffer().lock().await.stderr_excerpt(since, EXCERPT_LINES)
}

/// Runs `<pm> install` to completion. Output goes to the session log.
pub async fn run_install(
    plan: &LaunchPlan,
    workspace: &Path,
    sink: &LogSink,
) -> Result<(), SessionError> {
    let since = sink.buffer().lock().await.last_seq();
    sink.emit(format!("[preview-agent] install: {}", plan.display_command()))
        .await;

    let mut cmd = launch::command_for(plan, workspace);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| set_parent_death_signal());
    }

    let mut child = cmd.spawn().map_err(|e| SessionError::InstallFailed {
        exit_code: None,
        stderr_excerpt: format!("failed to spawn {}: {e}", plan.program),
    })?;
    let readers = pipe_output(&mut child, sink);

    let status = child.wait().await.context("wait for dependency install")?;
    drain_readers(readers).await;
    let exit = ExitInfo::from_status(status);

    if status.success() {
        sink.emit("[preview-agent] install finished").await;
        return Ok(());
    }

    sink.emit(format!("[preview-agent] install failed ({})", exit.describe()))
        .await;
    Err(SessionError::InstallFailed {
        exit_code: exit.code,
        stderr_excerpt: excerpt_since(sink, since).await,
    })
}

/// Spawns the run step in its own process group. A waiter task owns the child and reports
/// its exit through `exit_rx`.
pub async fn spawn_run(
    plan: &LaunchPlan,
    workspace: &Path,
    sink: &LogSink,
) -> Result<SpawnedRun, SessionError> {
    let since_seq = sink.buffer().lock().await.last_seq();
    sink.emit(format!(
        "[preview-agent] run: {} (cwd {})",
        plan.display_command(),
        workspace.display()
    ))
    .await;

    let mut cmd = launch::command_for(plan, workspace);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| SessionError::StartFailed {
        message: format!("failed to spawn {}: {e}", plan.program),
        stderr_excerpt: String::new(),
    })?;

    let Some(pid) = child.id() else {
        return Err(SessionError::StartFailed {
            message: "dev server exited before its pid could be read".to_string(),
            stderr_excerpt: String::new(),
        });
    };
    let tree = TreeHandle::for_child(pid);
    let readers = pipe_output(&mut child, sink);

    let (exit_tx, exit_rx) = watch::channel(None);
    let wait_sink = sink.clone();
    tokio::spawn(async move {
        let info = match child.wait().await {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                tracing::warn!(pid, error = %e, "waiting for dev server failed");
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        wait_sink
            .emit(format!("[preview-agent] dev server exited ({})", info.describe()))
            .await;
        exit_tx.send_replace(Some(info));
    });

    Ok(SpawnedRun {
        tree,
        exit_rx,
        since_seq,
        readers,
    })
}

impl SpawnedRun {
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
        let published = rx.wait_for(Option::is_some).await.map(|v| *v);
        // The waiter only drops the sender after publishing.
        published.unwrap_or_else(|_| *rx.borrow())
    }

    /// Waits out the grace period. An exit inside the window is a start failure; whatever
    /// the child left behind in its group is force-killed.
    pub async fn await_grace(
        &mut self,
        grace: Duration,
        killer: &dyn ProcessTreeKiller,
        sink: &LogSink,
    ) -> Result<(), SessionError> {
        let exited = tokio::time::timeout(grace, Self::wait_exit(&mut self.exit_rx)).await;
        let Ok(info) = exited else {
            return Ok(());
        };
        let label = info
            .map(|i| i.describe())
            .unwrap_or_else(|| "unknown exit status".to_string());

        killer.force_kill(self.tree);
        drain_readers(std::mem::take(&mut self.readers)).await;

        Err(SessionError::StartFailed {
            message: format!(
                "dev server exited within {}ms of launch ({label})",
                grace.as_millis()
            ),
            stderr_excerpt: excerpt_since(sink, self.since_seq).await,
        })
    }

    /// Opt-in readiness check: the port must accept a TCP connection before `timeout`.
    pub async fn await_ready(
        &mut self,
        port: u16,
        timeout: Duration,
        sink: &LogSink,
    ) -> Result<(), SessionError> {
        let ready = tokio::select! {
            ok = wait_for_local_tcp_port(port, timeout) => ok,
            _ = Self::wait_exit(&mut self.exit_rx) => false,
        };
        if ready {
            sink.emit(format!(
                "[preview-agent] port {port} is accepting connections"
            ))
            .await;
            return Ok(());
        }

        Err(SessionError::StartFailed {
            message: match self.exit_info() {
                Some(info) => format!("dev server exited before opening port {port} ({})", info.describe()),
                None => format!("port {port} did not open within {}ms", timeout.as_millis()),
            },
            stderr_excerpt: excerpt_since(sink, self.since_seq).await,
        })
    }

    /// Detaches the output readers; they run until the pipes close.
    pub fn into_running(self) -> (TreeHandle, watch::Receiver<Option<ExitInfo>>) {
        (self.tree, self.exit_rx)
    }
}

async fn wait_for_local_tcp_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            drop(s);
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// What was launched for a session, persisted under `runs/` so a restarted agent can
/// recover sticky ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub session_id: String,
    pub run_id: String,
    pub port: u16,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
}

pub fn run_record_path(runs_dir: &Path, workspace_name: &str) -> PathBuf {
    runs_dir.join(format!("{workspace_name}.json"))
}

pub async fn write_run_record(
    runs_dir: &Path,
    workspace_name: &str,
    record: &RunRecord,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(runs_dir)
        .await
        .context("create runs dir")?;
    let path = run_record_path(runs_dir, workspace_name);
    let tmp = runs_dir.join(format!("{workspace_name}.json.tmp"));
    let data = serde_json::to_vec_pretty(record).context("serialize run record")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create run record tmp")?;
    f.write_all(&data).await.context("write run record tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, &path)
        .await
        .context("persist run record")?;
    Ok(())
}

/// All readable run records. Unparseable files are skipped.
pub async fn load_run_records(runs_dir: &Path) -> Vec<RunRecord> {
    let mut out = Vec::new();
    let Ok(mut rd) = tokio::fs::read_dir(runs_dir).await else {
        return out;
    };
    while let Ok(Some(e)) = rd.next_entry().await {
        let path = e.path();
        if path.extension().and_then(|x| x.to_str()) != Some("json") {
            continue;
        }
        let Ok(raw) = tokio::fs::read(&path).await else {
            continue;
        };
        match serde_json::from_slice::<RunRecord>(&raw) {
            Ok(r) => out.push(r),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run record")
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use tokio::sync::Mutex;

    use super::*;
    use crate::logs::LogBuffer;

    fn record(session: &str, port: u16) -> RunRecord {
        RunRecord {
            session_id: session.to_string(),
            run_id: "r1".to_string(),
            port,
            started_at_unix_ms: 1,
            agent_version: "test".to_string(),
            pid: Some(10),
            pgid: Some(10),
            command: "npm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            cwd: "/tmp/x".to_string(),
        }
    }

    #[tokio::test]
    async fn run_records_persist_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runs = dir.path().join("runs");
        write_run_record(&runs, "ws_a", &record("a", 5173))
            .await
            .unwrap();
        write_run_record(&runs, "ws_b", &record("b", 5174))
            .await
            .unwrap();
        tokio::fs::write(runs.join("junk.json"), "{").await.unwrap();

        let mut loaded = load_run_records(&runs).await;
        loaded.sort_by_key(|r| r.port);
        assert_eq!(loaded, vec![record("a", 5173), record("b", 5174)]);
        assert!(!runs.join("ws_a.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_runs_dir_loads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_run_records(&dir.path().join("nope")).await.is_empty());
    }

    #[test]
    fn exit_description() {
        let e = ExitInfo {
            code: Some(3),
            signal: None,
        };
        assert_eq!(e.describe(), "exit code 3");
        let e = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(e.describe(), "signal 9");
    }

    #[cfg(unix)]
    fn sh_plan(script: &str) -> LaunchPlan {
        LaunchPlan {
            kind: launch::ProjectKind::Default,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    #[cfg(unix)]
    fn sink() -> LogSink {
        LogSink::memory_only("t", Arc::new(Mutex::new(LogBuffer::new(100))))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_install_reports_exit_code_and_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = sink();
        let err = run_install(
            &sh_plan("echo resolving; echo 'ERR! 404 left-pad' >&2; exit 7"),
            dir.path(),
            &sink,
        )
        .await
        .unwrap_err();
        match err {
            SessionError::InstallFailed {
                exit_code,
                stderr_excerpt,
            } => {
                assert_eq!(exit_code, Some(7));
                assert_eq!(stderr_excerpt, "ERR! 404 left-pad");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_within_grace_is_start_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = sink();
        let mut run = spawn_run(&sh_plan("echo 'EADDRINUSE' >&2; exit 1"), dir.path(), &sink)
            .await
            .unwrap();
        let killer = crate::killer::platform_killer();
        let err = run
            .await_grace(Duration::from_secs(2), killer.as_ref(), &sink)
            .await
            .unwrap_err();
        match err {
            SessionError::StartFailed { stderr_excerpt, .. } => {
                assert_eq!(stderr_excerpt, "EADDRINUSE");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn survivor_of_grace_is_running_until_killed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = sink();
        let mut run = spawn_run(&sh_plan("exec sleep 30"), dir.path(), &sink)
            .await
            .unwrap();
        let killer = crate::killer::platform_killer();
        run.await_grace(Duration::from_millis(200), killer.as_ref(), &sink)
            .await
            .unwrap();
        assert!(run.exit_info().is_none());

        let (tree, mut exit_rx) = run.into_running();
        crate::killer::terminate_tree(killer.as_ref(), tree, Duration::from_secs(2)).await;
        let info = exit_rx.wait_for(Option::is_some).await.map(|v| *v).unwrap();
        assert!(info.is_some());
    }
}
