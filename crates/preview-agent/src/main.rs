use std::path::{Path, PathBuf};

use anyhow::Context;
use preview_agent::{AgentConfig, Orchestrator, api};
use preview_process::FileEntry;
use tracing_subscriber::{EnvFilter, fmt::writer::MakeWriterExt as _};

const SKIP_DIRS: &[&str] = &["node_modules", ".git"];
const USAGE: &str = "usage: preview-agent [<session-id> <project-dir>]";

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = std::env::var("PREVIEW_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "preview-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(std::io::stderr.and(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Reads a project directory into a file tree. Dependency and VCS directories are skipped;
/// non-UTF-8 files are skipped with a warning.
fn read_project(root: &Path) -> anyhow::Result<Vec<FileEntry>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> anyhow::Result<()> {
        let rd = std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in rd {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            let name = entry.file_name();

            if file_type.is_dir() {
                if SKIP_DIRS.iter().any(|s| name == *s) {
                    continue;
                }
                walk(root, &path, out)?;
            } else if file_type.is_file() {
                let rel = path.strip_prefix(root).unwrap_or(&path);
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                match std::fs::read_to_string(&path) {
                    Ok(content) => out.push(FileEntry::new(rel, content)),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping file"),
                }
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

async fn run_session(orch: &Orchestrator, session_id: &str, dir: PathBuf) -> anyhow::Result<()> {
    let files = tokio::task::spawn_blocking(move || read_project(&dir))
        .await
        .context("read project task")??;
    tracing::info!(session_id, files = files.len(), "starting preview");

    let res = orch.start(session_id, files).await;
    println!("{}", serde_json::to_string_pretty(&api::start_response(&res))?);
    let info = res?;
    tracing::info!(session_id, url = %info.url, "preview running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    let res = orch.stop(session_id).await;
    println!("{}", serde_json::to_string_pretty(&api::ack_response(&res))?);
    res?;
    Ok(())
}

async fn run_cleanup(orch: &Orchestrator) -> anyhow::Result<()> {
    let report = orch.startup_sweep().await;
    for p in &report.deferred {
        tracing::warn!(path = %p.display(), "workspace removal deferred");
    }

    let _task = orch.spawn_cleanup();
    tracing::info!(
        root = %orch.config().data_root.display(),
        interval_secs = orch.config().cleanup_interval.as_secs(),
        "cleanup running; Ctrl-C to exit"
    );
    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    orch.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = AgentConfig::from_env();
    tracing::info!(
        data_root = %config.data_root.display(),
        ports = ?config.port_range,
        package_manager = %config.package_manager,
        "preview-agent starting"
    );
    let orch = Orchestrator::new(config).await?;

    match args.as_slice() {
        [] => run_cleanup(&orch).await,
        [session_id, dir] => run_session(&orch, session_id, PathBuf::from(dir)).await,
        _ => anyhow::bail!(USAGE),
    }
}
