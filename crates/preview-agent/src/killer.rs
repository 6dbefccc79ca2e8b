//! Whole-tree termination of a spawned dev server.
//!
//! Package managers fork the real server binary, so signalling only the direct child leaks
//! the process that actually holds the port. Unix children run in their own process group
//! (`setsid` at spawn) and the group is signalled; Windows uses `taskkill /T`.

use std::{fmt::Debug, sync::Arc, time::Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHandle {
    pub pid: u32,
    /// Process group id on unix (equal to `pid` after `setsid`).
    pub pgid: Option<i32>,
}

impl TreeHandle {
    pub fn for_child(pid: u32) -> Self {
        Self {
            pid,
            pgid: if cfg!(unix) { Some(pid as i32) } else { None },
        }
    }
}

/// Platform signalling primitives. Implementations must be cheap and non-blocking enough
/// to call from a polling loop.
pub trait ProcessTreeKiller: Send + Sync + Debug {
    fn signal_graceful(&self, tree: TreeHandle);
    fn force_kill(&self, tree: TreeHandle);
    fn tree_alive(&self, tree: TreeHandle) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Gone after the graceful signal.
    Graceful,
    /// Needed the force-kill.
    Forced,
    /// Still present after both bounded waits.
    Lingering,
}

async fn wait_gone(killer: &dyn ProcessTreeKiller, tree: TreeHandle, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !killer.tree_alive(tree) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Graceful signal, bounded wait, force-kill, bounded wait. Returns only once the tree is
/// gone or both waits have elapsed.
pub async fn terminate_tree(
    killer: &dyn ProcessTreeKiller,
    tree: TreeHandle,
    timeout: Duration,
) -> TerminateOutcome {
    if !killer.tree_alive(tree) {
        return TerminateOutcome::Graceful;
    }

    killer.signal_graceful(tree);
    if wait_gone(killer, tree, timeout).await {
        return TerminateOutcome::Graceful;
    }

    tracing::warn!(pid = tree.pid, "process tree ignored graceful signal; force-killing");
    killer.force_kill(tree);
    if wait_gone(killer, tree, timeout).await {
        TerminateOutcome::Forced
    } else {
        tracing::warn!(pid = tree.pid, "process tree still present after force-kill");
        TerminateOutcome::Lingering
    }
}

pub fn platform_killer() -> Arc<dyn ProcessTreeKiller> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupKiller)
    }
    #[cfg(windows)]
    {
        Arc::new(TaskkillTreeKiller)
    }
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGroupKiller;

#[cfg(unix)]
impl ProcessGroupKiller {
    fn send(tree: TreeHandle, sig: libc::c_int) {
        unsafe {
            match tree.pgid {
                Some(pgid) if pgid > 0 => {
                    libc::kill(-pgid, sig);
                }
                _ => {
                    libc::kill(tree.pid as i32, sig);
                }
            }
        }
    }
}

#[cfg(unix)]
impl ProcessTreeKiller for ProcessGroupKiller {
    fn signal_graceful(&self, tree: TreeHandle) {
        Self::send(tree, libc::SIGTERM);
    }

    fn force_kill(&self, tree: TreeHandle) {
        Self::send(tree, libc::SIGKILL);
    }

    fn tree_alive(&self, tree: TreeHandle) -> bool {
        match tree.pgid {
            Some(pgid) if pgid > 0 => group_alive(pgid),
            _ => pid_alive(tree.pid),
        }
    }
}

#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    if let Some(state) = proc_stat_fields(pid).map(|f| f.0) {
        return state != 'Z';
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// `(state, pgrp)` from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn proc_stat_fields(pid: u32) -> Option<(char, i32)> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'.
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut it = rest.split_whitespace();
    let state = it.next()?.chars().next()?;
    let _ppid = it.next()?;
    let pgrp = it.next()?.parse::<i32>().ok()?;
    Some((state, pgrp))
}

// Zombies still count for kill(-pgid, 0) until reaped, so scan /proc where available.
#[cfg(target_os = "linux")]
fn group_alive(pgid: i32) -> bool {
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return unsafe { libc::kill(-pgid, 0) == 0 };
    };
    rd.flatten().any(|e| {
        e.file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
            .and_then(proc_stat_fields)
            .is_some_and(|(state, pgrp)| pgrp == pgid && state != 'Z')
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn group_alive(pgid: i32) -> bool {
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskkillTreeKiller;

#[cfg(windows)]
impl TaskkillTreeKiller {
    fn taskkill(pid: u32, force: bool) {
        let pid = pid.to_string();
        let mut args = vec!["/PID", pid.as_str(), "/T"];
        if force {
            args.push("/F");
        }
        let _ = std::process::Command::new("taskkill")
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
}

#[cfg(windows)]
impl ProcessTreeKiller for TaskkillTreeKiller {
    fn signal_graceful(&self, tree: TreeHandle) {
        Self::taskkill(tree.pid, false);
    }

    fn force_kill(&self, tree: TreeHandle) {
        Self::taskkill(tree.pid, true);
    }

    // Only the root pid is observable without a job object; `/T` takes the rest with it.
    fn tree_alive(&self, tree: TreeHandle) -> bool {
        let filter = format!("PID eq {}", tree.pid);
        std::process::Command::new("tasklist")
            .args(["/FI", &filter, "/NH", "/FO", "CSV"])
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&format!("\"{}\"", tree.pid)))
            .unwrap_or(false)
    }
}
