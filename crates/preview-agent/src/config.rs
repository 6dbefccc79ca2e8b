use std::{ops::RangeInclusive, path::PathBuf, time::Duration};

use crate::host_url::{DEFAULT_HOST_PREFIX, HostConfig};

const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 5173..=5273;
const DEFAULT_PACKAGE_MANAGER: &str = "npm";
const DEFAULT_GRACE_MS: u64 = 3000;
const DEFAULT_TERM_TIMEOUT_MS: u64 = 5000;
const DEFAULT_CLEANUP_INTERVAL_SEC: u64 = 30;
const DEFAULT_STALE_WORKSPACE_DAYS: u64 = 7;
const DEFAULT_LEGACY_WORKSPACE_SEC: u64 = 60 * 60;
const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

const WORKSPACES_DIR: &str = "workspaces";
const RUNS_DIR: &str = "runs";
const LOGS_DIR: &str = "logs";

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub host: HostConfig,
    pub port_range: RangeInclusive<u16>,
    /// Executable used for both `install` and the run step (`npm`, `pnpm`, ...).
    pub package_manager: String,
    /// Wait after spawn before declaring the dev server started.
    pub grace_period: Duration,
    /// Graceful-signal window before force-kill, and the bound on waiting after it.
    pub terminate_timeout: Duration,
    /// Opt-in TCP readiness probe run after the grace period.
    pub ready_probe_timeout: Option<Duration>,
    pub cleanup_interval: Duration,
    pub stale_workspace_age: Duration,
    pub legacy_workspace_age: Duration,
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::with_data_root(resolve_data_root(None))
    }
}

impl AgentConfig {
    /// Defaults rooted at `data_root`.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            host: HostConfig::default(),
            port_range: DEFAULT_PORT_RANGE,
            package_manager: DEFAULT_PACKAGE_MANAGER.to_string(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_MS),
            terminate_timeout: Duration::from_millis(DEFAULT_TERM_TIMEOUT_MS),
            ready_probe_timeout: None,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SEC),
            stale_workspace_age: Duration::from_secs(DEFAULT_STALE_WORKSPACE_DAYS * 24 * 60 * 60),
            legacy_workspace_age: Duration::from_secs(DEFAULT_LEGACY_WORKSPACE_SEC),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::with_data_root(resolve_data_root(env_string("PREVIEW_DATA_ROOT")));

        cfg.host = HostConfig {
            prefix: env_string("PREVIEW_HOST_PREFIX")
                .unwrap_or_else(|| DEFAULT_HOST_PREFIX.to_string()),
            tunnel_domain: env_string("PREVIEW_TUNNEL_DOMAIN"),
        };

        if let Some(raw) = env_string("PREVIEW_PORT_RANGE") {
            match parse_port_range(&raw) {
                Some(range) => cfg.port_range = range,
                None => tracing::warn!(
                    value = %raw,
                    "ignoring malformed PREVIEW_PORT_RANGE (expected start-end)"
                ),
            }
        }

        if let Some(pm) = env_string("PREVIEW_PACKAGE_MANAGER") {
            cfg.package_manager = pm;
        }

        cfg.grace_period = Duration::from_millis(
            env_u64("PREVIEW_GRACE_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_GRACE_MS),
        );
        cfg.terminate_timeout = Duration::from_millis(
            env_u64("PREVIEW_TERM_TIMEOUT_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_TERM_TIMEOUT_MS),
        );
        cfg.ready_probe_timeout = env_u64("PREVIEW_READY_PROBE_MS")
            .filter(|v| *v > 0)
            .map(|v| Duration::from_millis(v.clamp(500, 10 * 60 * 1000)));
        cfg.cleanup_interval = Duration::from_secs(
            env_u64("PREVIEW_CLEANUP_INTERVAL_SEC")
                .map(|v| v.clamp(1, 3600))
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SEC),
        );
        cfg.stale_workspace_age = Duration::from_secs(
            env_u64("PREVIEW_STALE_WORKSPACE_DAYS")
                .map(|v| v.clamp(1, 365))
                .unwrap_or(DEFAULT_STALE_WORKSPACE_DAYS)
                * 24
                * 60
                * 60,
        );
        cfg.legacy_workspace_age = Duration::from_secs(
            env_u64("PREVIEW_LEGACY_WORKSPACE_SEC")
                .map(|v| v.clamp(60, 30 * 24 * 60 * 60))
                .unwrap_or(DEFAULT_LEGACY_WORKSPACE_SEC),
        );
        cfg.log_max_lines = env_usize("PREVIEW_LOG_MAX_LINES")
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(DEFAULT_LOG_MAX_LINES);
        cfg.log_file_max_bytes = env_u64("PREVIEW_LOG_FILE_MAX_BYTES")
            .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
        cfg.log_file_max_files = env_usize("PREVIEW_LOG_FILE_MAX_FILES")
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);

        cfg
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_root.join(WORKSPACES_DIR)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_root.join(RUNS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join(LOGS_DIR)
    }
}

/// Parses `start-end` (inclusive). Inverted or empty ranges are rejected.
pub fn parse_port_range(raw: &str) -> Option<RangeInclusive<u16>> {
    let (a, b) = raw.trim().split_once('-')?;
    let start = a.trim().parse::<u16>().ok()?;
    let end = b.trim().parse::<u16>().ok()?;
    if start == 0 || start > end {
        return None;
    }
    Some(start..=end)
}

pub fn resolve_data_root(raw: Option<String>) -> PathBuf {
    let p = match raw {
        Some(v) => PathBuf::from(v),
        None => std::env::temp_dir().join("preview-agent"),
    };
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses_inclusive_bounds() {
        assert_eq!(parse_port_range("5173-5180"), Some(5173..=5180));
        assert_eq!(parse_port_range(" 4000 - 4000 "), Some(4000..=4000));
    }

    #[test]
    fn port_range_rejects_garbage() {
        assert_eq!(parse_port_range("5180-5173"), None);
        assert_eq!(parse_port_range("0-10"), None);
        assert_eq!(parse_port_range("5173"), None);
        assert_eq!(parse_port_range("a-b"), None);
        assert_eq!(parse_port_range("5173-70000"), None);
    }

    #[test]
    fn relative_data_root_is_made_absolute() {
        let p = resolve_data_root(Some("previews".to_string()));
        assert!(p.is_absolute());
        assert!(p.ends_with("previews"));
    }

    #[test]
    fn default_data_root_lives_under_temp() {
        let p = resolve_data_root(None);
        assert!(p.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn layout_dirs_hang_off_data_root() {
        let cfg = AgentConfig::with_data_root("/srv/preview");
        assert_eq!(cfg.workspaces_dir(), PathBuf::from("/srv/preview/workspaces"));
        assert_eq!(cfg.runs_dir(), PathBuf::from("/srv/preview/runs"));
        assert_eq!(cfg.logs_dir(), PathBuf::from("/srv/preview/logs"));
        assert_eq!(cfg.port_range, 5173..=5273);
    }
}
