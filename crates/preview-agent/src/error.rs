use std::collections::BTreeMap;

/// Failures returned by the orchestrator operations.
///
/// Nothing here is retried automatically. Deferred workspace removal is tracked by the
/// cleanup scheduler and never surfaces as an error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no free port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("dependency install failed ({})", exit_label(.exit_code))]
    InstallFailed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("dev server failed to start: {message}")]
    StartFailed {
        message: String,
        stderr_excerpt: String,
    },

    #[error("session is not running: {session_id}")]
    NotRunning { session_id: String },

    #[error("no workspace for session: {session_id}")]
    NotFound { session_id: String },

    #[error("invalid session id: {reason}")]
    InvalidSessionId { reason: String },

    #[error("invalid file path {path:?}: {reason}")]
    InvalidFileTree { path: String, reason: String },

    #[error("{}", format_error_chain(.0))]
    Internal(#[from] anyhow::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by signal".to_string(),
    }
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::InstallFailed { .. } => "install_failed",
            Self::StartFailed { .. } => "start_failed",
            Self::NotRunning { .. } => "not_running",
            Self::NotFound { .. } => "not_found",
            Self::InvalidSessionId { .. } => "invalid_session_id",
            Self::InvalidFileTree { .. } => "invalid_file_tree",
            Self::Internal(_) => "internal",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ResourceExhausted { .. } => {
                Some("Stop an idle preview or widen PREVIEW_PORT_RANGE, then try again.")
            }
            Self::InstallFailed { .. } => Some(
                "Check package.json dependencies; the workspace is kept so the next start retries the install.",
            ),
            Self::StartFailed { .. } => {
                Some("Check the dev server output (tail_logs) for the reason it exited.")
            }
            Self::NotRunning { .. } => Some("Start the session first."),
            _ => None,
        }
    }

    /// Structured details suitable for an error payload.
    pub fn fields(&self) -> Option<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        match self {
            Self::InstallFailed {
                exit_code,
                stderr_excerpt,
            } => {
                if let Some(c) = exit_code {
                    out.insert("exit_code".to_string(), c.to_string());
                }
                out.insert("stderr".to_string(), stderr_excerpt.clone());
            }
            Self::StartFailed { stderr_excerpt, .. } => {
                out.insert("stderr".to_string(), stderr_excerpt.clone());
            }
            Self::InvalidFileTree { path, reason } => {
                out.insert(path.clone(), reason.clone());
            }
            _ => return None,
        }
        Some(out)
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn internal_error_displays_full_chain() {
        let err: anyhow::Result<()> = Err(std::io::Error::other("disk full"))
            .context("write package.json");
        let err = SessionError::from(err.unwrap_err());
        assert_eq!(err.to_string(), "write package.json: disk full");
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn install_failed_reports_exit_code_and_stderr() {
        let err = SessionError::InstallFailed {
            exit_code: Some(7),
            stderr_excerpt: "ERESOLVE".to_string(),
        };
        assert_eq!(err.to_string(), "dependency install failed (exit code 7)");
        let fields = err.fields().unwrap();
        assert_eq!(fields.get("exit_code").map(String::as_str), Some("7"));
        assert_eq!(fields.get("stderr").map(String::as_str), Some("ERESOLVE"));
    }

    #[test]
    fn signal_exit_is_labelled() {
        let err = SessionError::InstallFailed {
            exit_code: None,
            stderr_excerpt: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn simple_errors_have_no_fields() {
        let err = SessionError::NotRunning {
            session_id: "s1".to_string(),
        };
        assert_eq!(err.code(), "not_running");
        assert!(err.fields().is_none());
    }
}
