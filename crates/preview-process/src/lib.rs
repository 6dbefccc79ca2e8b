use std::collections::BTreeMap;

use specta::Type;

/// Identifies one launch of a session's dev server.
///
/// NOTE: Session IDs are caller-supplied and stable; run IDs change on every spawn so a
/// late exit notification from an old run can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// One file of the project tree to materialize. `path` is relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    /// The process exited but the registry entry has not been pruned yet.
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct SessionStatus {
    pub session_id: String,
    pub running: bool,
    pub state: Option<SessionState>,
    pub run_id: Option<RunId>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at_unix_ms: Option<u64>,
}

impl SessionStatus {
    pub fn absent(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            running: false,
            state: None,
            run_id: None,
            port: None,
            url: None,
            pid: None,
            exit_code: None,
            started_at_unix_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StartResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Reply shape shared by `stop`, `update_files` and `delete`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct AckResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct StatusResponse {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl From<&SessionStatus> for StatusResponse {
    fn from(s: &SessionStatus) -> Self {
        if !s.running {
            return Self {
                running: false,
                url: None,
                port: None,
            };
        }
        Self {
            running: true,
            url: s.url.clone(),
            port: s.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_non_empty_and_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert!(!a.0.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn file_entry_deserializes_from_path_content_pairs() {
        let raw = r#"[{"path":"package.json","content":"{}"},{"path":"src/main.js","content":""}]"#;
        let files: Vec<FileEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], FileEntry::new("src/main.js", ""));
    }

    #[test]
    fn status_response_hides_port_of_stopped_session() {
        let mut st = SessionStatus::absent("s1");
        st.port = Some(5173);
        st.state = Some(SessionState::Exited);
        let resp = StatusResponse::from(&st);
        assert!(!resp.running);
        assert_eq!(resp.port, None);

        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"running":false}"#);
    }

    #[test]
    fn status_response_reports_url_and_port_when_running() {
        let mut st = SessionStatus::absent("s1");
        st.running = true;
        st.state = Some(SessionState::Running);
        st.port = Some(5173);
        st.url = Some("http://localhost:5173".to_string());
        let resp = StatusResponse::from(&st);
        assert_eq!(
            resp,
            StatusResponse {
                running: true,
                url: Some("http://localhost:5173".to_string()),
                port: Some(5173),
            }
        );
    }
}
