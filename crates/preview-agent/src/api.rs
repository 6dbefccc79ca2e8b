//! Response envelopes for callers that speak JSON.

use preview_process::{AckResponse, SessionStatus, StartResponse, StatusResponse};

use crate::{error::SessionError, error_payload, orchestrator::StartInfo};

pub fn start_response(res: &Result<StartInfo, SessionError>) -> StartResponse {
    match res {
        Ok(info) => StartResponse {
            success: true,
            url: Some(info.url.clone()),
            error: None,
        },
        Err(e) => StartResponse {
            success: false,
            url: None,
            error: Some(error_payload::from_error(e)),
        },
    }
}

pub fn ack_response<T>(res: &Result<T, SessionError>) -> AckResponse {
    match res {
        Ok(_) => AckResponse {
            success: true,
            error: None,
        },
        Err(e) => AckResponse {
            success: false,
            error: Some(error_payload::from_error(e)),
        },
    }
}

pub fn status_response(status: &SessionStatus) -> StatusResponse {
    StatusResponse::from(status)
}

#[cfg(test)]
mod tests {
    use preview_process::RunId;

    use super::*;

    #[test]
    fn start_success_carries_url_only() {
        let res = Ok(StartInfo {
            url: "http://localhost:5173".to_string(),
            port: 5173,
            run_id: RunId::new(),
            first_time: true,
            reused: false,
        });
        let body = serde_json::to_value(start_response(&res)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "success": true, "url": "http://localhost:5173" })
        );
    }

    #[test]
    fn start_failure_carries_error_code_and_stderr() {
        let res: Result<StartInfo, SessionError> = Err(SessionError::StartFailed {
            message: "dev server exited within 3000ms of launch (exit code 1)".to_string(),
            stderr_excerpt: "Error: Cannot find module 'vite'".to_string(),
        });
        let resp = start_response(&res);
        assert!(!resp.success);
        assert!(resp.url.is_none());
        let err = resp.error.unwrap();
        assert_eq!(err.code, "start_failed");
        assert_eq!(
            err.field_errors.unwrap().get("stderr").map(String::as_str),
            Some("Error: Cannot find module 'vite'")
        );
    }

    #[test]
    fn ack_maps_not_running() {
        let ok: Result<(), SessionError> = Ok(());
        assert!(ack_response(&ok).success);

        let res: Result<(), SessionError> = Err(SessionError::NotRunning {
            session_id: "s1".to_string(),
        });
        let resp = ack_response(&res);
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "not_running");
    }

    #[test]
    fn status_hides_port_when_not_running() {
        let absent = SessionStatus::absent("s1");
        let body = serde_json::to_value(status_response(&absent)).unwrap();
        assert_eq!(body, serde_json::json!({ "running": false }));
    }
}
