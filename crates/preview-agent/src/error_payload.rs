use std::collections::BTreeMap;

use preview_process::ErrorPayload;

use crate::error::SessionError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
// Install/start stderr excerpts land here; keep them readable in an API response.
const MAX_FIELD_ERROR_BYTES: usize = 4 * 1024;

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn payload(
    code: &str,
    message: impl Into<String>,
    field_errors: Option<BTreeMap<String, String>>,
    hint: Option<String>,
) -> ErrorPayload {
    let message = truncate_utf8(&message.into(), MAX_MESSAGE_BYTES);

    let field_errors = field_errors.map(|mut m| {
        for v in m.values_mut() {
            *v = truncate_utf8(v, MAX_FIELD_ERROR_BYTES);
        }
        m
    });

    let hint = hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES));

    ErrorPayload {
        code: code.to_string(),
        message,
        field_errors,
        hint,
    }
}

pub fn from_error(err: &SessionError) -> ErrorPayload {
    payload(
        err.code(),
        err.to_string(),
        err.fields(),
        err.hint().map(str::to_string),
    )
}
