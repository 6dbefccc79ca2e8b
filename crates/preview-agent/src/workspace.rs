//! Per-session project directories.
//!
//! The directory name is a pure function of the session ID, so a restarted agent finds the
//! same workspace (and its installed dependencies) again.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use preview_process::FileEntry;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

use crate::error::SessionError;

const WORKSPACE_PREFIX: &str = "ws_";
const LEGACY_PREFIX: &str = "preview-";
const DEPENDENCY_MARKER: &str = "node_modules";
const MAX_SESSION_ID_BYTES: usize = 128;
const DIGEST_HEX_CHARS: usize = 12;

/// Directory name for a session: `ws_<id>`, or `ws_<sanitized>~<digest>` when the ID had
/// to be rewritten. `~` never survives sanitization, so distinct IDs never collide.
pub fn workspace_name(session_id: &str) -> Result<String, SessionError> {
    let id = session_id.trim();
    if id.is_empty() {
        return Err(SessionError::InvalidSessionId {
            reason: "session id must be non-empty".to_string(),
        });
    }
    if id.len() > MAX_SESSION_ID_BYTES {
        return Err(SessionError::InvalidSessionId {
            reason: format!("session id longer than {MAX_SESSION_ID_BYTES} bytes"),
        });
    }

    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized == session_id {
        return Ok(format!("{WORKSPACE_PREFIX}{sanitized}"));
    }

    let digest = hex::encode(Sha1::digest(session_id.as_bytes()));
    Ok(format!(
        "{WORKSPACE_PREFIX}{sanitized}~{}",
        &digest[..DIGEST_HEX_CHARS]
    ))
}

/// Old timestamped layout: `preview-<anything>-<unix time digits>`.
pub fn is_legacy_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(LEGACY_PREFIX) else {
        return false;
    };
    let Some((head, ts)) = rest.rsplit_once('-') else {
        return false;
    };
    !head.is_empty() && ts.len() >= 10 && ts.chars().all(|c| c.is_ascii_digit())
}

pub fn is_workspace_name(name: &str) -> bool {
    name.starts_with(WORKSPACE_PREFIX)
}

fn invalid_path(path: &str, reason: &str) -> SessionError {
    SessionError::InvalidFileTree {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn normalize_rel_path(rel: &str) -> Result<PathBuf, SessionError> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(invalid_path(rel, "path must be relative"));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(invalid_path(rel, "path traversal is not allowed"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(invalid_path(rel, "path must be relative"));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(invalid_path(rel, "path must include a file name"));
    }
    Ok(out)
}

/// Validates every path up front so a bad entry never leaves a half-synced tree.
pub fn validate_file_tree(files: &[FileEntry]) -> Result<Vec<(PathBuf, &str)>, SessionError> {
    files
        .iter()
        .map(|f| Ok((normalize_rel_path(&f.path)?, f.content.as_str())))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        Ok(self.root.join(workspace_name(session_id)?))
    }

    /// Creates the workspace if needed. The flag is true when dependencies still have to be
    /// installed (new directory, or no dependency marker yet).
    pub async fn ensure(&self, session_id: &str) -> Result<(PathBuf, bool), SessionError> {
        let path = self.path_for(session_id)?;
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("create workspace {}", path.display()))?;

        let installed = tokio::fs::metadata(path.join(DEPENDENCY_MARKER))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok((path, !installed))
    }

    /// Additive sync: writes every entry, leaves files absent from `files` alone. Entries
    /// whose content is already on disk are not rewritten.
    pub async fn write(
        &self,
        workspace: &Path,
        files: &[FileEntry],
    ) -> Result<WriteSummary, SessionError> {
        let entries = validate_file_tree(files)?;
        let mut summary = WriteSummary::default();

        for (rel, content) in entries {
            let path = workspace.join(&rel);

            match tokio::fs::symlink_metadata(&path).await {
                Ok(m) if m.file_type().is_symlink() => {
                    return Err(invalid_path(
                        &rel.display().to_string(),
                        "refusing to write through a symlink",
                    ));
                }
                Ok(m) if m.is_dir() => {
                    return Err(invalid_path(&rel.display().to_string(), "path is a directory"));
                }
                Ok(_) => {
                    if let Ok(existing) = tokio::fs::read(&path).await
                        && existing == content.as_bytes()
                    {
                        summary.unchanged += 1;
                        continue;
                    }
                }
                Err(_) => {}
            }

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            write_atomic(&path, content.as_bytes()).await?;
            summary.written += 1;
        }

        Ok(summary)
    }

    /// Bytes on disk under the workspace (best effort, symlinks not followed).
    pub async fn size_bytes(path: &Path) -> u64 {
        let dir = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            fn walk(path: &Path) -> u64 {
                let meta = match std::fs::symlink_metadata(path) {
                    Ok(m) => m,
                    Err(_) => return 0,
                };
                if meta.file_type().is_symlink() || meta.is_file() {
                    return meta.len();
                }
                if !meta.is_dir() {
                    return 0;
                }
                let rd = match std::fs::read_dir(path) {
                    Ok(v) => v,
                    Err(_) => return 0,
                };
                rd.flatten()
                    .fold(0u64, |sum, e| sum.saturating_add(walk(&e.path())))
            }
            walk(&dir)
        })
        .await
        .unwrap_or(0)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.preview-tmp"));

    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: &[(&str, &str)]) -> Vec<FileEntry> {
        entries.iter().map(|(p, c)| FileEntry::new(*p, *c)).collect()
    }

    #[test]
    fn name_is_deterministic_for_safe_ids() {
        assert_eq!(workspace_name("doc-42").unwrap(), "ws_doc-42");
        assert_eq!(workspace_name("doc-42").unwrap(), workspace_name("doc-42").unwrap());
    }

    #[test]
    fn rewritten_ids_get_a_digest_suffix() {
        let a = workspace_name("a/b").unwrap();
        let b = workspace_name("a_b").unwrap();
        let c = workspace_name("a b").unwrap();
        assert_eq!(b, "ws_a_b");
        assert!(a.starts_with("ws_a_b~"));
        assert_eq!(a.len(), "ws_a_b~".len() + DIGEST_HEX_CHARS);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn traversal_ids_stay_inside_root() {
        let name = workspace_name("../../etc").unwrap();
        assert!(!name.contains('/'));
        assert!(name.starts_with(WORKSPACE_PREFIX));
    }

    #[test]
    fn empty_and_long_ids_are_rejected() {
        assert!(matches!(
            workspace_name("  "),
            Err(SessionError::InvalidSessionId { .. })
        ));
        assert!(matches!(
            workspace_name(&"x".repeat(MAX_SESSION_ID_BYTES + 1)),
            Err(SessionError::InvalidSessionId { .. })
        ));
    }

    #[test]
    fn legacy_names_are_recognized() {
        assert!(is_legacy_name("preview-doc42-1700000000000"));
        assert!(is_legacy_name("preview-a-b-1700000000"));
        assert!(!is_legacy_name("preview-doc42"));
        assert!(!is_legacy_name("preview--1700000000000"));
        assert!(!is_legacy_name("ws_preview-doc-1700000000000"));
        assert!(!is_legacy_name("preview-doc-17000x0000000"));
    }

    #[test]
    fn file_tree_rejects_escaping_paths() {
        for bad in ["/etc/passwd", "../x", "src/../../x", "", "."] {
            let err = validate_file_tree(&tree(&[(bad, "")])).unwrap_err();
            assert!(
                matches!(err, SessionError::InvalidFileTree { .. }),
                "accepted {bad:?}"
            );
        }
        let dotted = tree(&[("./src/main.js", "x")]);
        let ok = validate_file_tree(&dotted).unwrap();
        assert_eq!(ok[0].0, PathBuf::from("src").join("main.js"));
    }

    #[tokio::test]
    async fn ensure_reports_first_time_until_dependencies_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkspaceStore::new(dir.path().join("workspaces"));

        let (path, first) = store.ensure("s1").await.unwrap();
        assert!(first);
        assert!(path.is_dir());
        assert_eq!(path, store.path_for("s1").unwrap());

        let (_, first) = store.ensure("s1").await.unwrap();
        assert!(first, "no dependency marker yet");

        tokio::fs::create_dir(path.join(DEPENDENCY_MARKER)).await.unwrap();
        let (again, first) = store.ensure("s1").await.unwrap();
        assert_eq!(again, path);
        assert!(!first);
    }

    #[tokio::test]
    async fn write_materializes_nested_tree_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkspaceStore::new(dir.path());
        let (ws, _) = store.ensure("s1").await.unwrap();

        let files = tree(&[
            ("package.json", r#"{"scripts":{"dev":"vite"}}"#),
            ("src/components/App.jsx", "export default () => null;"),
        ]);
        let first = store.write(&ws, &files).await.unwrap();
        assert_eq!(first, WriteSummary { written: 2, unchanged: 0 });
        assert_eq!(
            tokio::fs::read_to_string(ws.join("src/components/App.jsx"))
                .await
                .unwrap(),
            "export default () => null;"
        );

        let modified = std::fs::metadata(ws.join("package.json"))
            .unwrap()
            .modified()
            .unwrap();
        let second = store.write(&ws, &files).await.unwrap();
        assert_eq!(second, WriteSummary { written: 0, unchanged: 2 });
        let modified_again = std::fs::metadata(ws.join("package.json"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(modified, modified_again);
    }

    #[tokio::test]
    async fn write_overwrites_changed_files_and_keeps_stale_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkspaceStore::new(dir.path());
        let (ws, _) = store.ensure("s1").await.unwrap();

        store
            .write(&ws, &tree(&[("a.txt", "one"), ("old.txt", "stale")]))
            .await
            .unwrap();
        let summary = store.write(&ws, &tree(&[("a.txt", "two")])).await.unwrap();
        assert_eq!(summary.written, 1);

        assert_eq!(tokio::fs::read_to_string(ws.join("a.txt")).await.unwrap(), "two");
        assert_eq!(
            tokio::fs::read_to_string(ws.join("old.txt")).await.unwrap(),
            "stale"
        );
        assert!(!ws.join(".a.txt.preview-tmp").exists());
    }

    #[tokio::test]
    async fn invalid_entry_aborts_before_any_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkspaceStore::new(dir.path());
        let (ws, _) = store.ensure("s1").await.unwrap();

        let err = store
            .write(&ws, &tree(&[("ok.txt", "x"), ("../escape.txt", "y")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidFileTree { .. }));
        assert!(!ws.join("ok.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn size_counts_file_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = WorkspaceStore::new(dir.path());
        let (ws, _) = store.ensure("s1").await.unwrap();
        store
            .write(&ws, &tree(&[("a.txt", "12345"), ("b/c.txt", "123")]))
            .await
            .unwrap();
        assert_eq!(WorkspaceStore::size_bytes(&ws).await, 8);
    }
}
