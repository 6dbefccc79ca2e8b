//! Diagnostic capture of dev-server output: a bounded in-memory ring per session, mirrored
//! to a size-rotated console log on disk.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
};

pub(crate) const STDERR_TAG: &str = "[stderr] ";
pub(crate) const STDOUT_TAG: &str = "[stdout] ";

#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back((self.next_seq, line));
        self.next_seq = self.next_seq.saturating_add(1);
    }

    /// Up to `limit` lines after `cursor`, plus the cursor to pass next time. Cursor 0
    /// asks for the newest `limit` lines instead.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let picked: Vec<&(u64, String)> = if cursor == 0 {
            let skip = self.lines.len().saturating_sub(limit);
            self.lines.iter().skip(skip).collect()
        } else {
            self.lines
                .iter()
                .filter(|(seq, _)| *seq > cursor)
                .take(limit)
                .collect()
        };
        let next = picked.last().map_or(cursor, |(seq, _)| *seq);
        (picked.into_iter().map(|(_, l)| l.clone()).collect(), next)
    }

    /// Sequence number of the newest line (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// The last `max` stderr lines written after `since`; falls back to stdout when the
    /// process wrote nothing to stderr.
    pub fn stderr_excerpt(&self, since: u64, max: usize) -> String {
        let pick = |tag: &str| -> Vec<&str> {
            let mut v: Vec<&str> = self
                .lines
                .iter()
                .filter(|(seq, _)| *seq > since)
                .filter_map(|(_, l)| l.strip_prefix(tag))
                .collect();
            let skip = v.len().saturating_sub(max);
            v.drain(..skip);
            v
        };

        let mut lines = pick(STDERR_TAG);
        if lines.is_empty() {
            lines = pick(STDOUT_TAG);
        }
        lines.join("\n")
    }
}

#[derive(Clone, Debug)]
pub struct LogSink {
    session_id: Arc<str>,
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    /// Sink that mirrors every line into a rotated file at `path`. Each call starts its own
    /// writer task, so a session must keep reusing one sink.
    pub fn open(
        session_id: &str,
        buffer: Arc<Mutex<LogBuffer>>,
        path: PathBuf,
        max_bytes: u64,
        max_files: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut log = match ConsoleLog::open(path.clone(), max_bytes, max_files).await {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "console log unavailable");
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                if let Err(e) = log.append(&line).await {
                    tracing::debug!(path = %path.display(), error = %e, "console log write failed");
                }
            }
        });

        Self {
            session_id: Arc::from(session_id),
            buffer,
            file_tx: Some(tx),
        }
    }

    #[cfg(test)]
    pub(crate) fn memory_only(session_id: &str, buffer: Arc<Mutex<LogBuffer>>) -> Self {
        Self {
            session_id: Arc::from(session_id),
            buffer,
            file_tx: None,
        }
    }

    pub fn buffer(&self) -> &Arc<Mutex<LogBuffer>> {
        &self.buffer
    }

    #[cfg(test)]
    pub(crate) fn shares_writer_with(&self, other: &LogSink) -> bool {
        match (&self.file_tx, &other.file_tx) {
            (Some(a), Some(b)) => a.same_channel(b),
            _ => false,
        }
    }

    pub async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(target: "preview_agent::child", session_id = %self.session_id, "{line}");
        self.buffer.lock().await.push_line(line.clone());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }
}

// `<name>.log` plus numbered rotations, newest first.
struct ConsoleLog {
    chain: Vec<PathBuf>,
    max_bytes: u64,
    written: u64,
    file: tokio::fs::File,
}

async fn append_handle(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl ConsoleLog {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let written = tokio::fs::metadata(&path).await.map_or(0, |m| m.len());
        let file = append_handle(&path).await?;
        Ok(Self {
            chain: rotation_chain(&path, max_files),
            max_bytes,
            written,
            file,
        })
    }

    // The oldest file falls off the end of the chain.
    async fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        if self.chain.len() == 1 {
            let _ = tokio::fs::remove_file(&self.chain[0]).await;
        }
        for pair in self.chain.windows(2).rev() {
            if tokio::fs::try_exists(&pair[0]).await.unwrap_or(false) {
                tokio::fs::rename(&pair[0], &pair[1]).await?;
            }
        }
        self.file = append_handle(&self.chain[0]).await?;
        self.written = 0;
        Ok(())
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let record = if line.ends_with('\n') {
            line.to_string()
        } else {
            format!("{line}\n")
        };
        let len = record.len() as u64;
        if self.max_bytes > 0 && self.written > 0 && self.written + len > self.max_bytes {
            self.rotate().await?;
        }
        self.file.write_all(record.as_bytes()).await?;
        self.file.flush().await?;
        self.written += len;
        Ok(())
    }
}

fn rotation_chain(base: &Path, max_files: usize) -> Vec<PathBuf> {
    let mut chain = vec![base.to_path_buf()];
    chain.extend((1..=max_files).map(|i| PathBuf::from(format!("{}.{i}", base.display()))));
    chain
}

/// Console log files (`<name>.log`, `<name>.log.1`, ...) for one workspace name.
pub(crate) fn console_log_files(logs_dir: &Path, name: &str, max_files: usize) -> Vec<PathBuf> {
    rotation_chain(&logs_dir.join(format!("{name}.log")), max_files)
}
