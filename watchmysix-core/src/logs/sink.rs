//! `job.log` mirror of a hub, and the line writer behind it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::warn;

use super::{LogEntry, LogKind};

pub const LOG_FILE_NAME: &str = "job.log";

const SEPARATOR: &str = " | ";

/// `<rfc3339> | [source] text`
pub fn format_line(entry: &LogEntry) -> String {
    let timestamp = entry.timestamp.to_rfc3339();
    match (&entry.kind, &entry.source) {
        (LogKind::Output, Some(source)) => {
            format!("{timestamp}{SEPARATOR}[{source}] {}", entry.text)
        }
        _ => format!("{timestamp}{SEPARATOR}{}", entry.text),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Truncate,
}

/// Background task appending text lines to one file, so callers on the
/// runtime never block on disk. The file is opened on the first line.
#[derive(Debug)]
pub struct LineWriter {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl LineWriter {
    pub fn spawn(path: PathBuf, mode: WriteMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(drain(path, mode, rx));
        Self { tx, task }
    }

    /// Queue one line. `false` once the writer has given up on the file.
    pub fn send(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }

    /// Wait until every queued line has reached the file.
    pub async fn finish(self) {
        let Self { tx, task } = self;
        drop(tx);
        if let Err(err) = task.await {
            warn!(error = %err, "line writer task failed");
        }
    }
}

async fn drain(path: PathBuf, mode: WriteMode, mut rx: mpsc::UnboundedReceiver<String>) {
    let mut writer: Option<BufWriter<File>> = None;

    while let Some(line) = rx.recv().await {
        if writer.is_none() {
            match open(&path, mode).await {
                Ok(file) => writer = Some(BufWriter::new(file)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unable to open output file");
                    return;
                }
            }
        }
        let Some(out) = writer.as_mut() else {
            return;
        };
        if let Err(err) = write_line(out, &line).await {
            warn!(path = %path.display(), error = %err, "output write failed");
            return;
        }
        // Flush whenever the channel drains so the file tracks its producer.
        if rx.is_empty()
            && let Err(err) = out.flush().await
        {
            warn!(path = %path.display(), error = %err, "output flush failed");
            return;
        }
    }

    if let Some(mut out) = writer
        && let Err(err) = out.flush().await
    {
        warn!(path = %path.display(), error = %err, "output flush failed");
    }
}

async fn open(path: &Path, mode: WriteMode) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    match mode {
        WriteMode::Append => options.create(true).append(true),
        WriteMode::Truncate => options.create(true).write(true).truncate(true),
    };
    options.open(path).await
}

async fn write_line(out: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await
}

/// Parse a `job.log` back into `(timestamp, text)` pairs. Lines that do not
/// carry a timestamp are kept with `fallback` as their time.
pub async fn read_log_file(
    path: &Path,
    fallback: DateTime<Utc>,
) -> std::io::Result<Vec<(DateTime<Utc>, String)>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(contents
        .lines()
        .map(|line| match line.split_once(SEPARATOR) {
            Some((stamp, text)) => match DateTime::parse_from_rfc3339(stamp) {
                Ok(stamp) => (stamp.with_timezone(&Utc), text.to_string()),
                Err(_) => (fallback, line.to_string()),
            },
            None => (fallback, line.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ids::JobId, logs::LogHub};
    use std::time::Duration;

    #[tokio::test]
    async fn mirrors_entries_into_job_log() {
        let dir = tempfile::tempdir().unwrap();
        let hub = LogHub::new(JobId::new(), 100, 16);
        hub.system("job queued");
        hub.attach_file(dir.path());
        hub.output("subfinder", "www.example.com");
        hub.close();

        let path = dir.path().join(LOG_FILE_NAME);
        let mut lines = Vec::new();
        for _ in 0..50 {
            lines = read_log_file(&path, Utc::now()).await.unwrap_or_default();
            if lines.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let texts: Vec<&str> = lines.iter().map(|(_, text)| text.as_str()).collect();
        assert_eq!(texts, vec!["job queued", "[subfinder] www.example.com"]);
    }

    #[tokio::test]
    async fn truncating_writer_replaces_contents_and_finishes_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subfinder.txt");
        std::fs::write(&path, "stale\n").unwrap();

        let writer = LineWriter::spawn(path.clone(), WriteMode::Truncate);
        assert!(writer.send("www.example.com".into()));
        assert!(writer.send("api.example.com".into()));
        writer.finish().await;

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "www.example.com\napi.example.com\n"
        );
    }

    #[tokio::test]
    async fn idle_writer_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        LineWriter::spawn(path.clone(), WriteMode::Truncate).finish().await;
        assert!(!path.exists());
    }
}
