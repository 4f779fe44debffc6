//! Per-job log hub.
//!
//! Each job owns one [`LogHub`]: an ordered log with a bounded replay tail
//! and live fan-out. Appends never wait on subscribers; every subscriber
//! reads through its own bounded broadcast queue and is cut off with
//! [`ReconError::SubscriberOverrun`] once it falls a full queue behind.

mod sink;

use std::{collections::VecDeque, path::Path, pin::Pin};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    error::{ReconError, Result},
    ids::JobId,
};

pub use sink::{LOG_FILE_NAME, LineWriter, WriteMode, format_line, read_log_file};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogKind {
    /// A line of tool output.
    Output,
    /// Engine bookkeeping: lifecycle transitions and step outcomes.
    System,
    /// An artifact was produced or updated.
    Artifact { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// Tool that emitted the line, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub kind: LogKind,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send + 'static>>;

#[derive(Debug)]
struct HubState {
    next_sequence: u64,
    retained: VecDeque<LogEntry>,
    /// `None` once the job is terminal.
    live: Option<broadcast::Sender<LogEntry>>,
    sink: Option<LineWriter>,
}

#[derive(Debug)]
pub struct LogHub {
    job_id: JobId,
    retention: usize,
    state: Mutex<HubState>,
}

impl LogHub {
    pub fn new(job_id: JobId, retention: usize, subscriber_queue: usize) -> Self {
        let (live, _) = broadcast::channel(subscriber_queue.max(1));
        Self {
            job_id,
            retention: retention.max(1),
            state: Mutex::new(HubState {
                next_sequence: 0,
                retained: VecDeque::new(),
                live: Some(live),
                sink: None,
            }),
        }
    }

    /// A closed hub preloaded with `lines`, used for jobs loaded from disk.
    pub fn restored(
        job_id: JobId,
        retention: usize,
        lines: Vec<(DateTime<Utc>, String)>,
    ) -> Self {
        let hub = Self::new(job_id, retention, 1);
        {
            let mut state = hub.state.lock();
            state.live = None;
            for (timestamp, text) in lines {
                let entry = LogEntry {
                    job_id,
                    sequence: state.next_sequence,
                    timestamp,
                    text,
                    source: None,
                    kind: LogKind::Output,
                };
                state.next_sequence += 1;
                Self::retain(&mut state.retained, hub.retention, entry);
            }
        }
        hub
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn output(&self, source: &str, text: impl Into<String>) -> u64 {
        self.append(LogKind::Output, Some(source.to_string()), text.into())
    }

    pub fn system(&self, text: impl Into<String>) -> u64 {
        self.append(LogKind::System, None, text.into())
    }

    pub fn artifact(&self, name: &str) -> u64 {
        self.append(
            LogKind::Artifact {
                name: name.to_string(),
            },
            None,
            format!("artifact produced: {name}"),
        )
    }

    /// Assign the next sequence number and publish. Never blocks on readers.
    pub fn append(&self, kind: LogKind, source: Option<String>, text: String) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let entry = LogEntry {
            job_id: self.job_id,
            sequence,
            timestamp: Utc::now(),
            text,
            source,
            kind,
        };

        let sink_gone = state
            .sink
            .as_ref()
            .is_some_and(|sink| !sink.send(format_line(&entry)));
        if sink_gone {
            state.sink = None;
        }
        if let Some(live) = &state.live {
            // No receivers is fine.
            let _ = live.send(entry.clone());
        }
        Self::retain(&mut state.retained, self.retention, entry);
        sequence
    }

    fn retain(retained: &mut VecDeque<LogEntry>, retention: usize, entry: LogEntry) {
        if retained.len() == retention {
            retained.pop_front();
        }
        retained.push_back(entry);
    }

    /// Retained entries with `sequence >= from`.
    pub fn snapshot(&self, from: Option<u64>) -> Vec<LogEntry> {
        let from = from.unwrap_or(0);
        self.state
            .lock()
            .retained
            .iter()
            .filter(|entry| entry.sequence >= from)
            .cloned()
            .collect()
    }

    /// Replay the retained tail from `from` (or its start), then follow live
    /// appends until the hub closes.
    ///
    /// The replay snapshot and the live receiver are taken under the same
    /// lock as `append`, so the handoff has no gaps or duplicates.
    pub fn subscribe(&self, from: Option<u64>) -> LogStream {
        let (replay, receiver) = {
            let state = self.state.lock();
            let replay: Vec<LogEntry> = state
                .retained
                .iter()
                .filter(|entry| from.is_none_or(|from| entry.sequence >= from))
                .cloned()
                .collect();
            (replay, state.live.as_ref().map(broadcast::Sender::subscribe))
        };
        let from = from.unwrap_or(0);

        Box::pin(async_stream::stream! {
            for entry in replay {
                yield Ok(entry);
            }

            let Some(mut receiver) = receiver else {
                return;
            };
            loop {
                match receiver.recv().await {
                    Ok(entry) => {
                        if entry.sequence >= from {
                            yield Ok(entry);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Err(ReconError::SubscriberOverrun { skipped });
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Start mirroring entries to `job.log` under `dir`. Retained entries
    /// are written first.
    pub fn attach_file(&self, dir: &Path) {
        let mut state = self.state.lock();
        let writer = LineWriter::spawn(dir.join(LOG_FILE_NAME), WriteMode::Append);
        for entry in &state.retained {
            writer.send(format_line(entry));
        }
        state.sink = Some(writer);
    }

    /// End the log. Live subscribers finish once they drain; later
    /// subscribers get the retained tail only.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.live = None;
        state.sink = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().live.is_none()
    }

    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .live
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;

    fn hub(retention: usize, queue: usize) -> LogHub {
        LogHub::new(JobId::new(), retention, queue)
    }

    async fn collect(stream: LogStream) -> Vec<Result<LogEntry>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn sequences_start_at_zero_and_increase() {
        let hub = hub(10, 10);
        assert_eq!(hub.system("queued"), 0);
        assert_eq!(hub.output("subfinder", "a.example.com"), 1);
        assert_eq!(hub.artifact("subfinder.txt"), 2);
        assert_eq!(hub.next_sequence(), 3);
    }

    #[tokio::test]
    async fn late_subscriber_gets_tail_then_live_entries() {
        let hub = Arc::new(hub(10, 10));
        hub.system("first");
        hub.system("second");

        let stream = hub.subscribe(Some(1));
        hub.system("third");
        hub.close();

        let texts: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|entry| entry.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn replay_is_bounded_by_retention() {
        let hub = hub(3, 10);
        for i in 0..10 {
            hub.system(format!("line {i}"));
        }
        hub.close();

        let sequences: Vec<u64> = collect(hub.subscribe(None))
            .await
            .into_iter()
            .map(|entry| entry.unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn terminal_replay_is_idempotent() {
        let hub = hub(100, 10);
        for i in 0..25 {
            hub.output("gau", format!("https://example.com/{i}"));
        }
        hub.close();

        let first = collect(hub.subscribe(Some(5))).await;
        let second = collect(hub.subscribe(Some(5))).await;
        let first: Vec<LogEntry> = first.into_iter().map(|e| e.unwrap()).collect();
        let second: Vec<LogEntry> = second.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(first.len(), 20);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn slow_subscriber_is_overrun_without_blocking_appends() {
        let hub = hub(1000, 4);
        let stream = hub.subscribe(None);

        for i in 0..50 {
            hub.output("httpx", format!("line {i}"));
        }
        hub.close();

        let items = collect(stream).await;
        let last = items.last().unwrap();
        assert!(matches!(last, Err(ReconError::SubscriberOverrun { .. })));
        assert_eq!(hub.next_sequence(), 50);
    }

    #[tokio::test]
    async fn restored_hub_is_closed_and_replays() {
        let now = Utc::now();
        let hub = LogHub::restored(
            JobId::new(),
            10,
            vec![(now, "one".into()), (now, "two".into())],
        );
        assert!(hub.is_closed());
        let texts: Vec<String> = collect(hub.subscribe(None))
            .await
            .into_iter()
            .map(|entry| entry.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
