use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        Sse,
        sse::{Event, KeepAlive},
    },
};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use watchmysix_core::{JobId, LogEntry, LogKind, ReconEngine, ReconError};

use super::parse_job_id;
use crate::infra::{app_state::AppState, errors::AppResult};

const LAST_EVENT_ID_HEADER: &str = "last-event-id";

pub const LOG_EVENT: &str = "log";
pub const ARTIFACT_EVENT: &str = "artifact";
pub const OVERRUN_EVENT: &str = "overrun";
pub const COMPLETE_EVENT: &str = "complete";

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    /// First sequence number to return.
    pub from: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct LogSnapshotResponse {
    pub job_id: JobId,
    pub lines: Vec<LogEntry>,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> AppResult<Json<LogSnapshotResponse>> {
    let id = parse_job_id(&id)?;
    let lines = state.engine.log_snapshot(id, query.from)?;
    Ok(Json(LogSnapshotResponse { job_id: id, lines }))
}

pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = parse_job_id(&id)?;
    // Last-Event-ID names the last line the client saw. A reconnecting
    // EventSource repeats its original URL, so the header wins over `from`.
    let last_sequence = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok());
    let from = last_sequence.map(|seq| seq.saturating_add(1)).or(query.from);

    let stream = build_log_event_stream(
        Arc::clone(&state.engine),
        id,
        from,
        state.shutdown.clone(),
    )?;
    Ok(Sse::new(stream).keep_alive(default_keep_alive()))
}

/// Replay retained lines from `from`, follow live output and finish with a
/// `complete` event once the job's log is closed. Ends early, without
/// `complete`, when `shutdown` fires.
pub fn build_log_event_stream(
    engine: Arc<ReconEngine>,
    id: JobId,
    from: Option<u64>,
    shutdown: CancellationToken,
) -> AppResult<impl Stream<Item = Result<Event, Infallible>>> {
    let mut entries = engine.subscribe(id, from)?;

    Ok(async_stream::stream! {
        loop {
            let item = tokio::select! {
                item = entries.next() => item,
                _ = shutdown.cancelled() => return,
            };
            let Some(item) = item else { break };
            match item {
                Ok(entry) => yield Ok::<Event, Infallible>(entry_to_event(&entry)),
                Err(ReconError::SubscriberOverrun { skipped }) => {
                    debug!(job_id = %id, skipped, "log subscriber overrun");
                    let data = json!({ "skipped": skipped }).to_string();
                    yield Ok::<Event, Infallible>(Event::default().event(OVERRUN_EVENT).data(data));
                    return;
                }
                Err(err) => {
                    warn!(job_id = %id, error = %err, "log stream failed");
                    return;
                }
            }
        }

        match engine.get(id) {
            Ok(job) => {
                let payload = json!({
                    "id": job.id,
                    "status": job.status,
                    "finished_at": job.finished_at,
                    "error": job.error,
                });
                let data = payload.to_string();
                yield Ok::<Event, Infallible>(Event::default().event(COMPLETE_EVENT).data(data));
            }
            Err(err) => warn!(job_id = %id, error = %err, "job vanished while streaming"),
        }
    })
}

fn entry_to_event(entry: &LogEntry) -> Event {
    let event = match &entry.kind {
        LogKind::Artifact { name } => Event::default().event(ARTIFACT_EVENT).data(name),
        LogKind::Output | LogKind::System => {
            let line = match &entry.source {
                Some(source) => format!("[{source}] {}", entry.text),
                None => entry.text.clone(),
            };
            Event::default().event(LOG_EVENT).data(line)
        }
    };
    event.id(entry.sequence.to_string())
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}
