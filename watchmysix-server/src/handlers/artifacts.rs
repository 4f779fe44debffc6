use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{
        HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::debug;
use watchmysix_core::{Artifact, JobId};

use super::parse_job_id;
use crate::infra::{app_state::AppState, errors::AppResult};

#[derive(Debug, Serialize)]
pub struct ArtifactView {
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    pub produced_at: DateTime<Utc>,
}

impl ArtifactView {
    fn new(job_id: JobId, artifact: Artifact) -> Self {
        Self {
            url: artifact_url(job_id, &artifact.name),
            name: artifact.name,
            size_bytes: artifact.size_bytes,
            produced_at: artifact.produced_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactListResponse {
    pub job_id: JobId,
    pub artifacts: Vec<ArtifactView>,
}

pub fn artifact_url(job_id: JobId, name: &str) -> String {
    format!("/api/jobs/{job_id}/artifacts/{name}")
}

pub async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ArtifactListResponse>> {
    let id = parse_job_id(&id)?;
    let artifacts = state
        .engine
        .artifacts(id)
        .await?
        .into_iter()
        .map(|artifact| ArtifactView::new(id, artifact))
        .collect();
    Ok(Json(ArtifactListResponse {
        job_id: id,
        artifacts,
    }))
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> AppResult<Response> {
    let id = parse_job_id(&id)?;
    let (artifact, file) = state.engine.open_artifact(id, &name).await?;
    debug!(job_id = %id, artifact = %artifact.name, size = artifact.size_bytes, "serving artifact");

    let headers = [
        (CONTENT_TYPE, content_type_for(&artifact.name).to_string()),
        (CONTENT_DISPOSITION, attachment(&artifact.name)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

pub async fn download_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id = parse_job_id(&id)?;
    let bundle = state.engine.archive(id).await?;
    let size = bundle.metadata().await.ok().map(|meta| meta.len());
    debug!(job_id = %id, ?size, "serving archive");

    let headers = [
        (CONTENT_TYPE, "application/zip".to_string()),
        (CONTENT_DISPOSITION, attachment(&format!("{id}.zip"))),
    ];
    let mut response = (headers, Body::from_stream(ReaderStream::new(bundle))).into_response();
    if let Some(size) = size {
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}

fn attachment(file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!("attachment; filename=\"{sanitized}\"")
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if matches!(ext.as_str(), "txt" | "log" | "csv") => "text/plain; charset=utf-8",
        Some(ext) if ext == "json" => "application/json",
        _ => "application/octet-stream",
    }
}
