use std::path::{Path, PathBuf};

use axum::{Json, extract::State};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;
use walkdir::WalkDir;
use watchmysix_core::ToolAvailability;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub data_dir: PathBuf,
    pub wordlist_dir: PathBuf,
    pub resolver_dir: PathBuf,
    pub max_concurrency: usize,
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug, Serialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolAvailability>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let settings = state.engine.settings();
    let stats = state.engine.stats();
    Json(HealthResponse {
        status: "ok",
        data_dir: settings.data_root.clone(),
        wordlist_dir: settings.wordlist_dir.clone(),
        resolver_dir: settings.resolver_dir.clone(),
        max_concurrency: stats.max_concurrency,
        running: stats.running,
        queued: stats.queued,
    })
}

pub async fn list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.engine.catalog().availability(),
    })
}

pub async fn list_wordlists(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let files = list_files(&state.engine.settings().wordlist_dir, "Wordlist").await?;
    Ok(Json(json!({ "wordlists": files })))
}

pub async fn list_resolvers(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let files = list_files(&state.engine.settings().resolver_dir, "Resolver").await?;
    Ok(Json(json!({ "resolvers": files })))
}

async fn list_files(root: &Path, label: &'static str) -> AppResult<Vec<String>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_files(&root, label))
        .await
        .map_err(|err| AppError::internal(format!("{label} listing aborted: {err}")))?
}

/// Every regular file under `root`, relative to it, sorted. Symlinked files
/// and directories are followed.
fn walk_files(root: &Path, label: &str) -> AppResult<Vec<String>> {
    if !root.is_dir() {
        return Err(AppError::internal(format!("{label} directory is missing")));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.metadata().is_ok_and(|meta| meta.is_file()) {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}
