use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{Value, json};
use tempfile::TempDir;
use watchmysix_core::{
    EngineSettings, ReconEngine, ToolCatalog, ToolSpec,
    tools::{ArgTemplate, StepOutput},
};
use watchmysix_server::{
    AppState,
    infra::config::{ConfigLoad, ConfigLoader, sources::EnvConfig},
    routes,
};

struct Harness {
    server: TestServer,
    engine: Arc<ReconEngine>,
    root: TempDir,
}

fn stub(id: &str, script: &str) -> ToolSpec {
    ToolSpec::command(
        id,
        "/bin/sh",
        vec![
            ArgTemplate::lit("-c"),
            ArgTemplate::lit(script),
            ArgTemplate::lit(id),
            ArgTemplate::Target,
        ],
        StepOutput::Stdout {
            file: format!("{id}.txt"),
        },
    )
}

fn catalog() -> ToolCatalog {
    ToolCatalog::empty()
        .with(stub("subfinder", "echo \"www.$1\"; echo \"api.$1\""))
        .with(stub("sleeper", "echo started; sleep 1000"))
}

async fn harness() -> Result<Harness> {
    let root = tempfile::tempdir()?;
    let data_dir = root.path().join("data");
    let wordlists = root.path().join("wordlists");
    std::fs::create_dir_all(wordlists.join("static-dns"))?;
    std::fs::write(wordlists.join("static-dns/best-dns-wordlist.txt"), "www\n")?;
    std::fs::write(wordlists.join("common.txt"), "api\n")?;

    let config_file = root.path().join("watchmysix.toml");
    std::fs::write(&config_file, "")?;
    let env = EnvConfig::from_vars([
        (
            "WATCHMYSIX_DATA_DIR".to_string(),
            data_dir.display().to_string(),
        ),
        (
            "WATCHMYSIX_WORDLIST_DIR".to_string(),
            wordlists.display().to_string(),
        ),
        (
            "WATCHMYSIX_RESOLVER_DIR".to_string(),
            root.path().join("no-resolvers").display().to_string(),
        ),
        ("WATCHMYSIX_KILL_GRACE".to_string(), "200ms".to_string()),
    ]);
    let ConfigLoad { config, .. } = ConfigLoader::new()
        .with_config_path(&config_file)
        .load_from(env)?;

    let settings = EngineSettings {
        max_concurrency: 2,
        ..config.engine_settings()
    };
    let engine = ReconEngine::start(settings, catalog()).await?;
    let state = AppState::new(Arc::clone(&engine), Arc::new(config));
    let server = TestServer::new(routes::create_app(state))?;

    Ok(Harness {
        server,
        engine,
        root,
    })
}

async fn submit(server: &TestServer, body: Value) -> String {
    let response = server.post("/api/jobs").json(&body).await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    body["id"].as_str().expect("id in submit response").to_string()
}

async fn wait_for_status(server: &TestServer, id: &str, wanted: &[&str]) -> Value {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let job: Value = server.get(&format!("/api/jobs/{id}")).await.json();
        let status = job["status"].as_str().unwrap_or_default().to_string();
        if wanted.contains(&status.as_str()) {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {status}, wanted {wanted:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_log(server: &TestServer, id: &str, text: &str) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let body: Value = server.get(&format!("/api/jobs/{id}/logs")).await.json();
        let seen = body["lines"]
            .as_array()
            .is_some_and(|lines| lines.iter().any(|line| line["text"] == text));
        if seen {
            return;
        }
        assert!(Instant::now() < deadline, "log line {text:?} never arrived");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn health_reports_engine_state() -> Result<()> {
    let h = harness().await?;

    let response = h.server.get("/api/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["max_concurrency"], 2);
    assert_eq!(body["running"], 0);
    assert_eq!(body["queued"], 0);
    assert_eq!(
        body["data_dir"],
        h.root.path().join("data").display().to_string()
    );

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn submitted_job_is_queryable_and_listed() -> Result<()> {
    let h = harness().await?;

    let response = h
        .server
        .post("/api/jobs")
        .json(&json!({ "target": "Example.com", "tools": ["subfinder"] }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    let id = body["id"].as_str().expect("id").to_string();
    assert_eq!(body["job_id"], body["id"]);
    assert_eq!(body["target"], "example.com");
    assert!(matches!(body["status"].as_str(), Some("queued" | "running")));

    let job = wait_for_status(&h.server, &id, &["succeeded"]).await;
    assert_eq!(job["requested_tools"], json!(["subfinder"]));
    assert_eq!(job["step_results"][0]["tool"], "subfinder");
    assert_eq!(job["step_results"][0]["exit_code"], 0);

    let listed: Value = h.server.get("/api/jobs").await.json();
    let jobs = listed["jobs"].as_array().expect("jobs array");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], id.as_str());
    assert_eq!(jobs[0]["completed_steps"], 1);

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_submissions_are_rejected() -> Result<()> {
    let h = harness().await?;

    let response = h
        .server
        .post("/api/jobs")
        .json(&json!({ "target": "example.com", "tools": ["unknown_tool"] }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["status"], 400);
    assert!(
        body["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("unknown_tool"))
    );

    h.server
        .post("/api/jobs")
        .json(&json!({ "target": "", "tools": ["subfinder"] }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    h.server
        .post("/api/jobs")
        .text("{not json")
        .content_type("application/json")
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let listed: Value = h.server.get("/api/jobs").await.json();
    assert_eq!(listed["jobs"], json!([]));

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_jobs_are_not_found() -> Result<()> {
    let h = harness().await?;

    for path in [
        "/api/jobs/not-a-uuid",
        "/api/jobs/0190c8f2-7c1e-7000-8000-000000000000",
        "/api/jobs/0190c8f2-7c1e-7000-8000-000000000000/artifacts",
        "/api/jobs/0190c8f2-7c1e-7000-8000-000000000000/logs",
    ] {
        let response = h.server.get(path).await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["error"]["status"], 404);
    }

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn artifacts_can_be_listed_and_downloaded() -> Result<()> {
    let h = harness().await?;
    let id = submit(
        &h.server,
        json!({ "target": "example.com", "tools": ["subfinder"] }),
    )
    .await;
    wait_for_status(&h.server, &id, &["succeeded"]).await;

    let listed: Value = h.server.get(&format!("/api/jobs/{id}/artifacts")).await.json();
    let artifacts = listed["artifacts"].as_array().expect("artifacts array");
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["name"], "subfinder.txt");
    let url = artifacts[0]["url"].as_str().expect("url").to_string();
    assert_eq!(url, format!("/api/jobs/{id}/artifacts/subfinder.txt"));

    let download = h.server.get(&url).await;
    download.assert_status_ok();
    assert_eq!(download.text(), "www.example.com\napi.example.com\n");
    assert_eq!(
        artifacts[0]["size_bytes"],
        "www.example.com\napi.example.com\n".len()
    );

    h.server
        .get(&format!("/api/jobs/{id}/artifacts/job.log"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    h.server
        .get(&format!("/api/jobs/{id}/artifacts/..%2Fjob.json"))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let archive = h.server.get(&format!("/api/jobs/{id}/archive")).await;
    archive.assert_status_ok();
    assert_eq!(archive.header("content-type"), "application/zip");
    let disposition = archive.header("content-disposition");
    assert!(disposition.to_str()?.contains(&format!("{id}.zip")));
    assert!(archive.as_bytes().starts_with(b"PK"));

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn finished_job_log_stream_replays_and_completes() -> Result<()> {
    let h = harness().await?;
    let id = submit(
        &h.server,
        json!({ "target": "example.com", "tools": ["subfinder"] }),
    )
    .await;
    wait_for_status(&h.server, &id, &["succeeded"]).await;

    let snapshot: Value = h.server.get(&format!("/api/jobs/{id}/logs")).await.json();
    let lines = snapshot["lines"].as_array().expect("lines");
    assert!(lines.iter().any(|line| line["text"] == "www.example.com"));
    let last_sequence = lines.last().and_then(|line| line["sequence"].as_u64()).expect("sequence");

    let stream = h.server.get(&format!("/api/jobs/{id}/logs/stream")).await;
    stream.assert_status_ok();
    let text = stream.text();
    assert!(text.contains("event: log"));
    assert!(text.contains("data: [subfinder] www.example.com"));
    assert!(text.contains("event: artifact\ndata: subfinder.txt"));
    assert!(text.contains("event: complete"));
    assert!(text.contains("\"status\":\"succeeded\""));
    let www = text.find("www.example.com").expect("first line");
    let api = text.find("api.example.com").expect("second line");
    assert!(www < api);

    // Resuming past the end yields only the completion signal.
    let resumed = h
        .server
        .get(&format!("/api/jobs/{id}/logs/stream"))
        .add_header(
            HeaderName::from_static("last-event-id"),
            HeaderValue::from_str(&last_sequence.to_string())?,
        )
        .await
        .text();
    assert!(!resumed.contains("event: log"));
    assert!(resumed.contains("event: complete"));

    let from_query = h
        .server
        .get(&format!("/api/jobs/{id}/logs/stream?from={last_sequence}"))
        .await
        .text();
    assert!(from_query.contains(&format!("id: {last_sequence}")));
    assert!(from_query.contains("event: complete"));

    // A reconnect repeats the original `?from=0`; the header still decides.
    let reconnect = h
        .server
        .get(&format!("/api/jobs/{id}/logs/stream?from=0"))
        .add_header(
            HeaderName::from_static("last-event-id"),
            HeaderValue::from_str(&last_sequence.to_string())?,
        )
        .await
        .text();
    assert!(!reconnect.contains("www.example.com"));
    assert!(!reconnect.contains("event: log"));
    assert!(reconnect.contains("event: complete"));

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancel_is_idempotent() -> Result<()> {
    let h = harness().await?;
    let id = submit(
        &h.server,
        json!({ "target": "example.com", "tools": ["sleeper"] }),
    )
    .await;
    wait_for_log(&h.server, &id, "started").await;

    let response = h.server.post(&format!("/api/jobs/{id}/cancel")).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["cancel_requested"], true);
    assert_eq!(body["already_terminal"], false);

    let job = wait_for_status(&h.server, &id, &["cancelled"]).await;
    assert_eq!(job["step_results"][0]["error"]["kind"], "cancelled");

    let again = h.server.delete(&format!("/api/jobs/{id}")).await;
    again.assert_status_ok();
    let body: Value = again.json();
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["already_terminal"], true);

    h.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tools_and_wordlists_are_listed() -> Result<()> {
    let h = harness().await?;

    let tools: Value = h.server.get("/api/tools").await.json();
    let ids: Vec<&str> = tools["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .filter_map(|tool| tool["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["sleeper", "subfinder"]);
    assert!(
        tools["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .all(|tool| tool["available"] == true)
    );

    let wordlists: Value = h.server.get("/api/wordlists").await.json();
    assert_eq!(
        wordlists["wordlists"],
        json!(["common.txt", Path::new("static-dns").join("best-dns-wordlist.txt").display().to_string()])
    );

    h.server
        .get("/api/resolvers")
        .await
        .assert_status(StatusCode::INTERNAL_SERVER_ERROR);

    h.engine.shutdown().await;
    Ok(())
}
