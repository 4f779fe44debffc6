//! Per-job artifact registry.
//!
//! Artifacts are the files a job leaves in its working directory. Adapters
//! register what they declare, and the executor rescans the directory after
//! every step to pick up anything else the tool wrote.

use std::{
    collections::HashMap,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tracing::warn;
use zip::{ZipWriter, write::SimpleFileOptions};

use crate::{
    error::{ReconError, Result},
    ids::JobId,
    logs::{LOG_FILE_NAME, LogHub},
    persistence::SNAPSHOT_FILE_NAME,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub job_id: JobId,
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactChange {
    Added(Artifact),
    Updated(Artifact),
    Unchanged,
}

#[derive(Debug)]
pub struct ArtifactTracker {
    job_id: JobId,
    root: PathBuf,
    entries: RwLock<HashMap<String, Artifact>>,
    announce: Option<Arc<LogHub>>,
}

impl ArtifactTracker {
    pub fn new(job_id: JobId, root: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            root: root.into(),
            entries: RwLock::new(HashMap::new()),
            announce: None,
        }
    }

    /// Post an artifact notice to `hub` whenever a new name appears.
    pub fn announcing_to(mut self, hub: Arc<LogHub>) -> Self {
        self.announce = Some(hub);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record `name` as backed by `path`. Re-registering a name refreshes its
    /// size and timestamp.
    pub async fn register(&self, name: &str, path: impl AsRef<Path>) -> Result<ArtifactChange> {
        validate_name(name)?;
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ReconError::Validation(format!(
                "artifact '{name}' is not a regular file"
            )));
        }

        let produced_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let artifact = Artifact {
            job_id: self.job_id,
            name: name.to_string(),
            path,
            size_bytes: metadata.len(),
            produced_at,
        };

        let change = {
            let mut entries = self.entries.write();
            match entries.get(name) {
                Some(existing) if *existing == artifact => ArtifactChange::Unchanged,
                Some(_) => {
                    entries.insert(name.to_string(), artifact.clone());
                    ArtifactChange::Updated(artifact)
                }
                None => {
                    entries.insert(name.to_string(), artifact.clone());
                    ArtifactChange::Added(artifact)
                }
            }
        };

        if let (Some(hub), ArtifactChange::Added(artifact)) = (&self.announce, &change) {
            hub.artifact(&artifact.name);
        }
        Ok(change)
    }

    /// Register every regular, non-reserved file directly under the root.
    pub async fn refresh(&self) -> Result<Vec<ArtifactChange>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut changes = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_name(&name).is_err() {
                continue;
            }
            match self.register(&name, entry.path()).await {
                Ok(ArtifactChange::Unchanged) => {}
                Ok(change) => changes.push(change),
                // Raced with a rename or delete.
                Err(ReconError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(changes)
    }

    /// Artifacts ordered by production time, then name.
    pub fn list(&self) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self.entries.read().values().cloned().collect();
        artifacts.sort_by(|a, b| {
            a.produced_at
                .cmp(&b.produced_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        artifacts
    }

    pub fn get(&self, name: &str) -> Result<Artifact> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ReconError::ArtifactNotFound {
                job_id: self.job_id,
                name: name.to_string(),
            })
    }

    pub async fn open(&self, name: &str) -> Result<(Artifact, File)> {
        let artifact = self.get(name)?;
        let file = File::open(&artifact.path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ReconError::ArtifactNotFound {
                    job_id: self.job_id,
                    name: name.to_string(),
                }
            } else {
                err.into()
            }
        })?;
        Ok((artifact, file))
    }

    /// Bundle every currently listed artifact into a ZIP. Built fresh on
    /// each call into an anonymous temporary file, returned rewound so it
    /// can be streamed.
    pub async fn archive(&self) -> Result<File> {
        let artifacts = self.list();
        let file = tokio::task::spawn_blocking(move || build_archive(&artifacts))
            .await
            .map_err(|err| ReconError::Internal(format!("archive task failed: {err}")))??;
        Ok(File::from_std(file))
    }
}

fn build_archive(artifacts: &[Artifact]) -> Result<std::fs::File> {
    let mut zip = ZipWriter::new(tempfile::tempfile()?);

    for artifact in artifacts {
        let file = match std::fs::File::open(&artifact.path) {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    artifact = %artifact.name,
                    error = %err,
                    "skipping unreadable artifact while archiving"
                );
                continue;
            }
        };
        // Running tools keep appending; archive the length seen now.
        let size = file.metadata()?.len();
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(size >= u64::from(u32::MAX));
        zip.start_file(artifact.name.as_str(), options)?;
        std::io::copy(&mut file.take(size), &mut zip)?;
    }

    let mut out = zip.finish()?;
    out.flush()?;
    out.seek(SeekFrom::Start(0))?;
    Ok(out)
}

/// Names a job's bookkeeping files use; never listed as artifacts.
pub fn is_reserved(name: &str) -> bool {
    name == LOG_FILE_NAME || name == SNAPSHOT_FILE_NAME || name.starts_with('.')
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || is_reserved(name)
    {
        return Err(ReconError::Validation(format!(
            "invalid artifact name '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn unpack(file: File) -> zip::ZipArchive<std::fs::File> {
        zip::ZipArchive::new(file.into_std().await).unwrap()
    }

    fn tracker(dir: &Path) -> ArtifactTracker {
        ArtifactTracker::new(JobId::new(), dir)
    }

    #[tokio::test]
    async fn register_then_reregister_updates_size() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let path = dir.path().join("subs.txt");

        std::fs::write(&path, "a.example.com\n").unwrap();
        let first = tracker.register("subs.txt", &path).await.unwrap();
        assert!(matches!(first, ArtifactChange::Added(ref a) if a.size_bytes == 14));

        std::fs::write(&path, "a.example.com\nb.example.com\n").unwrap();
        let second = tracker.register("subs.txt", &path).await.unwrap();
        assert!(matches!(second, ArtifactChange::Updated(ref a) if a.size_bytes == 28));
        assert_eq!(tracker.list().len(), 1);
    }

    #[tokio::test]
    async fn rejects_path_like_and_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "x").unwrap();

        for name in ["", "../x.txt", "a/b", "job.log", "job.json", ".hidden"] {
            assert!(
                matches!(
                    tracker.register(name, &path).await,
                    Err(ReconError::Validation(_))
                ),
                "{name} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn refresh_skips_bookkeeping_files_and_announces_new_names() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = JobId::new();
        let hub = Arc::new(LogHub::new(job_id, 100, 16));
        let tracker = ArtifactTracker::new(job_id, dir.path()).announcing_to(Arc::clone(&hub));

        std::fs::write(dir.path().join("job.log"), "log").unwrap();
        std::fs::write(dir.path().join("subfinder.txt"), "a\n").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let changes = tracker.refresh().await.unwrap();
        assert_eq!(changes.len(), 1);
        assert!(tracker.refresh().await.unwrap().is_empty());

        let names: Vec<_> = tracker.list().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["subfinder.txt"]);
        let notices = hub.snapshot(None);
        assert_eq!(notices.len(), 1);
        assert_eq!(
            notices[0].kind,
            crate::logs::LogKind::Artifact {
                name: "subfinder.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        assert!(matches!(
            tracker.open("nope.txt").await,
            Err(ReconError::ArtifactNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn archive_contains_every_listed_artifact_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let files = [
            ("crtsh.txt", "www.example.com\nmail.example.com\n".to_string()),
            ("gau.txt", "https://example.com/\n".repeat(500)),
        ];
        for (name, body) in &files {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        tracker.refresh().await.unwrap();

        let mut archive = unpack(tracker.archive().await.unwrap()).await;
        assert_eq!(archive.len(), tracker.list().len());
        for (name, body) in &files {
            let mut contents = String::new();
            archive
                .by_name(name)
                .unwrap()
                .read_to_string(&mut contents)
                .unwrap();
            assert_eq!(&contents, body);
        }
    }

    #[tokio::test]
    async fn archive_reads_files_that_grew_after_registration() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let path = dir.path().join("waymore.txt");
        std::fs::write(&path, "https://example.com/a\n").unwrap();
        tracker.register("waymore.txt", &path).await.unwrap();

        let grown = "https://example.com/a\n".repeat(2000);
        std::fs::write(&path, &grown).unwrap();

        let mut archive = unpack(tracker.archive().await.unwrap()).await;
        let mut contents = String::new();
        archive
            .by_name("waymore.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, grown);
    }
}
