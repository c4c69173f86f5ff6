//! Directory-tree synchronization composed from single-file transfers.
//!
//! Backends without a native bulk copy primitive expose their single-file
//! read/write operations as a [`FileTransport`]; [`FileSyncEngine`] walks the
//! source tree and copies file by file. Failures are collected per file rather
//! than aborting the job, and a report's [`SyncReport::remaining`] paths can be
//! fed back into a new job to resume. Re-running a job against an already
//! synced destination simply rewrites the same bytes.

use crate::error::MissingResource;
use crate::RuntimeError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Single-file primitives of one side of a transfer.
#[async_trait]
pub trait FileTransport: Send + Sync {
    /// Paths of all regular files under `dir`, relative to it, `/`-separated.
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, RuntimeError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), RuntimeError>;
}

/// The host filesystem, addressed by plain paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFiles;

#[async_trait]
impl FileTransport for HostFiles {
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, RuntimeError> {
        let root = PathBuf::from(dir);
        let meta = tokio::fs::metadata(&root)
            .await
            .map_err(|e| RuntimeError::from_io(&e, MissingResource::Directory, dir))?;
        if !meta.is_dir() {
            return Err(RuntimeError::not_found(MissingResource::Directory, dir));
        }

        let mut files = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(current) = pending.pop() {
            let current_str = current.to_string_lossy().into_owned();
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .map_err(|e| RuntimeError::from_io(&e, MissingResource::Directory, &current_str))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| RuntimeError::from_io(&e, MissingResource::Directory, &current_str))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| RuntimeError::from_io(&e, MissingResource::File, &current_str))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file()
                    || (file_type.is_symlink()
                        && tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()))
                {
                    files.push(relative_path(&root, &path));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| RuntimeError::from_io(&e, MissingResource::File, path))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RuntimeError::from_io(&e, MissingResource::Directory, &parent.to_string_lossy())
            })?;
        }
        tokio::fs::write(path, data)
            .await
            .map_err(|e| RuntimeError::from_io(&e, MissingResource::File, path))
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a `/`-separated relative path onto a directory on either side.
/// An absolute `dir` keeps the result absolute, including the root itself.
pub fn join_path(dir: &str, rel: &str) -> String {
    let absolute = dir.starts_with('/');
    let dir = dir.trim_end_matches('/');
    match (dir.is_empty(), rel.is_empty()) {
        (true, _) if absolute => format!("/{rel}"),
        (true, _) => rel.to_owned(),
        (false, true) => dir.to_owned(),
        (false, false) => format!("{dir}/{rel}"),
    }
}

/// One directory transfer between two transports.
#[derive(Clone)]
pub struct SyncJob {
    pub id: String,
    pub source: Arc<dyn FileTransport>,
    pub source_dir: String,
    pub destination: Arc<dyn FileTransport>,
    pub destination_dir: String,
    /// Restrict the transfer to these relative paths.
    pub only: Option<Vec<String>>,
}

impl SyncJob {
    pub fn new(
        id: impl Into<String>,
        source: Arc<dyn FileTransport>,
        source_dir: impl Into<String>,
        destination: Arc<dyn FileTransport>,
        destination_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            source_dir: source_dir.into(),
            destination,
            destination_dir: destination_dir.into(),
            only: None,
        }
    }

    /// A copy of this job limited to the files `report` did not confirm.
    #[must_use]
    pub fn resume(&self, report: &SyncReport) -> Self {
        Self {
            only: Some(report.remaining()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub job_id: String,
    pub files_total: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub bytes_transferred: u64,
    pub current: String,
}

pub type ProgressHandler = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub path: String,
    pub error: RuntimeError,
}

/// Outcome of a sync job. `success` is true only if every file transferred.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub job_id: String,
    pub success: bool,
    pub transferred: Vec<String>,
    pub bytes_transferred: u64,
    pub errors: Vec<SyncFailure>,
}

impl SyncReport {
    /// Relative paths not confirmed transferred.
    pub fn remaining(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.errors.iter().map(|f| f.path.clone()).collect();
        paths.sort();
        paths
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_file_concurrency")]
    pub max_concurrent_files: usize,
    #[serde(default = "default_job_concurrency")]
    pub max_concurrent_jobs: usize,
}

fn default_file_concurrency() -> usize {
    4
}

fn default_job_concurrency() -> usize {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_file_concurrency(),
            max_concurrent_jobs: default_job_concurrency(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FileSyncEngine {
    config: SyncConfig,
    progress: Option<ProgressHandler>,
}

impl FileSyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, handler: ProgressHandler) -> Self {
        self.progress = Some(handler);
        self
    }

    /// Run one job. Only a failure to enumerate the source tree rejects the
    /// call; per-file failures are collected in the report.
    pub async fn sync(&self, job: &SyncJob) -> Result<SyncReport, RuntimeError> {
        let mut files = job.source.list_files(&job.source_dir).await?;
        if let Some(only) = &job.only {
            files.retain(|f| only.contains(f));
        }
        let files_total = files.len();
        debug!(
            "sync {}: {files_total} files {} -> {}",
            job.id, job.source_dir, job.destination_dir
        );

        let mut transfers = stream::iter(files.into_iter().map(|rel| {
            let source = Arc::clone(&job.source);
            let destination = Arc::clone(&job.destination);
            let src_path = join_path(&job.source_dir, &rel);
            let dst_path = join_path(&job.destination_dir, &rel);
            async move {
                let result = async {
                    let data = source.read_file(&src_path).await?;
                    destination.write_file(&dst_path, &data).await?;
                    Ok::<u64, RuntimeError>(data.len() as u64)
                }
                .await;
                (rel, result)
            }
        }))
        .buffer_unordered(self.config.max_concurrent_files.max(1));

        let mut report = SyncReport {
            job_id: job.id.clone(),
            success: true,
            transferred: Vec::new(),
            bytes_transferred: 0,
            errors: Vec::new(),
        };

        while let Some((rel, result)) = transfers.next().await {
            match result {
                Ok(bytes) => {
                    report.bytes_transferred += bytes;
                    report.transferred.push(rel.clone());
                }
                Err(error) => {
                    warn!("sync {}: {rel} failed: {error}", job.id);
                    report.errors.push(SyncFailure {
                        path: rel.clone(),
                        error,
                    });
                }
            }
            if let Some(handler) = &self.progress {
                handler(&SyncProgress {
                    job_id: job.id.clone(),
                    files_total,
                    files_done: report.transferred.len(),
                    files_failed: report.errors.len(),
                    bytes_transferred: report.bytes_transferred,
                    current: rel,
                });
            }
        }

        report.transferred.sort();
        report.success = report.errors.is_empty();
        Ok(report)
    }

    /// Run independent jobs with bounded concurrency. Results are returned in
    /// submission order.
    pub async fn sync_batch(&self, jobs: Vec<SyncJob>) -> Vec<Result<SyncReport, RuntimeError>> {
        stream::iter(jobs)
            .map(|job| async move { self.sync(&job).await })
            .buffered(self.config.max_concurrent_jobs.max(1))
            .collect()
            .await
    }
}
