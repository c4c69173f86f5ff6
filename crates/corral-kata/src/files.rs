//! Single-file primitives synthesized over exec, since the pod API has no
//! file transfer of its own.

use crate::api::PodApi;
use crate::exec::{self, Captured};
use crate::shell::{absolute, parent, quote};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use corral_runtime::{FileTransport, InputStream, MissingResource, RuntimeError};
use std::sync::Arc;
use std::time::Duration;

fn missing(captured: &Captured) -> bool {
    captured.stderr_text().contains("No such file or directory")
}

/// File access to one runtime pod. Relative paths resolve against the
/// configured working directory.
#[derive(Clone)]
pub struct PodFiles {
    api: Arc<dyn PodApi>,
    pod: String,
    workdir: String,
    timeout: Duration,
}

impl PodFiles {
    pub fn new(api: Arc<dyn PodApi>, pod: &str, workdir: &str, timeout: Duration) -> Self {
        Self {
            api,
            pod: pod.to_owned(),
            workdir: workdir.to_owned(),
            timeout,
        }
    }

    pub fn resolve(&self, path: &str) -> String {
        absolute(&self.workdir, path)
    }

    async fn run(
        &self,
        script: String,
        stdin: Option<InputStream>,
        operation: &str,
    ) -> Result<Captured, RuntimeError> {
        exec::run(
            self.api.as_ref(),
            &self.pod,
            script,
            stdin,
            operation,
            self.timeout,
        )
        .await
    }
}

#[async_trait]
impl FileTransport for PodFiles {
    async fn list_files(&self, dir: &str) -> Result<Vec<String>, RuntimeError> {
        let dir = self.resolve(dir);
        let captured = self
            .run(format!("find {} -type f", quote(&dir)), None, "list_files")
            .await?;
        if captured.exit_code != 0 {
            if missing(&captured) {
                return Err(RuntimeError::not_found(MissingResource::Directory, &dir)
                    .with_context("path", &dir));
            }
            return Err(RuntimeError::execution(
                format!("cannot list {dir}: {}", captured.stderr_text()),
                Some(captured.exit_code),
            )
            .with_context("path", &dir));
        }

        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut files: Vec<String> = String::from_utf8_lossy(&captured.stdout)
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .map(str::to_owned)
            .collect();
        files.sort();
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let path = self.resolve(path);
        let captured = self
            .run(format!("cat -- {}", quote(&path)), None, "read_file")
            .await?;
        match captured.exit_code {
            0 => Ok(captured.stdout),
            _ if missing(&captured) => {
                Err(RuntimeError::not_found(MissingResource::File, &path).with_context("path", &path))
            }
            code => Err(RuntimeError::execution(
                format!("cannot read {path}: {}", captured.stderr_text()),
                Some(code),
            )
            .with_context("path", &path)),
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let path = self.resolve(path);
        let script = format!(
            "mkdir -p -- {} && base64 -d > {}",
            quote(parent(&path)),
            quote(&path)
        );
        let payload: InputStream = Box::new(std::io::Cursor::new(STANDARD.encode(data).into_bytes()));
        let captured = self.run(script, Some(payload), "write_file").await?;
        if captured.exit_code != 0 {
            return Err(RuntimeError::execution(
                format!("cannot write {path}: {}", captured.stderr_text()),
                Some(captured.exit_code),
            )
            .with_context("path", &path)
            .with_context("bytes", data.len()));
        }
        Ok(())
    }
}
