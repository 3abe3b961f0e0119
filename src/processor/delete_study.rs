//! Built-in processor: delete a study's files from disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{ItemProcessor, Proxy};
use crate::error::Result;
use crate::model::{FailureType, WorkItem};

/// Payload of a `DeleteStudy` item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteStudyRequest {
    pub study_path: PathBuf,
}

/// Deletes every file in the study directory, one checkpoint per file, then
/// the directory itself.
///
/// Resumable: a postponed or retried item only sees the files still present,
/// and `items_processed` keeps counting from where the last attempt stopped.
pub struct DeleteStudyProcessor {
    request: DeleteStudyRequest,
}

impl DeleteStudyProcessor {
    pub const WORK_TYPE: &'static str = "DeleteStudy";

    pub fn new(request: DeleteStudyRequest) -> Self {
        Self { request }
    }

    /// Registry factory. A malformed payload is rejected here, before any
    /// work starts.
    pub fn factory(item: &WorkItem) -> Result<Box<dyn ItemProcessor>> {
        let request: DeleteStudyRequest = serde_json::from_value(item.payload.clone())?;
        Ok(Box::new(Self::new(request)))
    }
}

#[async_trait]
impl ItemProcessor for DeleteStudyProcessor {
    async fn process(&mut self, proxy: &mut Proxy) -> Result<()> {
        if proxy.checkpoint().await? {
            return Ok(());
        }

        let dir = self.request.study_path.as_path();
        let files = match list_files(dir).await {
            Ok(files) => files,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %dir.display(), "study directory already gone");
                return proxy.complete().await;
            }
            Err(e) => return Err(e.into()),
        };

        {
            let progress = proxy.progress_mut();
            progress.total_items = progress.items_processed + files.len() as u64;
            progress.items_failed = 0;
            progress.status_details = format!("deleting {}", dir.display());
        }
        proxy.update_progress().await?;

        for file in files {
            if proxy.checkpoint().await? {
                return Ok(());
            }
            match tokio::fs::remove_file(&file).await {
                Ok(()) => proxy.progress_mut().items_processed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    proxy.progress_mut().items_processed += 1
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "failed to delete file");
                    proxy.progress_mut().items_failed += 1;
                }
            }
            proxy.update_progress().await?;
        }

        let failed = proxy.item().progress.items_failed;
        if failed > 0 {
            return proxy
                .fail(
                    format!("{failed} file(s) could not be deleted from {}", dir.display()),
                    FailureType::NonFatal,
                )
                .await;
        }

        match tokio::fs::remove_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return proxy
                    .fail(
                        format!("cannot remove {}: {e}", dir.display()),
                        FailureType::NonFatal,
                    )
                    .await;
            }
        }
        proxy.progress_mut().status_details.clear();
        proxy.complete().await
    }
}

/// Regular files directly under `dir`, sorted for a stable deletion order.
async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkItem;
    use chrono::Utc;

    #[test]
    fn factory_rejects_malformed_payload() {
        let item = NewWorkItem::new(DeleteStudyProcessor::WORK_TYPE)
            .payload(serde_json::json!({ "wrong": 1 }))
            .into_item(Utc::now());
        assert!(DeleteStudyProcessor::factory(&item).is_err());
    }

    #[tokio::test]
    async fn list_files_skips_subdirectories() {
        let dir = std::env::temp_dir().join(format!("workq-list-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(dir.join("nested")).await.unwrap();
        tokio::fs::write(dir.join("b.dcm"), b"b").await.unwrap();
        tokio::fs::write(dir.join("a.dcm"), b"a").await.unwrap();

        let files = list_files(&dir).await.unwrap();
        assert_eq!(files, vec![dir.join("a.dcm"), dir.join("b.dcm")]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
