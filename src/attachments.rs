use std::sync::Arc;
use tracing::info;

use crate::errors::SyncResult;
use crate::executor::RequestExecutor;
use crate::remote::BlobStore;

/// Default lifetime of a signed download link
pub const DEFAULT_URL_TTL_SECS: u64 = 3_600;

/// File uploads and signed download links, routed through the executor
#[derive(Clone)]
pub struct AttachmentService {
    executor: RequestExecutor,
    blobs: Arc<dyn BlobStore>,
    bucket: String,
}

impl AttachmentService {
    pub fn new(executor: RequestExecutor, blobs: Arc<dyn BlobStore>, bucket: impl Into<String>) -> Self {
        Self {
            executor,
            blobs,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Store `bytes` at `path` and return the stored object path
    pub async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> SyncResult<String> {
        let size = bytes.len();
        let stored = self
            .executor
            .execute_default("upload_attachment", || {
                self.blobs.upload(&self.bucket, path, bytes.clone(), content_type)
            })
            .await?;
        info!(bucket = %self.bucket, path = %stored, size, "Attachment uploaded");
        Ok(stored)
    }

    pub async fn signed_url(&self, path: &str, expires_in_secs: u64) -> SyncResult<String> {
        self.executor
            .execute_default("sign_attachment_url", || {
                self.blobs.signed_url(&self.bucket, path, expires_in_secs)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RemoteError, SyncError};
    use crate::executor::RetryPolicy;
    use crate::observability::SyncMetrics;
    use crate::remote::MockBlobStore;
    use std::time::Duration;

    fn executor() -> RequestExecutor {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(10))
            .without_jitter();
        RequestExecutor::new(policy, Arc::new(SyncMetrics::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retries_transient_failure() {
        let mut blobs = MockBlobStore::new();
        let mut seq = mockall::Sequence::new();
        blobs
            .expect_upload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Err(RemoteError::from_status(503, "busy")));
        blobs
            .expect_upload()
            .withf(|bucket: &str, path: &str, bytes: &Vec<u8>, content_type: &str| {
                bucket == "task-files"
                    && path == "42/spec.pdf"
                    && bytes.as_slice() == b"%PDF"
                    && content_type == "application/pdf"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, path, _, _| Ok(path.to_string()));

        let service = AttachmentService::new(executor(), Arc::new(blobs), "task-files");
        let stored = service
            .upload("42/spec.pdf", b"%PDF".to_vec(), "application/pdf")
            .await
            .unwrap();
        assert_eq!(stored, "42/spec.pdf");
    }

    #[tokio::test]
    async fn test_missing_object_is_not_retried() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_signed_url()
            .times(1)
            .returning(|_, path, _| Err(RemoteError::NotFound(path.to_string())));

        let service = AttachmentService::new(executor(), Arc::new(blobs), "task-files");
        let err = service.signed_url("missing.png", 60).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::NotFound(_))));
    }
}
