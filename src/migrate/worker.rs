use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;

use super::error::TransferError;
use super::paths::PathLayout;
use super::tracker::TransferTask;
use crate::destination::{ObjectStore, ObjectWriter};
use crate::origin::{ByteStream, OriginStore};

/// Copies one origin object to its destination key.
pub struct TransferWorker {
    origin: Arc<dyn OriginStore>,
    destination: Arc<dyn ObjectStore>,
    layout: PathLayout,
    chunk_size: usize,
    timeout: Duration,
}

impl TransferWorker {
    pub fn new(
        origin: Arc<dyn OriginStore>,
        destination: Arc<dyn ObjectStore>,
        layout: PathLayout,
        chunk_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            origin,
            destination,
            layout,
            chunk_size: chunk_size.max(1),
            timeout,
        }
    }

    pub fn bucket(&self) -> &str {
        self.destination.bucket()
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    /// One attempt, bounded by the transfer timeout. Returns bytes written.
    ///
    /// On timeout the copy future is dropped mid-flight, which drops the
    /// writer and discards the partial upload.
    pub async fn execute(&self, task: &TransferTask) -> Result<u64, TransferError> {
        let key = self.layout.destination_key(&task.source)?;
        match tokio::time::timeout(self.timeout, self.copy(&task.source, &key)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout {
                path: task.source.clone(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn copy(&self, source: &str, key: &str) -> Result<u64, TransferError> {
        let mut stream = self
            .origin
            .open_read(source)
            .await
            .map_err(|e| TransferError::Origin {
                path: source.to_string(),
                source: e,
            })?;
        let mut writer = self
            .destination
            .create_writer(key)
            .await
            .map_err(|e| TransferError::Destination {
                key: key.to_string(),
                source: e,
            })?;

        match self.pump(&mut stream, &mut writer, source, key).await {
            Ok(()) => writer
                .finish()
                .await
                .map_err(|e| TransferError::Destination {
                    key: key.to_string(),
                    source: e,
                }),
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    tracing::warn!(key = %key, "Failed to discard partial object: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Re-chunk the origin body into fixed-size pieces; only the last one may
    /// be shorter.
    async fn pump(
        &self,
        stream: &mut ByteStream,
        writer: &mut Box<dyn ObjectWriter>,
        source: &str,
        key: &str,
    ) -> Result<(), TransferError> {
        let mut buffer = BytesMut::with_capacity(self.chunk_size);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::Origin {
                path: source.to_string(),
                source: e,
            })?;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.chunk_size {
                let part = buffer.split_to(self.chunk_size).freeze();
                writer
                    .write_chunk(part)
                    .await
                    .map_err(|e| TransferError::Destination {
                        key: key.to_string(),
                        source: e,
                    })?;
            }
        }

        if !buffer.is_empty() {
            writer
                .write_chunk(buffer.freeze())
                .await
                .map_err(|e| TransferError::Destination {
                    key: key.to_string(),
                    source: e,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::paths::AssetId;
    use crate::migrate::testing::{FakeOrigin, MemoryStore, ReadFailure};

    fn worker(origin: FakeOrigin, store: &MemoryStore, chunk_size: usize) -> TransferWorker {
        TransferWorker::new(
            Arc::new(origin),
            Arc::new(store.clone()),
            PathLayout::new("/r", "test", "https://cdn.example.com"),
            chunk_size,
            Duration::from_secs(5),
        )
    }

    fn task(source: &str) -> TransferTask {
        TransferTask::new(source, AssetId::new("v1"), 0)
    }

    #[tokio::test]
    async fn test_copies_in_fixed_chunks() {
        let body = "0123456789abcdefghijklmno";
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", body)]);
        let store = MemoryStore::new();
        let w = worker(origin, &store, 10);

        let written = w.execute(&task("/r/v1/a_1.mp4")).await.unwrap();
        assert_eq!(written, 25);
        assert_eq!(store.object("test/v1/a_1.mp4").unwrap(), body.as_bytes());
        assert_eq!(store.chunk_sizes("test/v1/a_1.mp4"), vec![10, 10, 5]);
        assert_eq!(store.active(), 0);
    }

    #[tokio::test]
    async fn test_empty_object() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "")]);
        let store = MemoryStore::new();
        let w = worker(origin, &store, 10);

        assert_eq!(w.execute(&task("/r/v1/a_1.mp4")).await.unwrap(), 0);
        assert_eq!(store.object("test/v1/a_1.mp4").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_discards_partial_object() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "abcdefgh")]);
        origin.fail_reads("/r/v1/a_1.mp4", ReadFailure::MidStream);
        let store = MemoryStore::new();
        let w = worker(origin, &store, 4);

        let err = w.execute(&task("/r/v1/a_1.mp4")).await.unwrap_err();
        assert!(matches!(err, TransferError::Origin { .. }));
        assert!(err.is_retryable());
        assert!(store.was_aborted("test/v1/a_1.mp4"));
        assert_eq!(store.object("test/v1/a_1.mp4"), None);
        assert_eq!(store.active(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "x")]);
        origin.fail_reads("/r/v1/a_1.mp4", ReadFailure::Missing);
        let store = MemoryStore::new();
        let w = worker(origin, &store, 4);

        let err = w.execute(&task("/r/v1/a_1.mp4")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_source_outside_root_is_layout_error() {
        let origin = FakeOrigin::new([("/elsewhere/v1/a_1.mp4", "x")]);
        let store = MemoryStore::new();
        let w = worker(origin, &store, 4);

        let err = w.execute(&task("/elsewhere/v1/a_1.mp4")).await.unwrap_err();
        assert!(matches!(err, TransferError::Layout(_)));
    }

    #[tokio::test]
    async fn test_timeout_drops_writer_without_publishing() {
        let origin = FakeOrigin::new([("/r/v1/a_1.mp4", "abc")]);
        let store = MemoryStore::new().with_finish_delay(Duration::from_millis(500));
        let w = TransferWorker::new(
            Arc::new(origin),
            Arc::new(store.clone()),
            PathLayout::new("/r", "test", "https://cdn.example.com"),
            4,
            Duration::from_millis(20),
        );

        let err = w.execute(&task("/r/v1/a_1.mp4")).await.unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.object("test/v1/a_1.mp4"), None);
        assert_eq!(store.active(), 0);
    }
}
