//! Upload Queue
//!
//! Buffers mutation records and tracks their cumulative serialized size.
//! When admitting a record would reach the configured ceiling, the current
//! batch is flushed through the upload strategy first and the incoming
//! record starts the next batch. State is cleared only after a flush fully
//! succeeds, so a failed flush leaves the batch intact and the caller can
//! retry.
//!
//! ## Size accounting
//!
//! The gauge sums each record's independently serialized JSON length. The
//! combined envelope adds array and comma overhead that is deliberately not
//! counted: the remote ceiling leaves enough headroom that the original
//! contract's approximation is kept rather than corrected.
//!
//! Two variants: `PushQueue` (upserts and deletes) and `StreamQueue` (plus
//! partial updates). They are distinct types over the same gauge, so
//! reading a stream queue's batch as the push shape is a compile error.

use crate::batch::{PushBatch, StreamBatch};
use crate::config::{ConfigError, QueueConfig};
use crate::error::FeedError;
use crate::mutation::{Document, DocumentDelete, PartialUpdate};
use futures::future::BoxFuture;
use tracing::debug;

/// Capability interface queues flush through
///
/// Implementations:
/// - `ContainerRotator`: provision, upload, push, one container per flush
/// - recording strategies in tests
pub trait UploadStrategy<B>: Send + Sync {
    /// Deliver one batch; must fully complete before returning Ok
    fn upload<'a>(
        &'a self,
        batch: &'a B,
    ) -> BoxFuture<'a, Result<(), FeedError>>;
}

/// Byte gauge shared by both queue variants
#[derive(Debug, Clone)]
struct ByteGauge {
    current_size: usize,
    max_queue_size: usize,
}

impl ByteGauge {
    fn new(config: &QueueConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ByteGauge {
            current_size: 0,
            max_queue_size: config.max_queue_size,
        })
    }

    /// True when admitting a record of this size must flush first
    ///
    /// `>=`: a record landing exactly on the ceiling still flushes, so a
    /// stored batch only ever approaches the ceiling from below.
    fn needs_flush(&self, record_size: usize) -> bool {
        self.current_size + record_size >= self.max_queue_size
    }

    fn admit(&mut self, record_size: usize) {
        self.current_size += record_size;
    }

    fn reset(&mut self) {
        self.current_size = 0;
    }
}

// ============================================================================
// PushQueue - upserts and deletes
// ============================================================================

/// Upload queue for push sources
pub struct PushQueue<S: UploadStrategy<PushBatch>> {
    gauge: ByteGauge,
    batch: PushBatch,
    strategy: S,
}

impl<S: UploadStrategy<PushBatch>> PushQueue<S> {
    /// Build a queue; fails if the size budget is out of range
    pub fn new(config: &QueueConfig, strategy: S) -> Result<Self, ConfigError> {
        Ok(PushQueue {
            gauge: ByteGauge::new(config)?,
            batch: PushBatch::new(),
            strategy,
        })
    }

    /// Buffer an upsert, flushing the current batch first if the budget
    /// would be reached
    pub async fn add_document(&mut self, document: Document) -> Result<(), FeedError> {
        let size = document.serialized_len()?;
        self.make_room(size).await?;
        self.batch.add_or_update.push(document);
        self.gauge.admit(size);
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// Buffer a delete, flushing first if the budget would be reached
    pub async fn delete_document(&mut self, delete: DocumentDelete) -> Result<(), FeedError> {
        let size = delete.serialized_len()?;
        self.make_room(size).await?;
        self.batch.delete.push(delete);
        self.gauge.admit(size);
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// Flush the current batch through the strategy
    ///
    /// An empty batch is a no-op with zero network calls. State resets only
    /// after the strategy confirms delivery.
    pub async fn flush(&mut self) -> Result<(), FeedError> {
        if self.batch.is_empty() {
            debug!("flush skipped, queue is empty");
            return Ok(());
        }

        debug!(
            records = self.batch.record_count(),
            bytes = self.gauge.current_size,
            "flushing batch"
        );
        self.strategy.upload(&self.batch).await?;
        self.batch.clear();
        self.gauge.reset();
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// True iff no records are buffered
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Buffered size in bytes (sum of record serializations)
    pub fn current_size(&self) -> usize {
        self.gauge.current_size
    }

    /// The batch as it would flush right now
    pub fn batch(&self) -> &PushBatch {
        &self.batch
    }

    async fn make_room(&mut self, record_size: usize) -> Result<(), FeedError> {
        if self.gauge.needs_flush(record_size) {
            debug!(
                record_size,
                current_size = self.gauge.current_size,
                max_queue_size = self.gauge.max_queue_size,
                "size budget reached, flushing before append"
            );
            self.flush().await?;
        }
        Ok(())
    }

    /// TigerStyle: verify invariants hold after every mutation
    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        debug_assert!(
            self.batch.is_empty() == (self.gauge.current_size == 0),
            "Invariant violated: gauge must be zero exactly when the batch is empty"
        );
    }
}

// ============================================================================
// StreamQueue - upserts, deletes, and partial updates
// ============================================================================

/// Upload queue for stream sources
pub struct StreamQueue<S: UploadStrategy<StreamBatch>> {
    gauge: ByteGauge,
    batch: StreamBatch,
    strategy: S,
}

impl<S: UploadStrategy<StreamBatch>> StreamQueue<S> {
    /// Build a queue; fails if the size budget is out of range
    pub fn new(config: &QueueConfig, strategy: S) -> Result<Self, ConfigError> {
        Ok(StreamQueue {
            gauge: ByteGauge::new(config)?,
            batch: StreamBatch::new(),
            strategy,
        })
    }

    /// Buffer an upsert, flushing the current batch first if the budget
    /// would be reached
    pub async fn add_document(&mut self, document: Document) -> Result<(), FeedError> {
        let size = document.serialized_len()?;
        self.make_room(size).await?;
        self.batch.add_or_update.push(document);
        self.gauge.admit(size);
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// Buffer a delete, flushing first if the budget would be reached
    pub async fn delete_document(&mut self, delete: DocumentDelete) -> Result<(), FeedError> {
        let size = delete.serialized_len()?;
        self.make_room(size).await?;
        self.batch.delete.push(delete);
        self.gauge.admit(size);
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// Buffer a partial update, flushing first if the budget would be
    /// reached
    pub async fn add_partial_update(&mut self, update: PartialUpdate) -> Result<(), FeedError> {
        let size = update.serialized_len()?;
        self.make_room(size).await?;
        self.batch.partial_update.push(update);
        self.gauge.admit(size);
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// Flush the current batch through the strategy
    ///
    /// An empty batch is a no-op with zero network calls. State resets only
    /// after the strategy confirms delivery.
    pub async fn flush(&mut self) -> Result<(), FeedError> {
        if self.batch.is_empty() {
            debug!("flush skipped, queue is empty");
            return Ok(());
        }

        debug!(
            records = self.batch.record_count(),
            bytes = self.gauge.current_size,
            "flushing batch"
        );
        self.strategy.upload(&self.batch).await?;
        self.batch.clear();
        self.gauge.reset();
        #[cfg(debug_assertions)]
        self.verify_invariants();
        Ok(())
    }

    /// True iff no records are buffered
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Buffered size in bytes (sum of record serializations)
    pub fn current_size(&self) -> usize {
        self.gauge.current_size
    }

    /// The batch as it would flush right now
    pub fn batch(&self) -> &StreamBatch {
        &self.batch
    }

    async fn make_room(&mut self, record_size: usize) -> Result<(), FeedError> {
        if self.gauge.needs_flush(record_size) {
            debug!(
                record_size,
                current_size = self.gauge.current_size,
                max_queue_size = self.gauge.max_queue_size,
                "size budget reached, flushing before append"
            );
            self.flush().await?;
        }
        Ok(())
    }

    /// TigerStyle: verify invariants hold after every mutation
    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        debug_assert!(
            self.batch.is_empty() == (self.gauge.current_size == 0),
            "Invariant violated: gauge must be zero exactly when the batch is empty"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    /// Strategy that records every flushed batch and can fail on demand
    struct RecordingStrategy<B> {
        batches: Arc<Mutex<Vec<B>>>,
        fail_next: Arc<Mutex<bool>>,
    }

    impl<B> RecordingStrategy<B> {
        fn new() -> Self {
            RecordingStrategy {
                batches: Arc::new(Mutex::new(Vec::new())),
                fail_next: Arc::new(Mutex::new(false)),
            }
        }

        fn batches(&self) -> Vec<B>
        where
            B: Clone,
        {
            self.batches.lock().clone()
        }

        fn fail_next_upload(&self) {
            *self.fail_next.lock() = true;
        }
    }

    impl<B> Clone for RecordingStrategy<B> {
        fn clone(&self) -> Self {
            RecordingStrategy {
                batches: Arc::clone(&self.batches),
                fail_next: Arc::clone(&self.fail_next),
            }
        }
    }

    impl<B: Clone + Send + Sync> UploadStrategy<B> for RecordingStrategy<B> {
        fn upload<'a>(
            &'a self,
            batch: &'a B,
        ) -> BoxFuture<'a, Result<(), FeedError>> {
            Box::pin(async move {
                let mut fail = self.fail_next.lock();
                if *fail {
                    *fail = false;
                    return Err(FeedError::Transport(TransportError::Status {
                        status: 503,
                        body: "upload unavailable".to_string(),
                    }));
                }
                drop(fail);
                self.batches.lock().push(batch.clone());
                Ok(())
            })
        }
    }

    /// Document whose serialized JSON is exactly `target_len` bytes
    fn document_with_len(id: &str, target_len: usize) -> Document {
        let base = Document::new(id)
            .with_field("padding", json!(""))
            .serialized_len()
            .unwrap();
        assert!(base <= target_len, "target {} too small for id {}", target_len, id);
        Document::new(id).with_field("padding", json!("x".repeat(target_len - base)))
    }

    fn stream_queue(
        max_queue_size: usize,
    ) -> (
        StreamQueue<RecordingStrategy<StreamBatch>>,
        RecordingStrategy<StreamBatch>,
    ) {
        let strategy = RecordingStrategy::new();
        let queue = StreamQueue::new(
            &QueueConfig::with_max_queue_size(max_queue_size),
            strategy.clone(),
        )
        .unwrap();
        (queue, strategy)
    }

    #[test]
    fn test_document_with_len_is_exact() {
        let document = document_with_len("doc-1", 2000);
        assert_eq!(document.serialized_len().unwrap(), 2000);
    }

    #[test]
    fn test_out_of_range_budget_is_rejected() {
        let strategy: RecordingStrategy<StreamBatch> = RecordingStrategy::new();
        // The queue is not Debug, so unwrap_err cannot format the Ok arm.
        let err = match StreamQueue::new(&QueueConfig::with_max_queue_size(0), strategy) {
            Ok(_) => panic!("zero budget must be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, ConfigError::QueueSizeOutOfRange { given: 0 }));
    }

    #[tokio::test]
    async fn test_records_accumulate_below_budget() {
        let (mut queue, strategy) = stream_queue(5000);

        queue.add_document(document_with_len("doc-1", 2000)).await.unwrap();
        queue.add_document(document_with_len("doc-2", 2000)).await.unwrap();

        assert!(strategy.batches().is_empty());
        assert!(!queue.is_empty());
        assert_eq!(queue.current_size(), 4000);
    }

    #[tokio::test]
    async fn test_budget_flushes_before_append() {
        let (mut queue, strategy) = stream_queue(5000);
        let doc1 = document_with_len("doc-1", 2000);
        let doc2 = document_with_len("doc-2", 2000);
        let doc3 = document_with_len("doc-3", 2000);

        queue.add_document(doc1.clone()).await.unwrap();
        queue.add_document(doc2.clone()).await.unwrap();
        // 4000 + 2000 >= 5000: the first two flush, the third starts fresh.
        queue.add_document(doc3.clone()).await.unwrap();

        let batches = strategy.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].add_or_update, vec![doc1, doc2]);

        assert_eq!(queue.batch().add_or_update, vec![doc3]);
        assert_eq!(queue.current_size(), 2000);
    }

    #[tokio::test]
    async fn test_exact_ceiling_triggers_flush() {
        let (mut queue, strategy) = stream_queue(4000);

        queue.add_document(document_with_len("doc-1", 2000)).await.unwrap();
        // 2000 + 2000 == 4000 and the check is >=, so this flushes.
        queue.add_document(document_with_len("doc-2", 2000)).await.unwrap();

        let batches = strategy.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].record_count(), 1);
        assert_eq!(queue.current_size(), 2000);
    }

    #[tokio::test]
    async fn test_single_record_above_budget_is_admitted() {
        let (mut queue, strategy) = stream_queue(1000);

        // Nothing buffered to flush; the oversized record is buffered whole
        // and goes out alone on the next admission or manual flush.
        queue.add_document(document_with_len("doc-big", 3000)).await.unwrap();
        assert!(strategy.batches().is_empty());
        assert_eq!(queue.current_size(), 3000);

        queue.flush().await.unwrap();
        assert_eq!(strategy.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let (mut queue, strategy) = stream_queue(5000);

        queue.flush().await.unwrap();

        assert!(strategy.batches().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_resets_state() {
        let (mut queue, strategy) = stream_queue(5000);
        queue.add_document(document_with_len("doc-1", 500)).await.unwrap();
        queue
            .delete_document(DocumentDelete::new("doc-2", false))
            .await
            .unwrap();

        queue.flush().await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.current_size(), 0);
        assert_eq!(strategy.batches().len(), 1);
        assert_eq!(strategy.batches()[0].record_count(), 2);

        // The next record starts a fresh batch.
        queue.add_document(document_with_len("doc-3", 500)).await.unwrap();
        assert_eq!(queue.batch().record_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch_intact() {
        let (mut queue, strategy) = stream_queue(5000);
        queue.add_document(document_with_len("doc-1", 500)).await.unwrap();
        strategy.fail_next_upload();

        let err = queue.flush().await.unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));

        // Nothing delivered, nothing lost.
        assert!(strategy.batches().is_empty());
        assert!(!queue.is_empty());
        assert_eq!(queue.current_size(), 500);

        // Retry succeeds and only then resets.
        queue.flush().await.unwrap();
        assert_eq!(strategy.batches().len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_auto_flush_does_not_append() {
        let (mut queue, strategy) = stream_queue(1000);
        queue.add_document(document_with_len("doc-1", 600)).await.unwrap();
        strategy.fail_next_upload();

        let err = queue
            .add_document(document_with_len("doc-2", 600))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));

        // The incoming record was never admitted; the old batch is intact.
        assert_eq!(queue.batch().add_or_update.len(), 1);
        assert_eq!(queue.batch().add_or_update[0].document_id, "doc-1");
        assert_eq!(queue.current_size(), 600);
    }

    #[tokio::test]
    async fn test_all_record_kinds_share_the_gauge() {
        let (mut queue, strategy) = stream_queue(100_000);
        let update = PartialUpdate::new(
            "doc-3",
            crate::mutation::UpdateOperator::ArrayAppend,
            "tags",
            json!(["fresh"]),
        )
        .unwrap();

        let expected = document_with_len("doc-1", 300).serialized_len().unwrap()
            + DocumentDelete::new("doc-2", true).serialized_len().unwrap()
            + update.serialized_len().unwrap();

        queue.add_document(document_with_len("doc-1", 300)).await.unwrap();
        queue
            .delete_document(DocumentDelete::new("doc-2", true))
            .await
            .unwrap();
        queue.add_partial_update(update).await.unwrap();

        assert_eq!(queue.current_size(), expected);

        queue.flush().await.unwrap();
        let batches = strategy.batches();
        assert_eq!(batches[0].add_or_update.len(), 1);
        assert_eq!(batches[0].delete.len(), 1);
        assert_eq!(batches[0].partial_update.len(), 1);
    }

    #[tokio::test]
    async fn test_push_queue_buffers_upserts_and_deletes() {
        let strategy: RecordingStrategy<PushBatch> = RecordingStrategy::new();
        let mut queue =
            PushQueue::new(&QueueConfig::with_max_queue_size(5000), strategy.clone()).unwrap();

        queue.add_document(document_with_len("doc-1", 400)).await.unwrap();
        queue
            .delete_document(DocumentDelete::new("doc-2", false))
            .await
            .unwrap();
        queue.flush().await.unwrap();

        let batches = strategy.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].add_or_update[0].document_id, "doc-1");
        assert_eq!(batches[0].delete[0].document_id, "doc-2");
    }
}
