//! Container Rotation Workflow
//!
//! The upload strategy behind both queue variants. Every flush provisions a
//! brand-new container, uploads the serialized envelope to it, then pushes
//! the container at the target source, three strictly sequential steps.
//! Containers are never reused: a failed flush abandons its container and
//! the retry starts over with a fresh one, so a container id never carries
//! two payloads.

use crate::batch::{PushBatch, StreamBatch};
use crate::control::ControlPlane;
use crate::error::FeedError;
use crate::queue::UploadStrategy;
use futures::future::BoxFuture;
use tracing::debug;

/// Upload strategy that rotates one container per flush
///
/// Implements `UploadStrategy` for both batch shapes; the push and stream
/// workflows differ only in the envelope they serialize.
pub struct ContainerRotator<C: ControlPlane> {
    control: C,
    source_id: String,
}

impl<C: ControlPlane> ContainerRotator<C> {
    pub fn new(control: C, source_id: impl Into<String>) -> Self {
        ContainerRotator {
            control,
            source_id: source_id.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Run provision, upload, push for one serialized envelope
    async fn rotate(&self, payload: Vec<u8>, record_count: usize) -> Result<(), FeedError> {
        let container = self.control.provision_container().await?;
        debug!(
            container_id = %container.container_id,
            records = record_count,
            bytes = payload.len(),
            "provisioned container for batch"
        );

        self.control
            .upload_content(
                &container.upload_target,
                &container.required_headers,
                &payload,
            )
            .await?;

        self.control
            .push_container(&self.source_id, &container.container_id)
            .await?;
        debug!(
            container_id = %container.container_id,
            source_id = %self.source_id,
            "container pushed"
        );

        Ok(())
    }
}

impl<C: ControlPlane + Clone> Clone for ContainerRotator<C> {
    fn clone(&self) -> Self {
        ContainerRotator {
            control: self.control.clone(),
            source_id: self.source_id.clone(),
        }
    }
}

impl<C: ControlPlane> UploadStrategy<PushBatch> for ContainerRotator<C> {
    fn upload<'a>(
        &'a self,
        batch: &'a PushBatch,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let payload = batch.to_envelope()?;
            self.rotate(payload, batch.record_count()).await
        })
    }
}

impl<C: ControlPlane> UploadStrategy<StreamBatch> for ContainerRotator<C> {
    fn upload<'a>(
        &'a self,
        batch: &'a StreamBatch,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let payload = batch.to_envelope()?;
            self.rotate(payload, batch.record_count()).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Container, ControlCall, InMemoryControlPlane, StreamHandle};
    use crate::mutation::{Document, DocumentDelete};
    use crate::transport::TransportError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Control plane whose push fails a set number of times, then recovers
    #[derive(Clone)]
    struct FlakyPush {
        inner: InMemoryControlPlane,
        failures_left: Arc<AtomicU32>,
    }

    impl FlakyPush {
        fn new(inner: InMemoryControlPlane, failures: u32) -> Self {
            FlakyPush {
                inner,
                failures_left: Arc::new(AtomicU32::new(failures)),
            }
        }
    }

    impl ControlPlane for FlakyPush {
        fn provision_container<'a>(
            &'a self,
        ) -> BoxFuture<'a, Result<Container, FeedError>> {
            self.inner.provision_container()
        }

        fn upload_content<'a>(
            &'a self,
            upload_target: &'a str,
            required_headers: &'a HashMap<String, String>,
            json_payload: &'a [u8],
        ) -> BoxFuture<'a, Result<(), FeedError>> {
            self.inner
                .upload_content(upload_target, required_headers, json_payload)
        }

        fn push_container<'a>(
            &'a self,
            source_id: &'a str,
            container_id: &'a str,
        ) -> BoxFuture<'a, Result<(), FeedError>> {
            Box::pin(async move {
                if self.failures_left.load(Ordering::SeqCst) > 0 {
                    self.failures_left.fetch_sub(1, Ordering::SeqCst);
                    return Err(FeedError::Transport(TransportError::Status {
                        status: 503,
                        body: "push unavailable".to_string(),
                    }));
                }
                self.inner.push_container(source_id, container_id).await
            })
        }

        fn open_stream_session<'a>(
            &'a self,
            source_id: &'a str,
        ) -> BoxFuture<'a, Result<StreamHandle, FeedError>> {
            self.inner.open_stream_session(source_id)
        }

        fn close_stream_session<'a>(
            &'a self,
            source_id: &'a str,
            handle: &'a StreamHandle,
        ) -> BoxFuture<'a, Result<(), FeedError>> {
            self.inner.close_stream_session(source_id, handle)
        }
    }

    fn stream_batch(ids: &[&str]) -> StreamBatch {
        let mut batch = StreamBatch::new();
        for id in ids {
            batch.add_or_update.push(Document::new(*id));
        }
        batch
    }

    #[tokio::test]
    async fn test_flush_runs_create_upload_push_in_order() {
        let plane = InMemoryControlPlane::new();
        let rotator = ContainerRotator::new(plane.clone(), "src-1");
        let batch = stream_batch(&["doc-1", "doc-2"]);

        UploadStrategy::<StreamBatch>::upload(&rotator, &batch)
            .await
            .unwrap();

        let calls = plane.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], ControlCall::Provision { .. }));
        assert!(matches!(calls[1], ControlCall::Upload { .. }));
        assert!(matches!(
            &calls[2],
            ControlCall::Push { source_id, .. } if source_id == "src-1"
        ));

        // The uploaded payload is the batch envelope.
        let payloads = plane.pushed_payloads();
        let parsed: StreamBatch = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(parsed, batch);
    }

    #[tokio::test]
    async fn test_each_flush_gets_a_fresh_container() {
        let plane = InMemoryControlPlane::new();
        let rotator = ContainerRotator::new(plane.clone(), "src-1");

        for id in ["doc-0", "doc-1", "doc-2"] {
            let batch = stream_batch(&[id]);
            UploadStrategy::<StreamBatch>::upload(&rotator, &batch)
                .await
                .unwrap();
        }

        let pushed = plane.pushed_container_ids();
        assert_eq!(pushed.len(), 3);
        let distinct: std::collections::HashSet<_> = pushed.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_push_abandons_container() {
        let plane = InMemoryControlPlane::new();
        let flaky = FlakyPush::new(plane.clone(), 1);
        let rotator = ContainerRotator::new(flaky, "src-1");
        let batch = stream_batch(&["doc-1"]);

        let err = UploadStrategy::<StreamBatch>::upload(&rotator, &batch)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));

        // The first container was provisioned and written but never pushed.
        assert_eq!(plane.provisioned_count(), 1);
        assert_eq!(plane.pushed_count(), 0);

        // The retry rotates to a fresh container instead of reusing it.
        UploadStrategy::<StreamBatch>::upload(&rotator, &batch)
            .await
            .unwrap();

        assert_eq!(plane.provisioned_count(), 2);
        assert_eq!(plane.pushed_container_ids(), vec!["container-000001"]);
    }

    #[tokio::test]
    async fn test_push_batch_envelope_has_no_partial_updates() {
        let plane = InMemoryControlPlane::new();
        let rotator = ContainerRotator::new(plane.clone(), "src-1");

        let mut batch = PushBatch::new();
        batch.add_or_update.push(Document::new("doc-1"));
        batch.delete.push(DocumentDelete::new("doc-2", false));

        UploadStrategy::<PushBatch>::upload(&rotator, &batch)
            .await
            .unwrap();

        let payloads = plane.pushed_payloads();
        let value: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert!(value.get("partialUpdate").is_none());
        assert_eq!(value["addOrUpdate"].as_array().unwrap().len(), 1);
        assert_eq!(value["delete"].as_array().unwrap().len(), 1);
    }
}
