//! Stream Session State Machine
//!
//! Wraps a stream queue with the open/accumulate/close lifecycle. The first
//! mutation lazily opens a session against the control plane; `close()`
//! flushes whatever remains and then releases the handle. Closing before
//! any mutation arrived is a caller error, and a session is single-use:
//! once closed, every further operation is rejected.
//!
//! Failure keeps the machine retryable. A failed open leaves the session
//! unopened (the next mutation tries again); a failed flush or close leaves
//! it open with the batch intact, so `close()` can simply be called again.

use crate::config::{ConfigError, QueueConfig};
use crate::control::{ControlPlane, StreamHandle};
use crate::error::FeedError;
use crate::mutation::{Document, DocumentDelete, PartialUpdate};
use crate::queue::StreamQueue;
use crate::rotation::ContainerRotator;
use tracing::debug;

/// Lifecycle state of a stream session
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    /// No mutation has arrived yet; no remote handle held
    Unopened,
    /// Opened lazily by the first mutation
    Open(StreamHandle),
    /// Terminal; the session cannot be reused
    Closed,
}

/// One open/accumulate/close publishing cycle against a stream source
pub struct StreamSession<C: ControlPlane + Clone> {
    control: C,
    source_id: String,
    queue: StreamQueue<ContainerRotator<C>>,
    state: SessionState,
}

impl<C: ControlPlane + Clone> StreamSession<C> {
    /// Build a session; fails if the queue size budget is out of range
    pub fn new(
        control: C,
        source_id: impl Into<String>,
        config: &QueueConfig,
    ) -> Result<Self, ConfigError> {
        let source_id = source_id.into();
        let rotator = ContainerRotator::new(control.clone(), source_id.clone());
        let queue = StreamQueue::new(config, rotator)?;
        Ok(StreamSession {
            control,
            source_id,
            queue,
            state: SessionState::Unopened,
        })
    }

    /// Buffer an upsert, opening the session first if needed
    pub async fn add_document(&mut self, document: Document) -> Result<(), FeedError> {
        self.ensure_open().await?;
        self.queue.add_document(document).await
    }

    /// Buffer a delete, opening the session first if needed
    pub async fn delete_document(&mut self, delete: DocumentDelete) -> Result<(), FeedError> {
        self.ensure_open().await?;
        self.queue.delete_document(delete).await
    }

    /// Buffer a partial update, opening the session first if needed
    pub async fn add_partial_update(&mut self, update: PartialUpdate) -> Result<(), FeedError> {
        self.ensure_open().await?;
        self.queue.add_partial_update(update).await
    }

    /// Flush any remainder, then close the remote session
    ///
    /// Fails with `NoOpenSession` if no mutation ever opened the session.
    /// On flush or close failure the state stays `Open`, so `close()` can
    /// be retried.
    pub async fn close(&mut self) -> Result<(), FeedError> {
        let handle = match &self.state {
            SessionState::Open(handle) => handle.clone(),
            SessionState::Unopened | SessionState::Closed => {
                return Err(FeedError::NoOpenSession)
            }
        };

        self.queue.flush().await?;
        self.control
            .close_stream_session(&self.source_id, &handle)
            .await?;
        self.state = SessionState::Closed;
        debug!(source_id = %self.source_id, handle = %handle, "stream session closed");
        Ok(())
    }

    /// True iff no mutation is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True while the session holds a remote handle
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open(_))
    }

    async fn ensure_open(&mut self) -> Result<(), FeedError> {
        match &self.state {
            SessionState::Open(_) => Ok(()),
            SessionState::Closed => Err(FeedError::NoOpenSession),
            SessionState::Unopened => {
                let handle = self.control.open_stream_session(&self.source_id).await?;
                debug!(source_id = %self.source_id, handle = %handle, "stream session opened");
                self.state = SessionState::Open(handle);
                Ok(())
            }
        }
    }
}
