//! Control Plane Interface
//!
//! The five remote operations the feed client consumes, behind a trait so
//! tests can run against an in-process fake:
//!
//! - provision a fresh upload container
//! - upload a serialized batch payload to a container's upload target
//! - push an uploaded container at a source
//! - open a stream session
//! - close a stream session
//!
//! `HttpControlPlane` is the REST implementation over the retrying
//! transport. `InMemoryControlPlane` records an ordered call log and
//! enforces the container lifecycle (write-once, upload-before-push), so
//! tests can assert rotation behavior without a server.

use crate::clock::{Clock, ProductionClock};
use crate::error::FeedError;
use crate::transport::{
    ApiRequest, BackoffOptions, HttpExecutor, HttpMethod, ReqwestExecutor, RetryingTransport,
    TransportError,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Wire types
// ============================================================================

/// A provisioned upload container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Opaque id the push call references
    pub container_id: String,
    /// Where the batch payload is uploaded
    pub upload_target: String,
    /// Headers the upload target requires, applied on top of the defaults
    #[serde(default)]
    pub required_headers: HashMap<String, String>,
}

/// Handle for an open stream session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub String);

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire shape of the open-session response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenSessionResponse {
    session_handle: String,
}

// ============================================================================
// Trait
// ============================================================================

/// Remote control plane operations
///
/// Implementations authenticate and negotiate JSON themselves; callers see
/// `FeedError` with the transport taxonomy preserved inside.
pub trait ControlPlane: Send + Sync + 'static {
    /// Provision a fresh upload container
    fn provision_container<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Container, FeedError>>;

    /// Upload a serialized batch payload to a container's upload target
    fn upload_content<'a>(
        &'a self,
        upload_target: &'a str,
        required_headers: &'a HashMap<String, String>,
        json_payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FeedError>>;

    /// Associate an uploaded container with a source
    fn push_container<'a>(
        &'a self,
        source_id: &'a str,
        container_id: &'a str,
    ) -> BoxFuture<'a, Result<(), FeedError>>;

    /// Open a stream session against a source
    fn open_stream_session<'a>(
        &'a self,
        source_id: &'a str,
    ) -> BoxFuture<'a, Result<StreamHandle, FeedError>>;

    /// Close a stream session
    fn close_stream_session<'a>(
        &'a self,
        source_id: &'a str,
        handle: &'a StreamHandle,
    ) -> BoxFuture<'a, Result<(), FeedError>>;
}

// ============================================================================
// HttpControlPlane - REST implementation
// ============================================================================

/// REST control plane over the retrying transport
pub struct HttpControlPlane<E: HttpExecutor = ReqwestExecutor, C: Clock = ProductionClock> {
    transport: Arc<RetryingTransport<E, C>>,
    base_url: String,
    api_key: String,
}

impl HttpControlPlane {
    /// Production control plane over reqwest
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        backoff: BackoffOptions,
    ) -> Self {
        Self::with_transport(RetryingTransport::new(backoff), base_url, api_key)
    }
}

impl<E: HttpExecutor, C: Clock> HttpControlPlane<E, C> {
    /// Control plane over an explicit transport (tests, simulations)
    pub fn with_transport(
        transport: RetryingTransport<E, C>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        HttpControlPlane {
            transport: Arc::new(transport),
            base_url,
            api_key: api_key.into(),
        }
    }

    /// Request carrying the headers every call sends
    fn base_request(&self, method: HttpMethod, url: String) -> ApiRequest {
        ApiRequest::new(method, url)
            .with_header("authorization", format!("Bearer {}", self.api_key))
            .with_header("content-type", "application/json")
            .with_header("accept", "application/json")
    }
}

impl<E: HttpExecutor, C: Clock> Clone for HttpControlPlane<E, C> {
    fn clone(&self) -> Self {
        HttpControlPlane {
            transport: Arc::clone(&self.transport),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

impl<E: HttpExecutor, C: Clock> ControlPlane for HttpControlPlane<E, C> {
    fn provision_container<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Container, FeedError>> {
        Box::pin(async move {
            let url = format!("{}/v1/containers", self.base_url);
            let request = self
                .base_request(HttpMethod::Post, url)
                .with_body(b"{}".to_vec());

            let response = self.transport.send(&request).await?;
            let container: Container = response.json()?;
            debug!(container_id = %container.container_id, "provisioned container");
            Ok(container)
        })
    }

    fn upload_content<'a>(
        &'a self,
        upload_target: &'a str,
        required_headers: &'a HashMap<String, String>,
        json_payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let mut request = self
                .base_request(HttpMethod::Put, upload_target.to_string())
                .with_body(json_payload.to_vec());
            for (name, value) in required_headers {
                request = request.with_header(name.clone(), value.clone());
            }

            self.transport.send(&request).await?;
            debug!(
                upload_target,
                bytes = json_payload.len(),
                "uploaded batch payload"
            );
            Ok(())
        })
    }

    fn push_container<'a>(
        &'a self,
        source_id: &'a str,
        container_id: &'a str,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let url = format!("{}/v1/sources/{}/documents/batch", self.base_url, source_id);
            let body = serde_json::to_vec(&serde_json::json!({ "containerId": container_id }))?;
            let request = self.base_request(HttpMethod::Put, url).with_body(body);

            self.transport.send(&request).await?;
            debug!(source_id, container_id, "pushed container");
            Ok(())
        })
    }

    fn open_stream_session<'a>(
        &'a self,
        source_id: &'a str,
    ) -> BoxFuture<'a, Result<StreamHandle, FeedError>> {
        Box::pin(async move {
            let url = format!("{}/v1/sources/{}/stream/open", self.base_url, source_id);
            let request = self
                .base_request(HttpMethod::Post, url)
                .with_body(b"{}".to_vec());

            let response = self.transport.send(&request).await?;
            let parsed: OpenSessionResponse = response.json()?;
            debug!(source_id, handle = %parsed.session_handle, "opened stream session");
            Ok(StreamHandle(parsed.session_handle))
        })
    }

    fn close_stream_session<'a>(
        &'a self,
        source_id: &'a str,
        handle: &'a StreamHandle,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let url = format!(
                "{}/v1/sources/{}/stream/{}/close",
                self.base_url, source_id, handle.0
            );
            let request = self
                .base_request(HttpMethod::Post, url)
                .with_body(b"{}".to_vec());

            self.transport.send(&request).await?;
            debug!(source_id, handle = %handle, "closed stream session");
            Ok(())
        })
    }
}

// ============================================================================
// InMemoryControlPlane - for tests and simulation
// ============================================================================

/// One recorded control-plane call, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Provision { container_id: String },
    Upload { container_id: String, bytes: usize },
    Push { source_id: String, container_id: String },
    OpenSession { source_id: String, handle: String },
    CloseSession { source_id: String, handle: String },
}

#[derive(Debug, Default)]
struct ContainerRecord {
    payload: Option<Vec<u8>>,
    pushed: bool,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_container_id: u64,
    next_session_id: u64,
    containers: HashMap<String, ContainerRecord>,
    open_sessions: HashSet<String>,
    calls: Vec<ControlCall>,
}

/// In-memory control plane for unit tests and deterministic simulation
///
/// Enforces the container lifecycle: a container must exist to be uploaded
/// to, is write-once, and must hold a payload before it can be pushed.
/// Clones share state.
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    state: Arc<RwLock<InMemoryState>>,
}

const MEMORY_TARGET_PREFIX: &str = "memory://containers/";

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered log of every call received
    pub fn calls(&self) -> Vec<ControlCall> {
        self.state.read().calls.clone()
    }

    /// Ids of containers pushed so far, in push order
    pub fn pushed_container_ids(&self) -> Vec<String> {
        self.state
            .read()
            .calls
            .iter()
            .filter_map(|call| match call {
                ControlCall::Push { container_id, .. } => Some(container_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Payload uploaded to a container, if any
    pub fn uploaded_payload(&self, container_id: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .containers
            .get(container_id)
            .and_then(|record| record.payload.clone())
    }

    /// Payloads of pushed containers, in push order
    pub fn pushed_payloads(&self) -> Vec<Vec<u8>> {
        let state = self.state.read();
        state
            .calls
            .iter()
            .filter_map(|call| match call {
                ControlCall::Push { container_id, .. } => state
                    .containers
                    .get(container_id)
                    .and_then(|record| record.payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn provisioned_count(&self) -> usize {
        self.count_calls(|call| matches!(call, ControlCall::Provision { .. }))
    }

    pub fn pushed_count(&self) -> usize {
        self.count_calls(|call| matches!(call, ControlCall::Push { .. }))
    }

    pub fn open_session_count(&self) -> usize {
        self.count_calls(|call| matches!(call, ControlCall::OpenSession { .. }))
    }

    pub fn close_session_count(&self) -> usize {
        self.count_calls(|call| matches!(call, ControlCall::CloseSession { .. }))
    }

    fn count_calls(&self, predicate: impl Fn(&ControlCall) -> bool) -> usize {
        self.state.read().calls.iter().filter(|c| predicate(c)).count()
    }

    fn lifecycle_error(status: u16, body: String) -> FeedError {
        FeedError::Transport(TransportError::Status { status, body })
    }
}

impl Clone for InMemoryControlPlane {
    fn clone(&self) -> Self {
        InMemoryControlPlane {
            state: Arc::clone(&self.state),
        }
    }
}

impl ControlPlane for InMemoryControlPlane {
    fn provision_container<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<Container, FeedError>> {
        Box::pin(async move {
            let mut state = self.state.write();
            let container_id = format!("container-{:06}", state.next_container_id);
            state.next_container_id += 1;
            state
                .containers
                .insert(container_id.clone(), ContainerRecord::default());
            state.calls.push(ControlCall::Provision {
                container_id: container_id.clone(),
            });

            Ok(Container {
                upload_target: format!("{}{}", MEMORY_TARGET_PREFIX, container_id),
                required_headers: HashMap::from([(
                    "x-upload-token".to_string(),
                    format!("token-{}", container_id),
                )]),
                container_id,
            })
        })
    }

    fn upload_content<'a>(
        &'a self,
        upload_target: &'a str,
        _required_headers: &'a HashMap<String, String>,
        json_payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let container_id = upload_target
                .strip_prefix(MEMORY_TARGET_PREFIX)
                .ok_or_else(|| {
                    Self::lifecycle_error(
                        404,
                        format!("unknown upload target: {}", upload_target),
                    )
                })?
                .to_string();

            let mut state = self.state.write();
            match state.containers.get_mut(&container_id) {
                None => {
                    return Err(Self::lifecycle_error(
                        404,
                        format!("unknown container: {}", container_id),
                    ))
                }
                Some(record) if record.payload.is_some() => {
                    return Err(Self::lifecycle_error(
                        409,
                        format!("container already written: {}", container_id),
                    ))
                }
                Some(record) => record.payload = Some(json_payload.to_vec()),
            }

            let bytes = json_payload.len();
            state.calls.push(ControlCall::Upload { container_id, bytes });
            Ok(())
        })
    }

    fn push_container<'a>(
        &'a self,
        source_id: &'a str,
        container_id: &'a str,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let mut state = self.state.write();
            match state.containers.get_mut(container_id) {
                None => {
                    return Err(Self::lifecycle_error(
                        404,
                        format!("unknown container: {}", container_id),
                    ))
                }
                Some(record) if record.payload.is_none() => {
                    return Err(Self::lifecycle_error(
                        409,
                        format!("container has no uploaded payload: {}", container_id),
                    ))
                }
                Some(record) if record.pushed => {
                    return Err(Self::lifecycle_error(
                        409,
                        format!("container already pushed: {}", container_id),
                    ))
                }
                Some(record) => record.pushed = true,
            }

            state.calls.push(ControlCall::Push {
                source_id: source_id.to_string(),
                container_id: container_id.to_string(),
            });
            Ok(())
        })
    }

    fn open_stream_session<'a>(
        &'a self,
        source_id: &'a str,
    ) -> BoxFuture<'a, Result<StreamHandle, FeedError>> {
        Box::pin(async move {
            let mut state = self.state.write();
            let handle = format!("session-{:06}", state.next_session_id);
            state.next_session_id += 1;
            state.open_sessions.insert(handle.clone());
            state.calls.push(ControlCall::OpenSession {
                source_id: source_id.to_string(),
                handle: handle.clone(),
            });
            Ok(StreamHandle(handle))
        })
    }

    fn close_stream_session<'a>(
        &'a self,
        source_id: &'a str,
        handle: &'a StreamHandle,
    ) -> BoxFuture<'a, Result<(), FeedError>> {
        Box::pin(async move {
            let mut state = self.state.write();
            if !state.open_sessions.remove(&handle.0) {
                return Err(Self::lifecycle_error(
                    404,
                    format!("unknown session: {}", handle),
                ));
            }
            state.calls.push(ControlCall::CloseSession {
                source_id: source_id.to_string(),
                handle: handle.0.clone(),
            });
            Ok(())
        })
    }
}
