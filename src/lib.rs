pub mod batch;
pub mod clock;
pub mod config;
pub mod control;
pub mod dst;
pub mod error;
pub mod mutation;
pub mod queue;
pub mod rotation;
pub mod session;
pub mod simulated;
pub mod transport;

pub use batch::{PushBatch, StreamBatch};
pub use clock::{Clock, ProductionClock, SimulatedClock};
pub use config::{ApiConfig, ConfigError, FeedConfig, QueueConfig};
pub use control::{Container, ControlPlane, HttpControlPlane, InMemoryControlPlane, StreamHandle};
pub use error::FeedError;
pub use mutation::{Document, DocumentDelete, MutationError, PartialUpdate, UpdateOperator};
pub use queue::{PushQueue, StreamQueue, UploadStrategy};
pub use rotation::ContainerRotator;
pub use session::StreamSession;
pub use transport::{BackoffOptions, RetryingTransport, TransportError};
