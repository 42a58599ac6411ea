//! Backend abstraction.
//!
//! The core persists cluster state through this small interface; concrete
//! drivers (etcd, DynamoDB, Firestore, ...) live outside the core. Records
//! are `(key, value, expires?, revision)`; the revision is a backend-global
//! monotonic counter.

use std::future::Future;

use drawbridge_domain::GatewayError;
use time::OffsetDateTime;

pub mod memory;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("key {0:?} not found")]
    NotFound(String),

    #[error("compare failed for key {0:?}")]
    CompareFailed(String),

    #[error("backend closed")]
    Closed,
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(key) => GatewayError::NotFound(key),
            BackendError::CompareFailed(key) => GatewayError::AlreadyExists(key),
            BackendError::Closed => GatewayError::ConnectionProblem("backend closed".to_string()),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    pub expires: Option<OffsetDateTime>,
    pub revision: u64,
}

#[derive(Clone, Debug)]
pub enum BackendEvent {
    Put(Item),
    Delete { key: String },
    /// The subscriber fell behind or the backend connection was lost;
    /// cached state must be rebuilt from a fresh list.
    Lost,
}

pub trait Backend: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = BackendResult<Item>> + Send;

    /// Unconditional write; returns the new revision
    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expires: Option<OffsetDateTime>,
    ) -> impl Future<Output = BackendResult<u64>> + Send;

    /// `expected = None` creates the key only if absent; `Some(bytes)`
    /// replaces only when the current value matches.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        expires: Option<OffsetDateTime>,
    ) -> impl Future<Output = BackendResult<u64>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = BackendResult<()>> + Send;

    /// All live items whose key starts with `prefix`, in key order
    fn range(&self, prefix: &str) -> impl Future<Output = BackendResult<Vec<Item>>> + Send;

    /// Subscribe to mutation events. Delivery is at-least-once from the
    /// point of subscription; a lagging subscriber observes [BackendEvent::Lost].
    fn events(&self) -> EventSubscription;
}

/// Wraps the broadcast receiver so slow subscribers observe a `Lost`
/// sentinel instead of an error.
pub struct EventSubscription {
    rx: tokio::sync::broadcast::Receiver<BackendEvent>,
}

impl EventSubscription {
    pub fn new(rx: tokio::sync::broadcast::Receiver<BackendEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<BackendEvent> {
        use tokio::sync::broadcast::error::RecvError;

        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "backend event subscriber lagged");
                Some(BackendEvent::Lost)
            }
            Err(RecvError::Closed) => None,
        }
    }
}
