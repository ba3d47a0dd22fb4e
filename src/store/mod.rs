//! Document store seam.
//!
//! The engine needs three things from a backend: JSON-like documents, queries
//! by equality/range on fields, and pushed change notifications. Anything that
//! provides them can sit behind [`DocumentStore`].

pub mod memory;

use std::cmp::Ordering;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::{MemoryBackend, MemoryConnector, MemoryStore};

pub type Document = serde_json::Map<String, Value>;

pub mod collections {
    pub const SLOTS: &str = "slots";
    pub const BOOKINGS: &str = "bookings";
    pub const NOTIFICATIONS: &str = "notifications";
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
}

/// How the retry layer treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Client internal state is corrupt; only a full reset helps.
    Fatal,
    /// Worth another attempt after a backoff.
    Transient,
    /// Retrying cannot change the outcome.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("internal assertion failed: {0}")]
    Internal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("malformed document: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Internal(_) => ErrorClass::Fatal,
            StoreError::Unavailable(_) => ErrorClass::Transient,
            StoreError::PermissionDenied(_)
            | StoreError::FailedPrecondition(_)
            | StoreError::NotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Decode(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

/// One field predicate. A query is the conjunction of its filters.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    fn new(field: &str, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value.into())
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value.into())
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value.into())
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value.into())
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let list = values.into_iter().map(Into::into).collect();
        Self::new(field, FilterOp::In, Value::Array(list))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::In => match &self.value {
                Value::Array(options) => options.contains(actual),
                _ => false,
            },
            FilterOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Range comparison is defined only between values of the same JSON type.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn matches_all(filters: &[Filter], doc: &Document) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

pub type WatchItem = Result<Vec<StoredDocument>, StoreError>;

/// Live query results: a full snapshot after every change, or an error.
///
/// The stream ends when the producing client is terminated.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchItem>,
}

impl WatchStream {
    pub fn channel() -> (mpsc::UnboundedSender<WatchItem>, WatchStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, WatchStream { rx })
    }
}

impl Stream for WatchStream {
    type Item = WatchItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create a document. `AlreadyExists` if the id is taken.
    async fn insert(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError>;

    /// Merge `patch` into an existing document. `NotFound` if absent.
    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError>;

    /// Remove a document. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Subscribe to a live query. The current snapshot is delivered first.
    fn watch(&self, collection: &str, filters: Vec<Filter>) -> Result<WatchStream, StoreError>;

    async fn set_network_enabled(&self, enabled: bool) -> Result<(), StoreError>;

    /// Shut the client down. Every open watch stream ends.
    async fn terminate(&self) -> Result<(), StoreError>;
}

pub type StoreHandle = Arc<dyn DocumentStore>;

/// Creates fresh client handles; used at startup and on full resets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<StoreHandle, StoreError>;
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Decode(format!("expected object, got {other}"))),
        Err(e) => Err(StoreError::Decode(e.to_string())),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(doc.clone())).map_err(|e| StoreError::Decode(e.to_string()))
}
