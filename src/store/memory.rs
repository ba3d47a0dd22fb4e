use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    matches_all, Connector, Document, DocumentStore, Filter, StoreError, StoreHandle,
    StoredDocument, WatchItem, WatchStream,
};

struct Watcher {
    client: u64,
    collection: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<WatchItem>,
}

/// Shared data behind every [`MemoryStore`] client. Survives client resets.
pub struct MemoryBackend {
    collections: DashMap<String, BTreeMap<String, Document>>,
    watchers: DashMap<u64, Watcher>,
    next_id: AtomicU64,
    faults: Mutex<VecDeque<StoreError>>,
    /// While set, watch streams stay open but deliver nothing.
    watches_stalled: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            collections: DashMap::new(),
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            faults: Mutex::new(VecDeque::new()),
            watches_stalled: AtomicBool::new(false),
        })
    }

    /// Fail the next operation (on any client) with `err`.
    pub fn inject_fault(&self, err: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }

    pub fn pending_faults(&self) -> usize {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `err` to every open watch stream.
    pub fn fail_watchers(&self, err: StoreError) {
        for w in self.watchers.iter() {
            let _ = w.tx.send(Err(err.clone()));
        }
    }

    /// Simulate a network that accepts listeners but never answers them.
    pub fn stall_watches(&self, stalled: bool) {
        self.watches_stalled.store(stalled, Ordering::Release);
    }

    fn watches_stalled(&self) -> bool {
        self.watches_stalled.load(Ordering::Acquire)
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    fn take_fault(&self) -> Option<StoreError> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn snapshot(&self, collection: &str, filters: &[Filter]) -> Vec<StoredDocument> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        docs.iter()
            .filter(|(_, d)| matches_all(filters, d))
            .map(|(id, d)| StoredDocument {
                id: id.clone(),
                data: d.clone(),
            })
            .collect()
    }

    /// Push a fresh snapshot to every watcher of `collection`.
    fn publish(&self, collection: &str) {
        if self.watches_stalled() {
            return;
        }
        let mut dead = Vec::new();
        for w in self.watchers.iter() {
            if w.collection != collection {
                continue;
            }
            let snap = self.snapshot(collection, &w.filters);
            if w.tx.send(Ok(snap)).is_err() {
                dead.push(*w.key());
            }
        }
        for id in dead {
            self.watchers.remove(&id);
        }
    }

    fn drop_client_watchers(&self, client: u64) {
        self.watchers.retain(|_, w| w.client != client);
    }
}

/// One client handle onto a [`MemoryBackend`].
pub struct MemoryStore {
    id: u64,
    backend: Arc<MemoryBackend>,
    online: AtomicBool,
    terminated: AtomicBool,
}

impl MemoryStore {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        let id = backend.next_id();
        Self {
            id,
            backend,
            online: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.is_terminated() {
            return Err(StoreError::Unavailable("client has been terminated".into()));
        }
        if !self.online.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("network disabled".into()));
        }
        match self.backend.take_fault() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check()?;
        Ok(self
            .backend
            .collections
            .get(collection)
            .and_then(|c| c.get(id).cloned()))
    }

    async fn insert(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError> {
        self.check()?;
        {
            let mut docs = self.backend.collections.entry(collection.to_string()).or_default();
            if docs.contains_key(id) {
                return Err(StoreError::AlreadyExists(format!("{collection}/{id}")));
            }
            docs.insert(id.to_string(), data);
        }
        self.backend.publish(collection);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError> {
        self.check()?;
        {
            let mut docs = self
                .backend
                .collections
                .get_mut(collection)
                .ok_or_else(|| StoreError::NotFound(format!("{collection}/{id}")))?;
            let doc = docs
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("{collection}/{id}")))?;
            for (k, v) in patch {
                doc.insert(k, v);
            }
        }
        self.backend.publish(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check()?;
        let removed = self
            .backend
            .collections
            .get_mut(collection)
            .and_then(|mut c| c.remove(id))
            .is_some();
        if removed {
            self.backend.publish(collection);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<StoredDocument>, StoreError> {
        self.check()?;
        Ok(self.backend.snapshot(collection, filters))
    }

    fn watch(&self, collection: &str, filters: Vec<Filter>) -> Result<WatchStream, StoreError> {
        self.check()?;
        let (tx, stream) = WatchStream::channel();
        if !self.backend.watches_stalled() {
            let _ = tx.send(Ok(self.backend.snapshot(collection, &filters)));
        }
        let watcher_id = self.backend.next_id();
        self.backend.watchers.insert(
            watcher_id,
            Watcher {
                client: self.id,
                collection: collection.to_string(),
                filters,
                tx,
            },
        );
        Ok(stream)
    }

    async fn set_network_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.online.store(enabled, Ordering::Release);
        debug!(client = self.id, enabled, "memory store network toggled");
        Ok(())
    }

    async fn terminate(&self) -> Result<(), StoreError> {
        self.terminated.store(true, Ordering::Release);
        self.backend.drop_client_watchers(self.id);
        Ok(())
    }
}

/// Hands out fresh [`MemoryStore`] clients over one backend.
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    connects: AtomicUsize,
    connect_faults: Mutex<VecDeque<StoreError>>,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
            connect_faults: Mutex::new(VecDeque::new()),
        }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn fail_next_connect(&self, err: StoreError) {
        self.connect_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(err);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<StoreHandle, StoreError> {
        let fault = self
            .connect_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = fault {
            return Err(err);
        }
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryStore::new(self.backend.clone())))
    }
}
