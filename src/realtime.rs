//! Live query delivery on top of the listener registry.
//!
//! Read-path failures stop here: a consumer sees data, an explicit empty or
//! stale state, or a degraded empty result. Never an error.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionResetController;
use crate::observability::{SUBSCRIPTIONS_DEGRADED_TOTAL, SUBSCRIPTION_TIMEOUTS_TOTAL};
use crate::registry::{ListenerContext, ListenerHandle, ListenerRegistry, ScopeKey, TeardownFn};
use crate::store::{Filter, StoreError, StoredDocument, WatchStream};

/// What a consumer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent<T> {
    /// Current result set (possibly empty).
    Snapshot(Vec<T>),
    /// Nothing arrived in time and nothing was cached. Not an error.
    NoData,
    /// Nothing arrived in time; the last known-good items are kept.
    Stale(Vec<T>),
    /// The subscription failed and was torn down. Register again to recover.
    Degraded,
}

/// Consumer-side state. `Loading` is distinct from having no data.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedState<T> {
    Loading,
    Ready(Vec<T>),
    Empty,
    Stale(Vec<T>),
    Degraded,
}

impl<T> Default for FeedState<T> {
    fn default() -> Self {
        FeedState::Loading
    }
}

impl<T> FeedState<T> {
    pub fn apply(&mut self, event: SubscriptionEvent<T>) {
        *self = match event {
            SubscriptionEvent::Snapshot(items) => FeedState::Ready(items),
            SubscriptionEvent::NoData => FeedState::Empty,
            SubscriptionEvent::Stale(items) => FeedState::Stale(items),
            SubscriptionEvent::Degraded => FeedState::Degraded,
        };
    }

    pub fn items(&self) -> &[T] {
        match self {
            FeedState::Ready(items) | FeedState::Stale(items) => items,
            _ => &[],
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, FeedState::Loading)
    }

    /// True when the UI should show a slow-network or degraded warning.
    pub fn has_warning(&self) -> bool {
        matches!(self, FeedState::Stale(_) | FeedState::Degraded)
    }
}

/// A live query bound to a scope.
pub struct LiveQuery<T> {
    pub scope: ScopeKey,
    pub collection: &'static str,
    pub filters: Vec<Filter>,
    pub decode: fn(&StoredDocument) -> Option<T>,
}

pub type EventSink<T> = mpsc::UnboundedSender<SubscriptionEvent<T>>;

pub struct RealtimeSubscriptionManager {
    registry: ListenerRegistry,
    connection: Arc<ConnectionResetController>,
    timeout: Duration,
}

impl RealtimeSubscriptionManager {
    pub fn new(connection: Arc<ConnectionResetController>, timeout: Duration) -> Self {
        Self {
            registry: ListenerRegistry::new(),
            connection,
            timeout,
        }
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Start delivering `query` results to `sink`. Must run inside a Tokio runtime.
    ///
    /// `last_known` is what the consumer already displays; it decides whether
    /// a dead-man timeout reports `NoData` or `Stale`.
    pub fn subscribe<T>(
        &self,
        query: LiveQuery<T>,
        last_known: Vec<T>,
        sink: EventSink<T>,
    ) -> ListenerHandle
    where
        T: Clone + Send + 'static,
    {
        let connection = self.connection.clone();
        let timeout = self.timeout;
        let LiveQuery {
            scope,
            collection,
            filters,
            decode,
        } = query;

        self.registry.register(scope, move |ctx| -> TeardownFn {
            if !connection.is_ready() {
                // Nothing will ever arrive on this registration; the owner must register again.
                info!(scope = %ctx.scope(), "transport not ready; degrading to empty");
                ctx.release();
                metrics::counter!(SUBSCRIPTIONS_DEGRADED_TOTAL).increment(1);
                let _ = sink.send(SubscriptionEvent::Degraded);
                return Box::new(|| {});
            }

            let stream = match connection.store().and_then(|s| s.watch(collection, filters)) {
                Ok(stream) => stream,
                Err(err) => {
                    tokio::spawn(degrade(ctx, connection, err, sink));
                    return Box::new(|| {});
                }
            };

            debug!(scope = %ctx.scope(), generation = ctx.generation(), "subscription established");
            let cancel = CancellationToken::new();
            let pump = Pump {
                ctx,
                connection,
                decode,
                last_known,
                sink,
                timeout,
            };
            tokio::spawn(pump.run(stream, cancel.clone()));
            Box::new(move || cancel.cancel())
        })
    }
}

/// Tear down, reset on fatal errors, and hand the consumer an empty result.
async fn degrade<T>(
    ctx: ListenerContext,
    connection: Arc<ConnectionResetController>,
    err: StoreError,
    sink: EventSink<T>,
) {
    if !ctx.is_current() {
        return;
    }
    ctx.release();
    metrics::counter!(SUBSCRIPTIONS_DEGRADED_TOTAL).increment(1);
    if err.is_fatal() {
        warn!(scope = %ctx.scope(), error = %err, "transport-fatal error on subscription; resetting");
        connection.reset_connection().await;
    } else {
        warn!(scope = %ctx.scope(), error = %err, "subscription failed; degrading to empty");
    }
    let _ = sink.send(SubscriptionEvent::Degraded);
}

struct Pump<T> {
    ctx: ListenerContext,
    connection: Arc<ConnectionResetController>,
    decode: fn(&StoredDocument) -> Option<T>,
    last_known: Vec<T>,
    sink: EventSink<T>,
    timeout: Duration,
}

impl<T: Clone + Send + 'static> Pump<T> {
    async fn run(self, mut stream: WatchStream, cancel: CancellationToken) {
        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);
        let mut timer_armed = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut deadline, if timer_armed => {
                    timer_armed = false;
                    if !self.ctx.is_current() {
                        break;
                    }
                    metrics::counter!(SUBSCRIPTION_TIMEOUTS_TOTAL).increment(1);
                    let event = if self.last_known.is_empty() {
                        info!(scope = %self.ctx.scope(), "no data before timeout");
                        SubscriptionEvent::NoData
                    } else {
                        warn!(scope = %self.ctx.scope(), "slow network: keeping last known data");
                        SubscriptionEvent::Stale(self.last_known.clone())
                    };
                    let _ = self.sink.send(event);
                }
                item = stream.next() => match item {
                    Some(Ok(docs)) => {
                        if !self.ctx.is_current() {
                            break;
                        }
                        timer_armed = false;
                        let items: Vec<T> = docs.iter().filter_map(self.decode).collect();
                        if self.sink.send(SubscriptionEvent::Snapshot(items)).is_err() {
                            debug!(scope = %self.ctx.scope(), "consumer gone; releasing subscription");
                            self.ctx.release();
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        degrade(self.ctx, self.connection, err, self.sink).await;
                        return;
                    }
                    None => {
                        if self.ctx.is_current() {
                            let err = StoreError::Unavailable("watch stream closed".into());
                            degrade(self.ctx, self.connection, err, self.sink).await;
                        }
                        return;
                    }
                },
            }
        }
    }
}
