//! One live listener per scope key.
//!
//! Registering for a scope tears down whatever was registered there before.
//! Every registration carries a generation id; callbacks compare their
//! captured generation with the scope's current one and go quiet once
//! superseded.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::debug;

use crate::observability::SUBSCRIPTIONS_ACTIVE;

/// Logical subscription identity: resource type plus owner/role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub resource: String,
    pub owner: String,
}

impl ScopeKey {
    pub fn new(resource: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.owner)
    }
}

pub type TeardownFn = Box<dyn FnOnce() + Send + Sync>;

struct Registration {
    generation: u64,
    /// `None` while setup is still running.
    teardown: Option<TeardownFn>,
}

struct Inner {
    entries: DashMap<ScopeKey, Registration>,
    generation: AtomicU64,
}

impl Inner {
    fn is_current(&self, scope: &ScopeKey, generation: u64) -> bool {
        self.entries
            .get(scope)
            .is_some_and(|r| r.generation == generation)
    }

    fn release(&self, scope: &ScopeKey, generation: u64) -> bool {
        let removed = self
            .entries
            .remove_if(scope, |_, r| r.generation == generation);
        self.report_gauge();
        match removed {
            Some((_, reg)) => {
                if let Some(teardown) = reg.teardown {
                    teardown();
                }
                true
            }
            None => false,
        }
    }

    fn report_gauge(&self) {
        metrics::gauge!(SUBSCRIPTIONS_ACTIVE).set(self.entries.len() as f64);
    }
}

/// Identity of one registration, handed to its setup function.
#[derive(Clone)]
pub struct ListenerContext {
    scope: ScopeKey,
    generation: u64,
    registry: Weak<Inner>,
}

impl ListenerContext {
    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once a newer registration for the scope exists or this one was torn down.
    pub fn is_current(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| r.is_current(&self.scope, self.generation))
    }

    /// Tear this registration down from inside its own callbacks.
    pub fn release(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| r.release(&self.scope, self.generation))
    }
}

/// Returned from [`ListenerRegistry::register`].
pub struct ListenerHandle {
    ctx: ListenerContext,
}

impl ListenerHandle {
    pub fn scope(&self) -> &ScopeKey {
        &self.ctx.scope
    }

    pub fn generation(&self) -> u64 {
        self.ctx.generation
    }

    pub fn is_current(&self) -> bool {
        self.ctx.is_current()
    }

    /// Idempotent. A no-op after the first call or once superseded.
    pub fn teardown(&self) {
        self.ctx.release();
    }
}

#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Arc<Inner>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register `setup` under `scope`.
    ///
    /// Any prior registration for the scope is torn down synchronously before
    /// `setup` runs. `setup` returns the teardown for the new registration.
    pub fn register<F>(&self, scope: ScopeKey, setup: F) -> ListenerHandle
    where
        F: FnOnce(ListenerContext) -> TeardownFn,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let prior = self.inner.entries.insert(
            scope.clone(),
            Registration {
                generation,
                teardown: None,
            },
        );
        if let Some(prior) = prior {
            debug!(%scope, superseded = prior.generation, generation, "listener superseded");
            if let Some(teardown) = prior.teardown {
                teardown();
            }
        }

        let ctx = ListenerContext {
            scope: scope.clone(),
            generation,
            registry: Arc::downgrade(&self.inner),
        };
        let teardown = setup(ctx.clone());

        // Setup may have been superseded or released while it ran.
        let leftover = match self.inner.entries.get_mut(&scope) {
            Some(mut entry) if entry.generation == generation => {
                entry.teardown = Some(teardown);
                None
            }
            _ => Some(teardown),
        };
        if let Some(teardown) = leftover {
            teardown();
        }
        self.inner.report_gauge();
        ListenerHandle { ctx }
    }

    pub fn current_generation(&self, scope: &ScopeKey) -> Option<u64> {
        self.inner.entries.get(scope).map(|r| r.generation)
    }

    pub fn live_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Tear down every registration.
    pub fn shutdown(&self) {
        let live: Vec<(ScopeKey, u64)> = self
            .inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.generation))
            .collect();
        for (scope, generation) in live {
            self.inner.release(&scope, generation);
        }
        debug!("listener registry shut down");
    }
}
