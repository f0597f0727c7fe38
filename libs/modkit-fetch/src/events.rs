//! Lifecycle listener registries.
//!
//! One [`EventBus`] exists per scope: the [`crate::FetchGlobal`] owns the global one,
//! every [`crate::Context`] owns its own. On settlement a call notifies the global bus,
//! then the context bus, then its direct caller.
//!
//! Notes:
//! - Listeners run in registration order; a panicking listener is logged and skipped.
//! - Registration returns a [`Subscription`]; dropping it keeps the listener registered.
//! - A registry is discarded wholesale together with the scope that owns it.

use crate::config::FetchConfig;
use crate::error::FetchError;
use parking_lot::RwLock;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

type ResolveListener = Arc<dyn Fn(&Value, &FetchConfig) + Send + Sync>;
type RejectListener = Arc<dyn Fn(&FetchError, &FetchConfig) + Send + Sync>;

/// Listener scope, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventScope {
    Global,
    Context,
}

/// Lifecycle event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchEvent {
    Resolve,
    Reject,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    resolve: Vec<(u64, ResolveListener)>,
    reject: Vec<(u64, RejectListener)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Ordered listener lists for one scope.
#[derive(Clone)]
pub struct EventBus {
    scope: EventScope,
    registry: Arc<RwLock<Registry>>,
}

impl EventBus {
    #[must_use]
    pub fn new(scope: EventScope) -> Self {
        Self {
            scope,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    #[must_use]
    pub fn scope(&self) -> EventScope {
        self.scope
    }

    /// Register a listener for successful settlements.
    pub fn on_resolve<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value, &FetchConfig) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write();
        let id = registry.next_id();
        registry.resolve.push((id, Arc::new(listener)));
        self.subscription(FetchEvent::Resolve, id)
    }

    /// Register a listener for failed settlements.
    pub fn on_reject<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FetchError, &FetchConfig) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write();
        let id = registry.next_id();
        registry.reject.push((id, Arc::new(listener)));
        self.subscription(FetchEvent::Reject, id)
    }

    #[must_use]
    pub fn listener_count(&self, event: FetchEvent) -> usize {
        let registry = self.registry.read();
        match event {
            FetchEvent::Resolve => registry.resolve.len(),
            FetchEvent::Reject => registry.reject.len(),
        }
    }

    pub(crate) fn emit_resolve(&self, content: &Value, config: &FetchConfig) {
        // Snapshot so listeners may (un)register without deadlocking.
        let listeners: Vec<ResolveListener> = self
            .registry
            .read()
            .resolve
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(content, config))).is_err() {
                tracing::warn!(scope = ?self.scope, event = "resolve", "listener panicked");
            }
        }
    }

    pub(crate) fn emit_reject(&self, error: &FetchError, config: &FetchConfig) {
        let listeners: Vec<RejectListener> = self
            .registry
            .read()
            .reject
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(error, config))).is_err() {
                tracing::warn!(scope = ?self.scope, event = "reject", "listener panicked");
            }
        }
    }

    fn subscription(&self, event: FetchEvent, id: u64) -> Subscription {
        Subscription {
            event,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }
}

/// Handle to one registered listener.
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the listener; keep it to unsubscribe later"]
pub struct Subscription {
    event: FetchEvent,
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    #[must_use]
    pub fn event(&self) -> FetchEvent {
        self.event
    }

    /// Remove the listener; returns `false` if it (or its registry) is already gone.
    #[must_use]
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.write();
        match self.event {
            FetchEvent::Resolve => remove_by_id(&mut registry.resolve, self.id),
            FetchEvent::Reject => remove_by_id(&mut registry.reject, self.id),
        }
    }
}

fn remove_by_id<T>(listeners: &mut Vec<(u64, T)>, id: u64) -> bool {
    let before = listeners.len();
    listeners.retain(|(listener_id, _)| *listener_id != id);
    listeners.len() != before
}
