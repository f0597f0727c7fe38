//! Public surface: global scope, contexts, API groups and endpoints.

use crate::config::{ConfigOverrides, FetchConfig};
use crate::coordinator::{Admission, Coordinator, Policy, RequestIdentity, Ticket};
use crate::error::{DeclareError, FetchError};
use crate::events::{EventBus, EventScope, Subscription};
use crate::handle::CallHandle;
use crate::hooks::{CallArgs, Vars};
use crate::pipeline::Pipeline;
use crate::transport::Transports;
use arc_swap::ArcSwap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};
use tokio::sync::oneshot;

static SHARED: LazyLock<FetchGlobal> = LazyLock::new(FetchGlobal::new);

/// Emit a per-call lifecycle log at `info` when the endpoint has `log` on, else at `debug`.
macro_rules! lifecycle {
    ($loud:expr, $($arg:tt)+) => {
        if $loud {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

/// Process-wide defaults, the global listener scope and the transports.
///
/// [`FetchGlobal::shared`] is the instance behind the free functions
/// ([`get_global_config`], [`create_context`], ...); isolated instances from
/// [`FetchGlobal::new`] are independent of it and of each other.
pub struct FetchGlobal {
    config: ArcSwap<FetchConfig>,
    events: EventBus,
    transports: Transports,
}

impl Default for FetchGlobal {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchGlobal {
    #[must_use]
    pub fn new() -> Self {
        Self::with_transports(Transports::default())
    }

    #[must_use]
    pub fn with_transports(transports: Transports) -> Self {
        Self {
            config: ArcSwap::from_pointee(FetchConfig::default()),
            events: EventBus::new(EventScope::Global),
            transports,
        }
    }

    /// The process-wide instance.
    #[must_use]
    pub fn shared() -> &'static FetchGlobal {
        &SHARED
    }

    /// Current global defaults.
    #[must_use]
    pub fn config(&self) -> Arc<FetchConfig> {
        self.config.load_full()
    }

    /// One global option by camelCase key.
    #[must_use]
    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.config.load().value(key)
    }

    /// The documented global key set with current values.
    #[must_use]
    pub fn config_values(&self) -> Map<String, Value> {
        self.config.load().documented_values()
    }

    /// Shallow-merge `overrides` into the global defaults.
    ///
    /// Contexts and endpoints already declared keep the snapshot they were built from.
    pub fn set_config(&self, overrides: &ConfigOverrides) {
        self.config.rcu(|current| current.merged(overrides));
        tracing::debug!(
            url_prefix = %self.config.load().url_prefix,
            "global fetch config updated"
        );
    }

    pub fn on_resolve<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value, &FetchConfig) + Send + Sync + 'static,
    {
        self.events.on_resolve(listener)
    }

    pub fn on_reject<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FetchError, &FetchConfig) + Send + Sync + 'static,
    {
        self.events.on_reject(listener)
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Create a context from the current global defaults merged with `overrides`.
    #[must_use]
    pub fn context(&self, overrides: &ConfigOverrides) -> Context {
        let config = self.config.load().merged(overrides);
        tracing::debug!(url_prefix = %config.url_prefix, mock = config.mock, "context created");
        Context {
            inner: Arc::new(ContextInner {
                config: Arc::new(config),
                events: EventBus::new(EventScope::Context),
                global_events: self.events.clone(),
                transports: self.transports.clone(),
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl fmt::Debug for FetchGlobal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchGlobal")
            .field("config", &self.config.load_full())
            .field("transports", &self.transports)
            .finish_non_exhaustive()
    }
}

/// Current process-wide defaults.
#[must_use]
pub fn get_global_config() -> Map<String, Value> {
    FetchGlobal::shared().config_values()
}

/// One process-wide option by camelCase key.
#[must_use]
pub fn get_global_config_value(key: &str) -> Option<Value> {
    FetchGlobal::shared().config_value(key)
}

/// Shallow-merge `overrides` into the process-wide defaults.
pub fn set_global_config(overrides: &ConfigOverrides) {
    FetchGlobal::shared().set_config(overrides);
}

/// Create a context on the process-wide instance.
#[must_use]
pub fn create_context(overrides: &ConfigOverrides) -> Context {
    FetchGlobal::shared().context(overrides)
}

/// Register a global `resolve` listener on the process-wide instance.
pub fn on_resolve<F>(listener: F) -> Subscription
where
    F: Fn(&Value, &FetchConfig) + Send + Sync + 'static,
{
    FetchGlobal::shared().on_resolve(listener)
}

/// Register a global `reject` listener on the process-wide instance.
pub fn on_reject<F>(listener: F) -> Subscription
where
    F: Fn(&FetchError, &FetchConfig) + Send + Sync + 'static,
{
    FetchGlobal::shared().on_reject(listener)
}

/// Endpoint declaration: overrides given directly, or a factory evaluated once at declaration.
pub enum EndpointDecl {
    Overrides(ConfigOverrides),
    Factory(Box<dyn FnOnce() -> ConfigOverrides + Send>),
}

impl EndpointDecl {
    #[must_use]
    pub fn lazy<F>(factory: F) -> Self
    where
        F: FnOnce() -> ConfigOverrides + Send + 'static,
    {
        EndpointDecl::Factory(Box::new(factory))
    }

    fn into_overrides(self) -> ConfigOverrides {
        match self {
            EndpointDecl::Overrides(overrides) => overrides,
            EndpointDecl::Factory(factory) => factory(),
        }
    }
}

impl From<ConfigOverrides> for EndpointDecl {
    fn from(overrides: ConfigOverrides) -> Self {
        EndpointDecl::Overrides(overrides)
    }
}

impl fmt::Debug for EndpointDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointDecl::Overrides(overrides) => {
                f.debug_tuple("Overrides").field(overrides).finish()
            }
            EndpointDecl::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

struct ContextInner {
    config: Arc<FetchConfig>,
    events: EventBus,
    global_events: EventBus,
    transports: Transports,
    groups: RwLock<HashMap<String, ApiGroup>>,
}

/// A configuration scope holding named API groups and its own listeners.
///
/// Cheap to clone; clones share groups and listeners. Dropped with its last clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// The context's resolved config (global snapshot merged with its overrides).
    #[must_use]
    pub fn config(&self) -> Arc<FetchConfig> {
        Arc::clone(&self.inner.config)
    }

    /// Declare a named group of endpoints.
    ///
    /// # Errors
    /// Returns [`DeclareError::DuplicateGroup`] if `name` is already declared here.
    pub fn create_api_group<I, K, D>(&self, name: &str, endpoints: I) -> Result<ApiGroup, DeclareError>
    where
        I: IntoIterator<Item = (K, D)>,
        K: Into<String>,
        D: Into<EndpointDecl>,
    {
        if self.inner.groups.read().contains_key(name) {
            return Err(DeclareError::DuplicateGroup(name.to_owned()));
        }

        // Factories run without the group lock held; they may inspect this context.
        let endpoints: BTreeMap<String, Endpoint> = endpoints
            .into_iter()
            .map(|(method, decl)| {
                let method = method.into();
                let endpoint = self.declare_endpoint(name, &method, decl.into());
                (method, endpoint)
            })
            .collect();

        let group = ApiGroup {
            name: Arc::from(name),
            endpoints: Arc::new(endpoints),
        };
        match self.inner.groups.write().entry(name.to_owned()) {
            Entry::Occupied(_) => return Err(DeclareError::DuplicateGroup(name.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(group.clone());
            }
        }
        tracing::debug!(group = name, endpoints = group.len(), "api group declared");
        Ok(group)
    }

    fn declare_endpoint(&self, group: &str, method: &str, decl: EndpointDecl) -> Endpoint {
        let config = self.inner.config.resolved_for_endpoint(&decl.into_overrides());
        tracing::trace!(
            group,
            method,
            url = %config.url,
            jsonp = config.jsonp,
            mock = config.mock,
            "endpoint declared"
        );
        Endpoint {
            inner: Arc::new(EndpointInner {
                name: format!("{group}.{method}"),
                config: Arc::new(config),
                coordinator: Coordinator::new(),
                context_events: self.inner.events.clone(),
                global_events: self.inner.global_events.clone(),
                transports: self.inner.transports.clone(),
            }),
        }
    }

    #[must_use]
    pub fn api(&self, name: &str) -> Option<ApiGroup> {
        self.inner.groups.read().get(name).cloned()
    }

    /// Shorthand for `api(group)?.get(method)`.
    #[must_use]
    pub fn endpoint(&self, group: &str, method: &str) -> Option<Endpoint> {
        self.api(group)?.get(method).cloned()
    }

    pub fn on_resolve<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value, &FetchConfig) + Send + Sync + 'static,
    {
        self.inner.events.on_resolve(listener)
    }

    pub fn on_reject<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&FetchError, &FetchConfig) + Send + Sync + 'static,
    {
        self.inner.events.on_reject(listener)
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut groups: Vec<String> = self.inner.groups.read().keys().cloned().collect();
        groups.sort_unstable();
        f.debug_struct("Context")
            .field("config", &self.inner.config)
            .field("groups", &groups)
            .finish_non_exhaustive()
    }
}

/// Named mapping from method name to [`Endpoint`].
#[derive(Clone)]
pub struct ApiGroup {
    name: Arc<str>,
    endpoints: Arc<BTreeMap<String, Endpoint>>,
}

impl ApiGroup {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self, method: &str) -> Option<&Endpoint> {
        self.endpoints.get(method)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl fmt::Debug for ApiGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiGroup")
            .field("name", &self.name)
            .field("endpoints", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

struct EndpointInner {
    name: String,
    config: Arc<FetchConfig>,
    coordinator: Arc<Coordinator>,
    context_events: EventBus,
    global_events: EventBus,
    transports: Transports,
}

/// A declared, callable endpoint with its immutable resolved config.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// `true` while any call of this endpoint is in flight.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.inner.coordinator.pending()
    }

    /// Start a call. The work runs on the current tokio runtime; `pending` is
    /// already `true` when this returns.
    ///
    /// Without a runtime, or when deferred call data panics, the handle settles
    /// at once with a [`FetchError::Programming`].
    pub fn call(&self, args: impl Into<CallArgs>) -> CallHandle {
        let inner = &self.inner;
        let config = &inner.config;
        let args = args.into();
        let vars = match catch_unwind(AssertUnwindSafe(|| Vars::for_call(&config.data, args))) {
            Ok(vars) => vars,
            Err(payload) => {
                let err = panic_error("call data", &*payload);
                tracing::warn!(endpoint = %inner.name, error = %err, "call failed in a hook");
                return CallHandle::settled(Err(err));
            }
        };

        let policy = Policy::from_config(config);
        let identity = if policy == Policy::Concurrent {
            RequestIdentity::Endpoint
        } else {
            RequestIdentity::for_call(config, &vars)
        };

        let ticket = match inner.coordinator.admit(policy, identity) {
            Admission::Proceed(ticket) => ticket,
            Admission::Ignored(stub) => {
                lifecycle!(config.log, endpoint = %inner.name, "call ignored; previous call still pending");
                return CallHandle::ignored(stub);
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return CallHandle::settled(Err(FetchError::Programming(
                "endpoint called outside of a tokio runtime".to_owned(),
            )));
        };

        lifecycle!(config.log, endpoint = %inner.name, url = %config.url, method = %config.method, "call started");
        let (tx, rx) = oneshot::channel();
        runtime.spawn(run_call(Arc::clone(inner), ticket, vars, tx));
        CallHandle::active(rx)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Drive one admitted call and deliver its settlement: slot release, then the
/// global listeners, then the context listeners, then the caller.
async fn run_call(
    endpoint: Arc<EndpointInner>,
    mut ticket: Ticket,
    vars: Vars,
    tx: oneshot::Sender<Result<Value, FetchError>>,
) {
    let config = &endpoint.config;
    let cancel = ticket.cancellation();
    let pipeline = Pipeline::new(Arc::clone(config), endpoint.transports.clone());

    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            lifecycle!(config.log, endpoint = %endpoint.name, "call superseded");
            return;
        }
        outcome = AssertUnwindSafe(pipeline.run(vars)).catch_unwind() => {
            outcome.unwrap_or_else(|payload| Err(panic_error("hook", &*payload)))
        }
    };

    if !ticket.settle() {
        lifecycle!(config.log, endpoint = %endpoint.name, "call superseded; result discarded");
        return;
    }

    match &result {
        Ok(value) => {
            lifecycle!(config.log, endpoint = %endpoint.name, "call resolved");
            endpoint.global_events.emit_resolve(value, config);
            endpoint.context_events.emit_resolve(value, config);
        }
        Err(FetchError::Programming(message)) => {
            tracing::warn!(endpoint = %endpoint.name, error = %message, "call failed in a hook");
        }
        Err(err) => {
            lifecycle!(config.log, endpoint = %endpoint.name, error = %err, "call rejected");
            endpoint.global_events.emit_reject(err, config);
            endpoint.context_events.emit_reject(err, config);
        }
    }

    if tx.send(result).is_err() {
        tracing::trace!(endpoint = %endpoint.name, "call handle dropped before settlement");
    }
}

/// A panic inside user code settles the call like a hook returning `Err`.
fn panic_error(origin: &str, payload: &(dyn Any + Send)) -> FetchError {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    FetchError::Programming(format!("{origin} panicked: {message}"))
}
