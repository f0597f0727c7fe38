//! Per-call variables and the user hooks that see them.

use crate::config::FetchConfig;
use crate::error::FetchError;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Per-call mutable bag handed through `will_fetch` → transport → `fit`/`process`.
///
/// Each call owns its own `Vars`; nothing here is shared between concurrent calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vars {
    /// Fixed config `data` merged with the live call-time data
    pub data: Map<String, Value>,
}

impl Vars {
    /// Clone the fixed data and overlay the live call-time data.
    pub(crate) fn for_call(fixed: &Map<String, Value>, args: CallArgs) -> Self {
        let mut data = fixed.clone();
        if let Some(live) = args.into_data() {
            data.extend(live);
        }
        Self { data }
    }
}

/// Live arguments of one endpoint call.
#[derive(Default)]
pub enum CallArgs {
    /// No call-time data
    #[default]
    None,
    /// A data object merged over the endpoint's fixed `data`
    Data(Map<String, Value>),
    /// Invoked once, with no arguments, when the call starts
    Deferred(Box<dyn FnOnce() -> Map<String, Value> + Send>),
}

impl CallArgs {
    /// Produce the live data lazily at call time.
    pub fn deferred<F>(f: F) -> Self
    where
        F: FnOnce() -> Map<String, Value> + Send + 'static,
    {
        CallArgs::Deferred(Box::new(f))
    }

    fn into_data(self) -> Option<Map<String, Value>> {
        match self {
            CallArgs::None => None,
            CallArgs::Data(data) => Some(data),
            CallArgs::Deferred(f) => Some(f()),
        }
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallArgs::None => f.write_str("None"),
            CallArgs::Data(data) => f.debug_tuple("Data").field(data).finish(),
            CallArgs::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Map<String, Value>> for CallArgs {
    fn from(data: Map<String, Value>) -> Self {
        CallArgs::Data(data)
    }
}

impl From<Value> for CallArgs {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(data) => CallArgs::Data(data),
            Value::Null => CallArgs::None,
            other => {
                tracing::warn!(value = %other, "ignoring non-object call data");
                CallArgs::None
            }
        }
    }
}

impl From<()> for CallArgs {
    fn from((): ()) -> Self {
        CallArgs::None
    }
}

/// Standard response shape every backend envelope is normalized into by `fit`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub success: bool,
    /// Payload handed to `process` on success
    pub content: Value,
    /// Error payload used to build [`FetchError::App`] on failure
    pub error: Value,
}

impl Envelope {
    #[must_use]
    pub fn ok(content: Value) -> Self {
        Self {
            success: true,
            content,
            error: Value::Null,
        }
    }

    #[must_use]
    pub fn failed(error: Value) -> Self {
        Self {
            success: false,
            content: Value::Null,
            error,
        }
    }

    /// Read `{ "success": bool, "content": .., "error": .. }`.
    ///
    /// # Errors
    /// Returns [`FetchError::Programming`] when `raw` is not an object with a boolean
    /// `success` member.
    pub fn from_standard(raw: Value) -> Result<Self, FetchError> {
        let Value::Object(mut map) = raw else {
            return Err(FetchError::Programming(
                "response is not an object; provide a `fit` hook for this backend".to_owned(),
            ));
        };
        let Some(success) = map.get("success").and_then(Value::as_bool) else {
            return Err(FetchError::Programming(
                "response has no boolean `success`; provide a `fit` hook for this backend"
                    .to_owned(),
            ));
        };
        Ok(Self {
            success,
            content: map.remove("content").unwrap_or(Value::Null),
            error: map.remove("error").unwrap_or(Value::Null),
        })
    }
}

/// What a hook knows about the call it runs in.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// The payload came from the mock source, not a transport
    pub mock: bool,
    /// Zero-based attempt number
    pub attempt: usize,
    pub config: &'a FetchConfig,
}

type FitFn = dyn Fn(Value, &Vars, &HookContext<'_>) -> anyhow::Result<Envelope> + Send + Sync;
type ProcessFn = dyn Fn(Value, &Vars, &HookContext<'_>) -> anyhow::Result<Value> + Send + Sync;
type WillFetchFn = dyn Fn(&mut Vars, &FetchConfig) -> anyhow::Result<()> + Send + Sync;
type RequestFnInner = dyn Fn(Vars, Arc<FetchConfig>, usize) -> BoxFuture<'static, Result<Value, FetchError>>
    + Send
    + Sync;

/// Normalizes an arbitrary backend response into an [`Envelope`].
#[derive(Clone)]
pub struct Fit(Arc<FitFn>);

impl Fit {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value, &Vars, &HookContext<'_>) -> anyhow::Result<Envelope> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(
        &self,
        raw: Value,
        vars: &Vars,
        ctx: &HookContext<'_>,
    ) -> Result<Envelope, FetchError> {
        (self.0)(raw, vars, ctx).map_err(|e| FetchError::Programming(format!("fit: {e:#}")))
    }
}

/// Transforms successful content into the value delivered to the caller.
#[derive(Clone)]
pub struct Process(Arc<ProcessFn>);

impl Process {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value, &Vars, &HookContext<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(
        &self,
        content: Value,
        vars: &Vars,
        ctx: &HookContext<'_>,
    ) -> Result<Value, FetchError> {
        (self.0)(content, vars, ctx).map_err(|e| FetchError::Programming(format!("process: {e:#}")))
    }
}

/// Runs once before the first attempt and may mutate `vars.data`.
#[derive(Clone)]
pub struct WillFetch(Arc<WillFetchFn>);

impl WillFetch {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Vars, &FetchConfig) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(&self, vars: &mut Vars, config: &FetchConfig) -> Result<(), FetchError> {
        (self.0)(vars, config).map_err(|e| FetchError::Programming(format!("willFetch: {e:#}")))
    }
}

/// Replaces the transport entirely; its value is delivered without `fit`/`process`.
///
/// Receives the call's vars, the endpoint config and the zero-based attempt number.
/// Errors it returns are retried like transport failures.
#[derive(Clone)]
pub struct RequestFn(Arc<RequestFnInner>);

impl RequestFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vars, Arc<FetchConfig>, usize) -> BoxFuture<'static, Result<Value, FetchError>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(
        &self,
        vars: Vars,
        config: Arc<FetchConfig>,
        attempt: usize,
    ) -> BoxFuture<'static, Result<Value, FetchError>> {
        (self.0)(vars, config, attempt)
    }
}

macro_rules! opaque_debug {
    ($($name:ident),+) => {
        $(
            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(concat!(stringify!($name), "(..)"))
                }
            }
        )+
    };
}

opaque_debug!(Fit, Process, WillFetch, RequestFn);

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_vars_merge_live_over_fixed() {
        let fixed = obj(json!({"fixData": 1, "shared": "fixed"}));
        let vars = Vars::for_call(&fixed, json!({"liveData": 1, "shared": "live"}).into());
        assert_eq!(
            Value::Object(vars.data),
            json!({"fixData": 1, "liveData": 1, "shared": "live"})
        );
        // the fixed data is cloned, not moved
        assert_eq!(fixed.get("shared"), Some(&json!("fixed")));
    }

    #[test]
    fn test_deferred_args_invoked_once_per_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let args = CallArgs::deferred(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            obj(json!({"count": n}))
        });
        let vars = Vars::for_call(&Map::new(), args);
        assert_eq!(vars.data.get("count"), Some(&json!(0)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_object_call_data_ignored() {
        let vars = Vars::for_call(&Map::new(), json!(42).into());
        assert!(vars.data.is_empty());
    }

    #[test]
    fn test_standard_envelope() {
        let env = Envelope::from_standard(json!({"success": true, "content": {"id": 1}})).unwrap();
        assert!(env.success);
        assert_eq!(env.content, json!({"id": 1}));

        let env =
            Envelope::from_standard(json!({"success": false, "error": {"code": 1}})).unwrap();
        assert!(!env.success);
        assert_eq!(env.error, json!({"code": 1}));
    }

    #[test]
    fn test_malformed_envelope_is_programming_error() {
        let err = Envelope::from_standard(json!({"hasError": false})).unwrap_err();
        assert!(matches!(err, FetchError::Programming(_)));
        let err = Envelope::from_standard(json!([1, 2])).unwrap_err();
        assert!(matches!(err, FetchError::Programming(_)));
    }

    #[test]
    fn test_hook_error_maps_to_programming() {
        let process = Process::new(|_, _, _| anyhow::bail!("boom"));
        let config = FetchConfig::default();
        let ctx = HookContext {
            mock: false,
            attempt: 0,
            config: &config,
        };
        let err = process.apply(json!(1), &Vars::default(), &ctx).unwrap_err();
        assert!(matches!(err, FetchError::Programming(ref m) if m.contains("boom")));
    }
}
