use crate::error::DeclareError;
use crate::hooks::{Fit, Process, RequestFn, WillFetch};
use crate::urls;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Keys reported by [`crate::FetchGlobal::config_values`]; hook keys report whether a hook is installed.
pub const GLOBAL_CONFIG_KEYS: [&str; 17] = [
    "data",
    "fit",
    "header",
    "ignoreSelfConcurrent",
    "jsonp",
    "log",
    "method",
    "mock",
    "mockUrl",
    "mockUrlPrefix",
    "process",
    "retry",
    "timeout",
    "url",
    "urlPrefix",
    "withCredentials",
    "traditional",
];

/// Granularity of request identity for the self-concurrency policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrencyScope {
    /// Every call to the endpoint shares one identity, whatever its arguments
    #[default]
    Endpoint,
    /// Identity is the fingerprint of method, URL and merged call data
    Arguments,
}

/// `jsonp` as declared: a flag or the `[enabled, callbackQueryKey, callbackNamePattern]` descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum JsonpOption {
    Flag(bool),
    Descriptor(bool, String, String),
}

impl From<bool> for JsonpOption {
    fn from(enabled: bool) -> Self {
        JsonpOption::Flag(enabled)
    }
}

/// Exponential backoff between retry attempts
///
/// Computes delay as: `min(initial * multiplier^attempt, max)` with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 10s)
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Adds a random 0-25% to each delay (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Create backoff with custom initial and max durations
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Create fast backoff for testing (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Fully resolved configuration of one scope (global, context or endpoint).
///
/// Endpoint configs are immutable snapshots: mutating the global config after an
/// endpoint is declared never changes the endpoint's `FetchConfig`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// Request URL; bare paths receive `url_prefix` at endpoint declaration
    pub url: String,
    pub url_prefix: String,
    #[serde(serialize_with = "serialize_method")]
    pub method: http::Method,
    pub header: BTreeMap<String, String>,
    /// Fixed request data, cloned into every call's `Vars`
    pub data: Map<String, Value>,
    /// Per-attempt timeout; zero disables the timer
    #[serde(serialize_with = "serialize_millis")]
    pub timeout: Duration,
    /// Additional attempts after the first failure
    pub retry: usize,
    pub jsonp: bool,
    /// Query key advertising the callback name (default `callback`)
    pub jsonp_flag: Option<String>,
    /// Callback name pattern; `{id}` is replaced by a unique counter
    pub jsonp_callback_name: Option<String>,
    pub mock: bool,
    pub mock_url: String,
    pub mock_url_prefix: String,
    pub ignore_self_concurrent: bool,
    pub override_self_concurrent: bool,
    pub concurrency_scope: ConcurrencyScope,
    pub with_credentials: bool,
    /// Encode arrays as `a=1&a=2` instead of `a[]=1&a[]=2`
    pub traditional: bool,
    /// Raise per-call lifecycle logs from `debug` to `info`
    pub log: bool,
    /// `false` appends a `_=<millis>` cache-busting parameter
    pub cache: bool,
    #[serde(skip)]
    pub retry_delay: Option<ExponentialBackoff>,
    #[serde(skip)]
    pub fit: Option<Fit>,
    #[serde(skip)]
    pub process: Option<Process>,
    #[serde(skip)]
    pub will_fetch: Option<WillFetch>,
    #[serde(skip)]
    pub request: Option<RequestFn>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            url_prefix: String::new(),
            method: http::Method::GET,
            header: BTreeMap::new(),
            data: Map::new(),
            timeout: Duration::ZERO,
            retry: 0,
            jsonp: false,
            jsonp_flag: None,
            jsonp_callback_name: None,
            mock: false,
            mock_url: String::new(),
            mock_url_prefix: String::new(),
            ignore_self_concurrent: false,
            override_self_concurrent: false,
            concurrency_scope: ConcurrencyScope::Endpoint,
            with_credentials: false,
            traditional: false,
            log: false,
            cache: true,
            retry_delay: None,
            fit: None,
            process: None,
            will_fetch: None,
            request: None,
        }
    }
}

impl FetchConfig {
    /// Shallow merge: every option present in `overrides` replaces the inherited one.
    ///
    /// Used for global → global (set) and global → context. No URL normalization
    /// happens here; that is deferred to endpoint declaration.
    #[must_use]
    pub fn merged(&self, overrides: &ConfigOverrides) -> Self {
        let mut config = self.clone();
        overrides.apply_to(&mut config);
        config
    }

    /// Resolve an endpoint: merge, then normalize URL, mock URL and JSONP.
    #[must_use]
    pub fn resolved_for_endpoint(&self, overrides: &ConfigOverrides) -> Self {
        let mut config = self.clone();
        let explicit_jsonp = overrides.apply_to(&mut config);

        config.url = urls::with_prefix(&config.url_prefix, &config.url);

        if config.mock {
            config.mock_url = urls::with_prefix(&config.mock_url_prefix, &config.mock_url);
        } else if !explicit_jsonp {
            config.jsonp = config.jsonp || urls::is_jsonp_url(&config.url);
        }

        config
    }

    /// Look up one option by its camelCase key.
    ///
    /// Hook keys (`fit`, `process`, `willFetch`, `request`) report whether a hook is set.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        match key {
            "fit" => Some(Value::Bool(self.fit.is_some())),
            "process" => Some(Value::Bool(self.process.is_some())),
            "willFetch" => Some(Value::Bool(self.will_fetch.is_some())),
            "request" => Some(Value::Bool(self.request.is_some())),
            _ => match serde_json::to_value(self) {
                Ok(Value::Object(mut map)) => map.remove(key),
                _ => None,
            },
        }
    }

    /// The documented global key set with current values.
    #[must_use]
    pub fn documented_values(&self) -> Map<String, Value> {
        GLOBAL_CONFIG_KEYS
            .iter()
            .filter_map(|key| self.value(key).map(|v| ((*key).to_owned(), v)))
            .collect()
    }
}

/// Partial configuration declared at one scope; `None` means "inherit".
///
/// Deserializable from any figment source (YAML, env, JSON) using camelCase keys.
/// Hooks and backoff are code-only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    pub url: Option<String>,
    pub url_prefix: Option<String>,
    #[serde(deserialize_with = "deserialize_method")]
    pub method: Option<http::Method>,
    pub header: Option<BTreeMap<String, String>>,
    pub data: Option<Map<String, Value>>,
    /// Milliseconds when deserialized
    #[serde(deserialize_with = "deserialize_millis")]
    pub timeout: Option<Duration>,
    pub retry: Option<usize>,
    pub jsonp: Option<JsonpOption>,
    pub jsonp_flag: Option<String>,
    pub jsonp_callback_name: Option<String>,
    pub mock: Option<bool>,
    pub mock_url: Option<String>,
    pub mock_url_prefix: Option<String>,
    pub ignore_self_concurrent: Option<bool>,
    pub override_self_concurrent: Option<bool>,
    pub concurrency_scope: Option<ConcurrencyScope>,
    pub with_credentials: Option<bool>,
    pub traditional: Option<bool>,
    pub log: Option<bool>,
    pub cache: Option<bool>,
    #[serde(skip)]
    pub retry_delay: Option<ExponentialBackoff>,
    #[serde(skip)]
    pub fit: Option<Fit>,
    #[serde(skip)]
    pub process: Option<Process>,
    #[serde(skip)]
    pub will_fetch: Option<WillFetch>,
    #[serde(skip)]
    pub request: Option<RequestFn>,
}

macro_rules! inherit_unless_set {
    ($overrides:expr, $config:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$overrides.$field {
                $config.$field = value.clone();
            }
        )+
    };
}

macro_rules! setters {
    ($($(#[$doc:meta])* $field:ident: $ty:ty),+ $(,)?) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub fn $field(mut self, value: $ty) -> Self {
                self.$field = Some(value);
                self
            }
        )+
    };
}

macro_rules! into_setters {
    ($($(#[$doc:meta])* $field:ident: $ty:ty),+ $(,)?) => {
        $(
            $(#[$doc])*
            #[must_use]
            pub fn $field(mut self, value: impl Into<$ty>) -> Self {
                self.$field = Some(value.into());
                self
            }
        )+
    };
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract overrides from `figment` at `key` (e.g. `"fetch"`).
    ///
    /// # Errors
    /// Returns [`DeclareError::Config`] if the section has the wrong shape.
    pub fn from_figment(figment: &figment::Figment, key: &str) -> Result<Self, DeclareError> {
        if !figment.contains(key) {
            tracing::debug!(key, "no fetch configuration section; using defaults");
            return Ok(Self::default());
        }
        figment
            .extract_inner::<Self>(key)
            .map_err(|e| DeclareError::Config(Box::new(e)))
    }

    into_setters! {
        url: String,
        url_prefix: String,
        /// `true`/`false` or a [`JsonpOption::Descriptor`]
        jsonp: JsonpOption,
        jsonp_flag: String,
        jsonp_callback_name: String,
        mock_url: String,
        mock_url_prefix: String,
    }

    setters! {
        method: http::Method,
        header: BTreeMap<String, String>,
        data: Map<String, Value>,
        /// Per-attempt timeout; zero disables the timer
        timeout: Duration,
        retry: usize,
        mock: bool,
        ignore_self_concurrent: bool,
        override_self_concurrent: bool,
        concurrency_scope: ConcurrencyScope,
        with_credentials: bool,
        traditional: bool,
        log: bool,
        cache: bool,
        retry_delay: ExponentialBackoff,
    }

    /// Install a `fit` hook.
    #[must_use]
    pub fn fit<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &crate::Vars, &crate::HookContext<'_>) -> anyhow::Result<crate::Envelope>
            + Send
            + Sync
            + 'static,
    {
        self.fit = Some(Fit::new(f));
        self
    }

    /// Install a `process` hook.
    #[must_use]
    pub fn process<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &crate::Vars, &crate::HookContext<'_>) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        self.process = Some(Process::new(f));
        self
    }

    /// Install a `willFetch` hook.
    #[must_use]
    pub fn will_fetch<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut crate::Vars, &FetchConfig) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.will_fetch = Some(WillFetch::new(f));
        self
    }

    /// Replace the transport with a custom request function.
    #[must_use]
    pub fn request(mut self, request: RequestFn) -> Self {
        self.request = Some(request);
        self
    }

    /// Apply onto `config`; returns whether `jsonp` was declared at this scope.
    fn apply_to(&self, config: &mut FetchConfig) -> bool {
        inherit_unless_set!(
            self,
            config,
            url,
            url_prefix,
            method,
            header,
            data,
            timeout,
            retry,
            mock,
            mock_url,
            mock_url_prefix,
            ignore_self_concurrent,
            override_self_concurrent,
            concurrency_scope,
            with_credentials,
            traditional,
            log,
            cache,
        );
        if self.jsonp_flag.is_some() {
            config.jsonp_flag.clone_from(&self.jsonp_flag);
        }
        if self.jsonp_callback_name.is_some() {
            config.jsonp_callback_name.clone_from(&self.jsonp_callback_name);
        }
        if self.retry_delay.is_some() {
            config.retry_delay.clone_from(&self.retry_delay);
        }
        if self.fit.is_some() {
            config.fit.clone_from(&self.fit);
        }
        if self.process.is_some() {
            config.process.clone_from(&self.process);
        }
        if self.will_fetch.is_some() {
            config.will_fetch.clone_from(&self.will_fetch);
        }
        if self.request.is_some() {
            config.request.clone_from(&self.request);
        }

        match &self.jsonp {
            Some(JsonpOption::Flag(enabled)) => {
                config.jsonp = *enabled;
                true
            }
            Some(JsonpOption::Descriptor(enabled, flag, callback_name)) => {
                config.jsonp = *enabled;
                config.jsonp_flag = Some(flag.clone());
                config.jsonp_callback_name = Some(callback_name.clone());
                true
            }
            None => false,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_method<S: Serializer>(method: &http::Method, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(method.as_str())
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_millis<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

fn deserialize_method<'de, D: Deserializer<'de>>(d: D) -> Result<Option<http::Method>, D::Error> {
    let Some(raw) = Option::<String>::deserialize(d)? else {
        return Ok(None);
    };
    http::Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("invalid HTTP method '{raw}'")))
}

fn deserialize_millis<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
}
