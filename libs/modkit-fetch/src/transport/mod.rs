//! Pluggable request sources consumed by the pipeline.
//!
//! The pipeline never performs I/O itself: every attempt goes through one of
//! the [`Transport`] implementations held by [`Transports`], or through the
//! [`MockSource`] when the endpoint is mocking.

mod jsonp;
mod standard;
mod tls;

pub use jsonp::{DEFAULT_CALLBACK_NAME, DEFAULT_JSONP_FLAG, JsonpTransport};
pub use standard::{HttpTransport, TlsRootConfig};

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::hooks::Vars;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One attempt's request as seen by a transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: http::Method,
    /// Resolved URL, without the encoded `data`
    pub url: String,
    pub data: Map<String, Value>,
    pub headers: BTreeMap<String, String>,
    /// Per-attempt timeout; zero means none. Enforced by the pipeline.
    pub timeout: Duration,
    pub with_credentials: bool,
    pub traditional: bool,
    pub cache: bool,
    pub jsonp_flag: Option<String>,
    pub jsonp_callback_name: Option<String>,
}

impl TransportRequest {
    /// Build the request for one attempt from the endpoint config and the call's vars.
    #[must_use]
    pub fn new(config: &FetchConfig, vars: &Vars) -> Self {
        Self {
            method: config.method.clone(),
            url: config.url.clone(),
            data: vars.data.clone(),
            headers: config.header.clone(),
            timeout: config.timeout,
            with_credentials: config.with_credentials,
            traditional: config.traditional,
            cache: config.cache,
            jsonp_flag: config.jsonp_flag.clone(),
            jsonp_callback_name: config.jsonp_callback_name.clone(),
        }
    }

    /// `data` form-encoded with the configured array style.
    #[must_use]
    pub fn encoded_data(&self) -> String {
        encode_params(&self.data, self.traditional)
    }

    /// URL with `extra` query appended, plus the cache buster when caching is off.
    #[must_use]
    pub fn url_with_query(&self, extra: &str) -> String {
        let mut url = crate::urls::append_query(&self.url, extra);
        if !self.cache {
            url = crate::urls::append_query(&url, &cache_buster());
        }
        url
    }
}

/// Performs one attempt and yields the raw backend response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// # Errors
    /// Returns a [`FetchError`] describing why the backend could not be reached or answered.
    async fn send(&self, request: TransportRequest) -> Result<Value, FetchError>;
}

/// Supplies canned payloads for mocking endpoints; transports are never invoked.
#[async_trait]
pub trait MockSource: Send + Sync {
    /// # Errors
    /// Returns a [`FetchError`] when no payload is available for `mock_url`.
    async fn load(&self, mock_url: &str, vars: &Vars) -> Result<Value, FetchError>;
}

/// The set of request sources one [`crate::FetchGlobal`] hands to its endpoints.
#[derive(Clone)]
pub struct Transports {
    pub standard: Arc<dyn Transport>,
    pub jsonp: Arc<dyn Transport>,
    pub mock: Arc<dyn MockSource>,
}

impl Default for Transports {
    fn default() -> Self {
        Self {
            standard: Arc::new(HttpTransport::new()),
            jsonp: Arc::new(JsonpTransport::new()),
            mock: Arc::new(StaticMocks::new()),
        }
    }
}

impl Transports {
    #[must_use]
    pub fn with_standard(mut self, transport: Arc<dyn Transport>) -> Self {
        self.standard = transport;
        self
    }

    #[must_use]
    pub fn with_jsonp(mut self, transport: Arc<dyn Transport>) -> Self {
        self.jsonp = transport;
        self
    }

    #[must_use]
    pub fn with_mock(mut self, mock: Arc<dyn MockSource>) -> Self {
        self.mock = mock;
        self
    }
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Transports(..)")
    }
}

/// In-memory [`MockSource`] keyed by resolved mock URL.
#[derive(Debug, Default)]
pub struct StaticMocks {
    payloads: RwLock<HashMap<String, Value>>,
}

impl StaticMocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(self, mock_url: impl Into<String>, payload: Value) -> Self {
        self.insert(mock_url, payload);
        self
    }

    pub fn insert(&self, mock_url: impl Into<String>, payload: Value) {
        self.payloads.write().insert(mock_url.into(), payload);
    }
}

#[async_trait]
impl MockSource for StaticMocks {
    async fn load(&self, mock_url: &str, _vars: &Vars) -> Result<Value, FetchError> {
        self.payloads
            .read()
            .get(mock_url)
            .cloned()
            .ok_or_else(|| FetchError::transport_msg(format!("no mock payload for '{mock_url}'")))
    }
}

/// Form-encode `data` the way browsers' `param` helpers do.
///
/// Arrays become `a[]=1&a[]=2`, or `a=1&a=2` when `traditional`. Nested objects
/// become `o[k]=v`. `null` encodes as an empty value.
#[must_use]
pub fn encode_params(data: &Map<String, Value>, traditional: bool) -> String {
    let mut pairs = Vec::new();
    for (key, value) in data {
        collect_pairs(key, value, traditional, &mut pairs);
    }
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn collect_pairs(prefix: &str, value: &Value, traditional: bool, out: &mut Vec<(String, String)>) {
    match value {
        Value::Array(items) => {
            for item in items {
                if traditional {
                    out.push((prefix.to_owned(), scalar_to_string(item)));
                } else if item.is_array() || item.is_object() {
                    collect_pairs(&format!("{prefix}[]"), item, traditional, out);
                } else {
                    out.push((format!("{prefix}[]"), scalar_to_string(item)));
                }
            }
        }
        Value::Object(map) if !traditional => {
            for (key, nested) in map {
                collect_pairs(&format!("{prefix}[{key}]"), nested, traditional, out);
            }
        }
        other => out.push((prefix.to_owned(), scalar_to_string(other))),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cache_buster() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("_={millis}")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encode_scalars() {
        let data = obj(json!({"a": 1, "b": "x y", "c": true, "d": null}));
        assert_eq!(encode_params(&data, false), "a=1&b=x+y&c=true&d=");
    }

    #[test]
    fn test_encode_arrays_bracketed_and_traditional() {
        let data = obj(json!({"ids": [1, 2]}));
        assert_eq!(encode_params(&data, false), "ids%5B%5D=1&ids%5B%5D=2");
        assert_eq!(encode_params(&data, true), "ids=1&ids=2");
    }

    #[test]
    fn test_encode_nested_object() {
        let data = obj(json!({"o": {"k": "v"}}));
        assert_eq!(encode_params(&data, false), "o%5Bk%5D=v");
    }

    #[test]
    fn test_url_with_query_and_cache_buster() {
        let config = FetchConfig {
            url: "http://h/api".to_owned(),
            cache: false,
            ..FetchConfig::default()
        };
        let request = TransportRequest::new(&config, &Vars::default());
        let url = request.url_with_query("a=1");
        assert!(url.starts_with("http://h/api?a=1&_="), "{url}");
    }

    #[tokio::test]
    async fn test_static_mocks() {
        let mocks = StaticMocks::new().with("./mock/pay", json!({"success": true}));
        let payload = mocks.load("./mock/pay", &Vars::default()).await.unwrap();
        assert_eq!(payload, json!({"success": true}));
        let err = mocks.load("./mock/none", &Vars::default()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
